//! Bridge-client session loop and public API.
//!
//! [`RelayClient`] owns the connection lifecycle: connect, log in, run the
//! read loop, and hand control to the reconnect guardian when the link
//! drops. Connection status travels through a `watch` channel carrying an
//! explicit [`ConnState`]; the read loop, the keepalive guardian, and the
//! reconnect guardian never share raw flags.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cbr_proto::{
    CallResult, Decoded, Envelope, FrameCodec, LOGIN_SUCCESS, PingKind, SessionCipher,
    result_kind,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::guardian::{self, IdleClock, ReconnectGuardian};

/// Grace period for the writer task to flush before it is aborted.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection status, observable through [`RelayClient::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection settings for one bridge identity.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub name: String,
    pub password: String,
    /// Free-form tag reported at login, e.g. "mc" or "cqhttp".
    pub client_type: String,
    /// Shared passphrase; empty selects the codec's plaintext mode.
    pub aes_key: String,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    /// Wait for the login reply and for one-shot ping probes.
    pub reply_timeout: Duration,
}

impl ClientOptions {
    #[must_use]
    pub fn new(
        server_addr: impl Into<String>,
        name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            name: name.into(),
            password: password.into(),
            client_type: String::new(),
            aes_key: String::new(),
            idle_timeout: Duration::from_secs(120),
            ping_interval: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(2),
        }
    }
}

/// Bridge-side protocol callbacks. The client answers `command`/`api`
/// requests through these; it never initiates calls of its own.
///
/// Callbacks run on the session's read task; long work belongs on a task of
/// the implementor's own.
pub trait BridgeHandler: Send + Sync {
    fn on_chat(&self, _client: &str, _player: &str, _message: &str) {}

    fn on_command(&self, _command: &str) -> CallResult {
        CallResult::answered(result_kind::UNSUPPORTED, Value::Null)
    }

    fn on_api(&self, _plugin: &str, _function: &str, _keys: &[Value]) -> CallResult {
        CallResult::answered(result_kind::UNSUPPORTED, Value::Null)
    }
}

/// Handler that ignores chat and answers every call as unsupported.
pub struct NoopHandler;

impl BridgeHandler for NoopHandler {}

/// State shared between the session loop, the guardians, and the public
/// API surface.
pub(crate) struct ClientShared {
    pub(crate) options: ClientOptions,
    pub(crate) cipher: Arc<SessionCipher>,
    pub(crate) handler: Arc<dyn BridgeHandler>,
    pub(crate) state_tx: watch::Sender<ConnState>,
    pub(crate) outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pub(crate) stopping: AtomicBool,
    pub(crate) pending_pong: Mutex<Option<oneshot::Sender<()>>>,
}

impl ClientShared {
    pub(crate) fn new(options: ClientOptions, handler: Arc<dyn BridgeHandler>) -> Arc<Self> {
        let cipher = Arc::new(SessionCipher::new(&options.aes_key));
        let (state_tx, _) = watch::channel(ConnState::Disconnected);
        Arc::new(Self {
            options,
            cipher,
            handler,
            state_tx,
            outbound: Mutex::new(None),
            stopping: AtomicBool::new(false),
            pending_pong: Mutex::new(None),
        })
    }

    pub(crate) fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_stopping(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) async fn outbound_sender(&self) -> Option<mpsc::UnboundedSender<Envelope>> {
        self.outbound.lock().await.clone()
    }

    pub(crate) async fn complete_pong(&self) {
        if let Some(tx) = self.pending_pong.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Why a session ended.
pub(crate) enum SessionEnd {
    /// User- or server-requested stop; the guardian must not reconnect.
    Stopped,
    /// Transport loss or idle timeout; the guardian takes over.
    Disconnected,
}

/// Run one complete session: connect, log in, dispatch until the link ends.
///
/// `cancel` belongs to the reconnect guardian; it interrupts both the
/// connect attempt and the read loop.
pub(crate) async fn run_session(
    shared: Arc<ClientShared>,
    cancel: CancellationToken,
) -> Result<SessionEnd> {
    let result = establish_and_run(&shared, &cancel).await;

    *shared.outbound.lock().await = None;
    shared.pending_pong.lock().await.take();
    let _ = shared.state_tx.send(ConnState::Disconnected);

    result
}

fn end_for_cancel(shared: &ClientShared) -> SessionEnd {
    if shared.is_stopping() {
        SessionEnd::Stopped
    } else {
        SessionEnd::Disconnected
    }
}

async fn establish_and_run(
    shared: &Arc<ClientShared>,
    cancel: &CancellationToken,
) -> Result<SessionEnd> {
    let _ = shared.state_tx.send(ConnState::Connecting);
    let addr = &shared.options.server_addr;

    let stream = tokio::select! {
        () = cancel.cancelled() => return Ok(end_for_cancel(shared)),
        connected = TcpStream::connect(addr) => connected?,
    };
    debug!("[{}] connected to {addr}", shared.options.name);

    let framed = Framed::new(stream, FrameCodec::new(shared.cipher.clone()));
    let (mut sink, mut stream) = framed.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if sink.send(envelope).await.is_err() {
                break;
            }
        }
    });

    let outcome = login_and_dispatch(shared, cancel, &tx, &mut stream).await;

    drop(tx);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    outcome
}

type FrameStream = futures_util::stream::SplitStream<Framed<TcpStream, FrameCodec>>;

async fn login_and_dispatch(
    shared: &Arc<ClientShared>,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<Envelope>,
    stream: &mut FrameStream,
) -> Result<SessionEnd> {
    let options = &shared.options;
    let login = Envelope::login(&options.name, &options.password, &options.client_type);
    tx.send(login).map_err(|_| ClientError::ConnectionClosed)?;

    let reply = tokio::time::timeout(options.reply_timeout, stream.next()).await;
    match reply {
        Ok(Some(Ok(Decoded::Envelope(Envelope::Result { result })))) => {
            if result != LOGIN_SUCCESS {
                return Err(ClientError::Auth(result));
            }
        }
        Ok(Some(Ok(Decoded::Envelope(other)))) => {
            return Err(ClientError::Auth(format!(
                "unexpected {} before login reply",
                other.action()
            )));
        }
        // Unreadable reply during login usually means a key mismatch.
        Ok(Some(Ok(Decoded::Corrupt(e)))) => {
            return Err(ClientError::Auth(format!("unreadable login reply: {e}")));
        }
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Err(ClientError::ConnectionClosed),
        Err(_) => return Err(ClientError::Timeout),
    }

    *shared.outbound.lock().await = Some(tx.clone());
    let _ = shared.state_tx.send(ConnState::Connected);
    info!("[{}] logged in to {}", options.name, options.server_addr);

    let clock = IdleClock::new();
    let keepalive = guardian::spawn_keepalive(tx.clone(), clock.clone(), options.ping_interval);

    let end = read_loop(shared, cancel, tx, stream, &clock).await;

    keepalive.abort();
    Ok(end)
}

async fn read_loop(
    shared: &Arc<ClientShared>,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<Envelope>,
    stream: &mut FrameStream,
    clock: &Arc<IdleClock>,
) -> SessionEnd {
    let name = &shared.options.name;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                if shared.is_stopping() {
                    // Best-effort goodbye; the writer flushes on teardown.
                    let _ = tx.send(Envelope::Stop);
                    return SessionEnd::Stopped;
                }
                return SessionEnd::Disconnected;
            }
            next = tokio::time::timeout(shared.options.idle_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                info!("[{name}] idle timeout, dropping connection");
                return SessionEnd::Disconnected;
            }
            Ok(None) => {
                info!("[{name}] server closed the connection");
                return SessionEnd::Disconnected;
            }
            Ok(Some(Err(e))) => {
                warn!("[{name}] framing error: {e}");
                return SessionEnd::Disconnected;
            }
            Ok(Some(Ok(Decoded::Corrupt(e)))) => {
                if e.is_protocol_violation() {
                    warn!("[{name}] unrecognized envelope, dropping connection: {e}");
                    return SessionEnd::Disconnected;
                }
                warn!("[{name}] corrupt frame dropped: {e}");
            }
            Ok(Some(Ok(Decoded::Envelope(envelope)))) => {
                clock.touch();
                if let Some(end) = dispatch(shared, tx, envelope).await {
                    return end;
                }
            }
        }
    }
}

/// Classify one inbound frame. Returns `Some` when the session must end.
async fn dispatch(
    shared: &Arc<ClientShared>,
    tx: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) -> Option<SessionEnd> {
    let name = &shared.options.name;

    match envelope {
        Envelope::Message {
            client,
            player,
            message,
            ..
        } => {
            shared.handler.on_chat(&client, &player, &message);
            None
        }

        Envelope::KeepAlive {
            kind: PingKind::Ping,
        } => {
            if tx.send(Envelope::pong()).is_err() {
                return Some(SessionEnd::Disconnected);
            }
            None
        }

        Envelope::KeepAlive {
            kind: PingKind::Pong,
        } => {
            shared.complete_pong().await;
            None
        }

        Envelope::Command {
            sender, command, result, ..
        } => {
            if result.responded {
                debug!("[{name}] stray command reply ignored");
                return None;
            }
            let answer = shared.handler.on_command(&command);
            let reply = Envelope::command_reply(name.clone(), sender, command, answer);
            if tx.send(reply).is_err() {
                return Some(SessionEnd::Disconnected);
            }
            None
        }

        Envelope::Api {
            sender,
            plugin,
            function,
            keys,
            result,
            ..
        } => {
            if result.responded {
                debug!("[{name}] stray api reply ignored");
                return None;
            }
            let answer = shared.handler.on_api(&plugin, &function, &keys);
            let reply = Envelope::api_reply(name.clone(), sender, plugin, function, answer);
            if tx.send(reply).is_err() {
                return Some(SessionEnd::Disconnected);
            }
            None
        }

        Envelope::Stop => {
            info!("[{name}] server requested stop");
            Some(SessionEnd::Stopped)
        }

        Envelope::Result { result } => {
            debug!("[{name}] stray result frame ignored: {result}");
            None
        }

        Envelope::Login { .. } => {
            warn!("[{name}] server sent login, closing");
            Some(SessionEnd::Disconnected)
        }
    }
}

/// A bridge client with automatic reconnection.
pub struct RelayClient {
    shared: Arc<ClientShared>,
    guardian: ReconnectGuardian,
}

impl RelayClient {
    /// Create a client; no I/O happens until [`start`](Self::start).
    #[must_use]
    pub fn new(options: ClientOptions, handler: Arc<dyn BridgeHandler>) -> Self {
        let shared = ClientShared::new(options, handler);
        let guardian = ReconnectGuardian::spawn(shared.clone());
        Self { shared, guardian }
    }

    /// Connect now; on failure or later disconnect the reconnect guardian
    /// retries on its backoff schedule.
    pub fn start(&self) {
        self.guardian.start();
    }

    /// Stop the client and its guardians. Idempotent.
    pub fn stop(&self) {
        self.guardian.stop();
    }

    /// Drop the current connection (or wait) and reconnect from the start
    /// of the backoff schedule.
    pub fn restart(&self) {
        self.guardian.restart();
    }

    /// Observe connection state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the client is connected and logged in.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionClosed` if the client shuts down
    /// before reaching the connected state.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state();
        rx.wait_for(|s| *s == ConnState::Connected)
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(())
    }

    /// Send a broadcast chat message as this bridge.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotConnected` when no session is live.
    pub async fn send_chat(&self, player: &str, message: &str) -> Result<()> {
        self.send(Envelope::chat(self.shared.options.name.clone(), player, message))
            .await
    }

    /// Send a chat message to one named client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotConnected` when no session is live.
    pub async fn send_direct(&self, player: &str, message: &str, receiver: &str) -> Result<()> {
        self.send(Envelope::direct_chat(
            self.shared.options.name.clone(),
            player,
            message,
            receiver,
        ))
        .await
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let sender = self
            .shared
            .outbound_sender()
            .await
            .ok_or(ClientError::NotConnected)?;
        sender.send(envelope).map_err(|_| ClientError::NotConnected)
    }

    /// One-shot liveness probe: ping the server and wait for the pong.
    /// Returns the round trip, or `None` for no response.
    pub async fn probe(&self) -> Option<Duration> {
        let sender = self.shared.outbound_sender().await?;

        let (pong_tx, pong_rx) = oneshot::channel();
        self.shared.pending_pong.lock().await.replace(pong_tx);

        let started = tokio::time::Instant::now();
        sender.send(Envelope::ping()).ok()?;

        match tokio::time::timeout(self.shared.options.reply_timeout, pong_rx).await {
            Ok(Ok(())) => Some(started.elapsed()),
            _ => None,
        }
    }

    /// Stop and wait for the guardian task to finish.
    pub async fn shutdown(self) {
        self.guardian.stop();
        self.guardian.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = ClientOptions::new("127.0.0.1:30001", "survival", "pw");
        assert_eq!(options.idle_timeout, Duration::from_secs(120));
        assert_eq!(options.ping_interval, Duration::from_secs(60));
        assert_eq!(options.reply_timeout, Duration::from_secs(2));
        assert!(options.aes_key.is_empty());
    }

    #[test]
    fn test_noop_handler_answers_unsupported() {
        let handler = NoopHandler;
        let result = handler.on_command("list");
        assert!(result.responded);
        assert_eq!(result.kind, Some(result_kind::UNSUPPORTED));

        let result = handler.on_api("whitelist", "add", &[]);
        assert_eq!(result.kind, Some(result_kind::UNSUPPORTED));
    }

    #[tokio::test]
    async fn test_send_chat_requires_connection() {
        let client = RelayClient::new(
            ClientOptions::new("127.0.0.1:1", "survival", "pw"),
            Arc::new(NoopHandler),
        );
        let err = client.send_chat("Steve", "hi").await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let client = RelayClient::new(
            ClientOptions::new("127.0.0.1:1", "survival", "pw"),
            Arc::new(NoopHandler),
        );
        assert_eq!(*client.state().borrow(), ConnState::Disconnected);
        client.shutdown().await;
    }
}
