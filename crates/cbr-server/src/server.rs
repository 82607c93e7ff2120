//! TCP server: accept loop and per-connection session state machine.
//!
//! Each accepted connection runs one session task through three states:
//! unauthenticated (only `login` is accepted), authenticated (frames are
//! classified by action and dispatched), closed. A session's writes funnel
//! through a single writer task so frames are never interleaved, and a
//! superseding login cancels the old session without marking the client
//! offline.

use std::sync::Arc;
use std::time::Duration;

use cbr_proto::{Decoded, Envelope, FrameCodec, LIB_VERSION, SessionCipher};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::correlator::{self, CallOutcome};
use crate::error::Result;
use crate::liveness::{self, Activity};
use crate::plugin::{CommandEvent, HandlerRegistry, RelayContext, ReplyHandle};
use crate::registry::{ClientRecord, ClientRegistry, Connection, SessionId};
use crate::router;

/// Grace period for the writer task to flush before it is aborted.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Arc<ClientRegistry>,
    pub plugins: HandlerRegistry,
    cipher: Arc<SessionCipher>,
}

impl ServerState {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ClientRegistry::from_config(&config.clients));
        let cipher = Arc::new(config.cipher());
        Self {
            config,
            registry,
            plugins: HandlerRegistry::new(),
            cipher,
        }
    }

    #[must_use]
    pub fn relay_context(&self) -> RelayContext {
        RelayContext::new(
            self.registry.clone(),
            self.config.name.clone(),
            self.config.call_timeout(),
        )
    }

    /// Issue a `command` call to a named client.
    pub async fn call_command(&self, target: &str, command: &str) -> CallOutcome {
        self.relay_context().call_command(target, command).await
    }

    /// Issue an `api` call to a named client.
    pub async fn call_api(
        &self,
        target: &str,
        plugin: &str,
        function: &str,
        keys: Vec<serde_json::Value>,
    ) -> CallOutcome {
        self.relay_context()
            .call_api(target, plugin, function, keys)
            .await
    }

    /// One-shot liveness probe against a named client.
    pub async fn probe(&self, target: &str) -> Option<Duration> {
        let record = self.registry.get(target)?;
        liveness::probe(&record, self.config.call_timeout()).await
    }
}

/// Bind the configured listen address and serve forever.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run(state: Arc<ServerState>) -> Result<()> {
    let listener = TcpListener::bind(state.config.listen_addr()).await?;
    info!("Relay listening on {}", listener.local_addr()?);
    serve(listener, state).await
}

/// Serve connections from an already-bound listener.
///
/// # Errors
///
/// Returns an error if the listener breaks irrecoverably.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    state.plugins.dispatch_load(state.relay_context()).await;

    info!("Ready to accept connections");
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {addr}");
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        error!("Connection error: {e}");
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {e}");
            }
        }
    }
}

/// Why an authenticated session loop ended.
enum SessionEnd {
    /// Transport closed, idle timeout, or protocol violation.
    Disconnected,
    /// Peer sent `stop`.
    PeerStopped,
    /// A newer login took over this client.
    Superseded,
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let framed = Framed::new(stream, FrameCodec::new(state.cipher.clone()));
    let (mut sink, mut stream) = framed.split();

    let session_id = SessionId::new();
    debug!("New connection: {session_id}");

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    let session_id_clone = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = sink.send(envelope).await {
                warn!("[{session_id_clone}] write failed: {e}");
                break;
            }
        }
    });

    let idle_timeout = state.config.idle_timeout();

    // Unauthenticated: the only accepted envelope is login.
    let login = tokio::time::timeout(idle_timeout, stream.next()).await;
    let (record, cancel) = match login {
        Ok(Some(Ok(Decoded::Envelope(Envelope::Login {
            name,
            password,
            lib_version,
            client_type,
        })))) => match state.registry.authenticate(&name, &password) {
            Ok(record) => {
                if lib_version != LIB_VERSION {
                    warn!(
                        "[{name}] protocol version mismatch: client {lib_version}, server {LIB_VERSION}"
                    );
                }

                let cancel = CancellationToken::new();
                let previous = record
                    .bind(Connection {
                        session_id: session_id.clone(),
                        sender: tx.clone(),
                        cancel: cancel.clone(),
                        client_type,
                        lib_version,
                    })
                    .await;

                if let Some(previous) = previous {
                    info!("[{name}] reconnect supersedes session {}", previous.session_id);
                    previous.cancel.cancel();
                }

                let _ = tx.send(Envelope::login_result(true));
                info!("[{name}] logged in ({session_id})");
                (record, cancel)
            }
            Err(e) => {
                warn!("Login rejected: {e}");
                let _ = tx.send(Envelope::login_result(false));
                drop(tx);
                finish_writer(&mut send_task).await;
                return Ok(());
            }
        },
        Ok(Some(Ok(Decoded::Envelope(other)))) => {
            warn!("[{session_id}] first frame was {}, closing", other.action());
            drop(tx);
            finish_writer(&mut send_task).await;
            return Ok(());
        }
        Ok(Some(Ok(Decoded::Corrupt(e)))) => {
            // Corruption before authentication: likely a key mismatch.
            warn!("[{session_id}] corrupt frame during login: {e}");
            drop(tx);
            finish_writer(&mut send_task).await;
            return Ok(());
        }
        Ok(Some(Err(e))) => {
            warn!("[{session_id}] framing error during login: {e}");
            drop(tx);
            finish_writer(&mut send_task).await;
            return Ok(());
        }
        Ok(None) | Err(_) => {
            debug!("[{session_id}] closed before login");
            drop(tx);
            finish_writer(&mut send_task).await;
            return Ok(());
        }
    };

    // Authenticated: dispatch frames until the session ends.
    let activity = Activity::new();
    let keepalive = liveness::spawn_keepalive(
        tx.clone(),
        activity.clone(),
        state.config.ping_interval(),
    );

    let end = authenticated_loop(
        &state,
        &record,
        &tx,
        &mut stream,
        &cancel,
        &activity,
        idle_timeout,
    )
    .await;

    keepalive.abort();

    match end {
        SessionEnd::Superseded => {
            debug!("[{}] superseded session {session_id} closed", record.name());
        }
        SessionEnd::PeerStopped | SessionEnd::Disconnected => {
            if record.release(&session_id).await {
                info!("[{}] offline ({session_id})", record.name());
            }
        }
    }

    drop(tx);
    finish_writer(&mut send_task).await;

    Ok(())
}

async fn authenticated_loop(
    state: &Arc<ServerState>,
    record: &Arc<ClientRecord>,
    tx: &mpsc::UnboundedSender<Envelope>,
    stream: &mut futures_util::stream::SplitStream<Framed<TcpStream, FrameCodec>>,
    cancel: &CancellationToken,
    activity: &Arc<Activity>,
    idle_timeout: Duration,
) -> SessionEnd {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Superseded,
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                info!("[{}] idle timeout, closing", record.name());
                return SessionEnd::Disconnected;
            }
            Ok(None) => {
                debug!("[{}] connection closed", record.name());
                return SessionEnd::Disconnected;
            }
            Ok(Some(Err(e))) => {
                warn!("[{}] framing error: {e}", record.name());
                return SessionEnd::Disconnected;
            }
            Ok(Some(Ok(Decoded::Corrupt(e)))) => {
                if e.is_protocol_violation() {
                    warn!("[{}] unrecognized envelope, closing: {e}", record.name());
                    return SessionEnd::Disconnected;
                }
                // Authenticated peers keep their session; the frame is lost.
                warn!("[{}] corrupt frame dropped: {e}", record.name());
            }
            Ok(Some(Ok(Decoded::Envelope(envelope)))) => {
                activity.touch();
                if let Some(end) = dispatch(state, record, tx, envelope).await {
                    return end;
                }
            }
        }
    }
}

/// Classify one authenticated frame. Returns `Some` when the session must
/// end.
async fn dispatch(
    state: &Arc<ServerState>,
    record: &Arc<ClientRecord>,
    tx: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) -> Option<SessionEnd> {
    match envelope {
        Envelope::KeepAlive {
            kind: cbr_proto::PingKind::Ping,
        } => {
            record.mark_ping();
            if tx.send(Envelope::pong()).is_err() {
                return Some(SessionEnd::Disconnected);
            }
            None
        }

        Envelope::KeepAlive {
            kind: cbr_proto::PingKind::Pong,
        } => {
            record.complete_pong().await;
            None
        }

        Envelope::Message {
            client,
            player,
            message,
            receiver,
        } => {
            router::route_chat(state, record.name(), client, player, message, receiver).await;
            None
        }

        reply @ (Envelope::Command { .. } | Envelope::Api { .. }) if reply.is_reply() => {
            if let Envelope::Command { result, .. } | Envelope::Api { result, .. } = reply {
                correlator::complete(record, result).await;
            }
            None
        }

        request @ (Envelope::Command { .. } | Envelope::Api { .. }) => {
            // A request addressed to the relay: hand it to the handlers.
            let reply = ReplyHandle::new(
                state.config.name.clone(),
                record.name().to_string(),
                request.clone(),
                tx.clone(),
            );
            let event = CommandEvent::new(record.name().to_string(), request, reply);
            state
                .plugins
                .dispatch_command(state.relay_context(), event)
                .await;
            None
        }

        Envelope::Stop => {
            info!("[{}] peer requested stop", record.name());
            Some(SessionEnd::PeerStopped)
        }

        Envelope::Login { .. } => {
            warn!("[{}] login on authenticated session, closing", record.name());
            Some(SessionEnd::Disconnected)
        }

        Envelope::Result { result } => {
            debug!("[{}] stray result frame ignored: {result}", record.name());
            None
        }
    }
}

/// Let the writer drain briefly, then abort it.
async fn finish_writer(send_task: &mut tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut *send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}
