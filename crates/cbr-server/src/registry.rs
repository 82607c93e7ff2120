//! Client registry: configured bridge identities and their live connection
//! state.
//!
//! Membership is fixed at startup from configuration. A record persists for
//! the process lifetime; re-login replaces the bound connection handle, it
//! never creates a new record. All connection-state mutation goes through
//! the owning session's bind/release calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cbr_proto::Envelope;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientEntry;
use crate::correlator::PendingCall;
use crate::error::{Result, ServerError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The live endpoint of one authenticated session. Owned by the record it is
/// bound to; replaced wholesale on reconnect, never shared.
#[derive(Debug, Clone)]
pub struct Connection {
    pub session_id: SessionId,
    /// Outbound frames funnel through this channel into the session's single
    /// writer task, so one TCP write is never interleaved with another.
    pub sender: mpsc::UnboundedSender<Envelope>,
    /// Cancelled when a newer login supersedes this connection.
    pub cancel: CancellationToken,
    /// Free-form tag reported at login.
    pub client_type: String,
    /// Protocol library version reported at login.
    pub lib_version: String,
}

// SystemTime before the epoch does not occur on relay hosts
#[allow(clippy::cast_possible_truncation)]
fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One configured bridge identity and its live state.
pub struct ClientRecord {
    name: String,
    secret: String,
    configured_type: String,
    online: AtomicBool,
    last_ping_millis: AtomicU64,
    conn: Mutex<Option<Connection>>,
    pending_call: Mutex<Option<PendingCall>>,
    pending_pong: Mutex<Option<oneshot::Sender<()>>>,
}

impl ClientRecord {
    fn new(entry: &ClientEntry) -> Self {
        Self {
            name: entry.name.clone(),
            secret: entry.password.clone(),
            configured_type: entry.client_type.clone(),
            online: AtomicBool::new(false),
            last_ping_millis: AtomicU64::new(0),
            conn: Mutex::new(None),
            pending_call: Mutex::new(None),
            pending_pong: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn configured_type(&self) -> &str {
        &self.configured_type
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn mark_ping(&self) {
        self.last_ping_millis.store(epoch_millis(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn last_ping_millis(&self) -> u64 {
        self.last_ping_millis.load(Ordering::SeqCst)
    }

    /// Bind a new connection, returning the superseded one (if any) so the
    /// caller can cancel its session.
    pub async fn bind(&self, connection: Connection) -> Option<Connection> {
        let mut conn = self.conn.lock().await;
        let previous = conn.replace(connection);
        self.online.store(true, Ordering::SeqCst);
        previous
    }

    /// Release the connection, but only if `session_id` is still the bound
    /// one: a superseding reconnect must not be knocked offline by the old
    /// session's teardown. Returns whether the record went offline.
    pub async fn release(&self, session_id: &SessionId) -> bool {
        let mut conn = self.conn.lock().await;
        match conn.as_ref() {
            Some(current) if current.session_id == *session_id => {
                *conn = None;
                self.online.store(false, Ordering::SeqCst);
                drop(conn);
                self.drop_waiters().await;
                true
            }
            _ => false,
        }
    }

    /// Drop the record's connection unconditionally. Used when a write to it
    /// fails: the session is dead even if its teardown has not run yet.
    pub async fn force_offline(&self) {
        let mut conn = self.conn.lock().await;
        *conn = None;
        self.online.store(false, Ordering::SeqCst);
        drop(conn);
        self.drop_waiters().await;
    }

    /// Clear correlation slots; dropping the senders wakes any waiters with
    /// a closed-channel error.
    async fn drop_waiters(&self) {
        self.pending_call.lock().await.take();
        self.pending_pong.lock().await.take();
    }

    /// Clone the outbound sender of the bound connection.
    pub async fn sender(&self) -> Option<mpsc::UnboundedSender<Envelope>> {
        self.conn.lock().await.as_ref().map(|c| c.sender.clone())
    }

    /// Place a pending call into the correlation slot, returning the
    /// superseded one (if any).
    pub async fn put_call(&self, call: PendingCall) -> Option<PendingCall> {
        self.pending_call.lock().await.replace(call)
    }

    /// Take the pending call regardless of owner (reply arrived).
    pub async fn take_call(&self) -> Option<PendingCall> {
        self.pending_call.lock().await.take()
    }

    /// Take the pending call only if `ticket` still owns the slot.
    pub async fn take_call_if(&self, ticket: u64) -> Option<PendingCall> {
        let mut slot = self.pending_call.lock().await;
        if slot.as_ref().is_some_and(|c| c.ticket == ticket) {
            slot.take()
        } else {
            None
        }
    }

    /// Install a waiter for the next pong, replacing any stale one.
    pub async fn put_pong_waiter(&self, tx: oneshot::Sender<()>) {
        self.pending_pong.lock().await.replace(tx);
    }

    /// Complete an outstanding pong wait, if any.
    pub async fn complete_pong(&self) {
        if let Some(tx) = self.pending_pong.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("name", &self.name)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

/// Name-keyed directory of configured clients. Read-mostly after startup.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<ClientRecord>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn from_config(entries: &[ClientEntry]) -> Self {
        let mut clients = HashMap::new();
        for entry in entries {
            if clients
                .insert(entry.name.clone(), Arc::new(ClientRecord::new(entry)))
                .is_some()
            {
                warn!("Duplicate client name in config: {}", entry.name);
            } else {
                debug!("Registered client: {} ({})", entry.name, entry.client_type);
            }
        }
        info!("Client registry built with {} identities", clients.len());
        Self { clients }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ClientRecord>> {
        self.clients.get(name).cloned()
    }

    /// Validate login credentials against the configured identities.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::UnknownClient` or `ServerError::BadCredentials`;
    /// callers reply with the same "login fail" either way.
    pub fn authenticate(&self, name: &str, password: &str) -> Result<Arc<ClientRecord>> {
        let record = self
            .clients
            .get(name)
            .ok_or_else(|| ServerError::UnknownClient(name.to_string()))?;

        if record.secret != password {
            return Err(ServerError::BadCredentials(name.to_string()));
        }

        Ok(record.clone())
    }

    pub fn records(&self) -> impl Iterator<Item = &Arc<ClientRecord>> {
        self.clients.values()
    }

    #[must_use]
    pub fn online_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clients
            .values()
            .filter(|r| r.is_online())
            .map(|r| r.name().to_string())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
