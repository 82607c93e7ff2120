//! Event dispatch boundary for externally supplied handlers.
//!
//! Handlers implement [`EventHandler`] and live in a [`HandlerRegistry`]
//! behind a version-counted whole-set swap. Every invocation runs in its own
//! task under a wall-clock budget; a panicking, failing, or overrunning
//! handler is logged and isolated - it can never take down the router or a
//! sibling handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cbr_proto::{CallResult, Envelope};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, warn};

use crate::correlator::{self, CallOutcome};
use crate::registry::ClientRegistry;

/// Wall-clock budget for one handler invocation.
const HANDLER_BUDGET: Duration = Duration::from_secs(1);

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Capability interface handed to every handler invocation.
#[derive(Clone)]
pub struct RelayContext {
    registry: Arc<ClientRegistry>,
    server_name: String,
    call_timeout: Duration,
}

impl RelayContext {
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry>, server_name: String, call_timeout: Duration) -> Self {
        Self {
            registry,
            server_name,
            call_timeout,
        }
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[must_use]
    pub fn online_clients(&self) -> Vec<String> {
        self.registry.online_names()
    }

    /// Send a chat frame originating from the relay itself. An empty
    /// `receiver` delivers to every online client.
    pub async fn send_chat(&self, player: &str, message: &str, receiver: &str) {
        let envelope = Envelope::direct_chat(self.server_name.clone(), player, message, receiver);
        if receiver.is_empty() {
            for record in self.registry.records() {
                if !record.is_online() {
                    continue;
                }
                if let Some(sender) = record.sender().await
                    && sender.send(envelope.clone()).is_err()
                {
                    warn!("[{}] chat delivery failed", record.name());
                    record.force_offline().await;
                }
            }
        } else if let Some(record) = self.registry.get(receiver) {
            if let Some(sender) = record.sender().await
                && sender.send(envelope).is_err()
            {
                warn!("[{}] chat delivery failed", record.name());
                record.force_offline().await;
            }
        } else {
            debug!("chat receiver not configured: {receiver}");
        }
    }

    /// Issue a `command` call to a target client.
    pub async fn call_command(&self, target: &str, command: &str) -> CallOutcome {
        let Some(record) = self.registry.get(target) else {
            return CallOutcome::Unreachable;
        };
        let request = Envelope::command_request(self.server_name.clone(), target, command);
        correlator::call(&record, request, self.call_timeout).await
    }

    /// Issue an `api` call to a target client.
    pub async fn call_api(
        &self,
        target: &str,
        plugin: &str,
        function: &str,
        keys: Vec<Value>,
    ) -> CallOutcome {
        let Some(record) = self.registry.get(target) else {
            return CallOutcome::Unreachable;
        };
        let request =
            Envelope::api_request(self.server_name.clone(), target, plugin, function, keys);
        correlator::call(&record, request, self.call_timeout).await
    }
}

/// An inbound chat message as seen by handlers. Cloned per handler; the
/// cancellation flag is shared so any handler can suppress the default
/// broadcast.
#[derive(Clone)]
pub struct MessageEvent {
    pub client: String,
    pub player: String,
    pub message: String,
    cancelled: Arc<AtomicBool>,
}

impl MessageEvent {
    #[must_use]
    pub fn new(client: String, player: String, message: String) -> Self {
        Self {
            client,
            player,
            message,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Suppress the default broadcast of this message.
    pub fn cancel_delivery(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// An inbound `command`/`api` request addressed to the relay.
#[derive(Clone)]
pub struct CommandEvent {
    pub sender: String,
    pub reply: ReplyHandle,
    request: Envelope,
}

impl CommandEvent {
    #[must_use]
    pub fn new(sender: String, request: Envelope, reply: ReplyHandle) -> Self {
        Self {
            sender,
            reply,
            request,
        }
    }

    /// The command string, for `command` requests.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match &self.request {
            Envelope::Command { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Plugin, function and argument list, for `api` requests.
    #[must_use]
    pub fn api(&self) -> Option<(&str, &str, &[Value])> {
        match &self.request {
            Envelope::Api {
                plugin,
                function,
                keys,
                ..
            } => Some((plugin, function, keys)),
            _ => None,
        }
    }
}

/// Answers an inbound request on behalf of the relay. Replies route through
/// the requesting session's writer channel.
#[derive(Clone)]
pub struct ReplyHandle {
    server_name: String,
    requester: String,
    request: Envelope,
    sender: mpsc::UnboundedSender<Envelope>,
}

impl ReplyHandle {
    #[must_use]
    pub fn new(
        server_name: String,
        requester: String,
        request: Envelope,
        sender: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            server_name,
            requester,
            request,
            sender,
        }
    }

    /// Send the reply envelope matching the original request shape.
    pub fn reply(&self, result: CallResult) {
        let envelope = match &self.request {
            Envelope::Command { command, .. } => Envelope::command_reply(
                self.server_name.clone(),
                self.requester.clone(),
                command.clone(),
                result,
            ),
            Envelope::Api {
                plugin, function, ..
            } => Envelope::api_reply(
                self.server_name.clone(),
                self.requester.clone(),
                plugin.clone(),
                function.clone(),
                result,
            ),
            _ => return,
        };

        if self.sender.send(envelope).is_err() {
            debug!("[{}] reply dropped, session gone", self.requester);
        }
    }
}

/// Externally supplied event handler. Implementations clone what they need
/// into the returned future; invocations are bounded and fault-isolated.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn on_load(&self, _ctx: RelayContext) -> HandlerFuture {
        Box::pin(async { Ok(()) })
    }

    fn on_message(&self, _ctx: RelayContext, _event: MessageEvent) -> HandlerFuture {
        Box::pin(async { Ok(()) })
    }

    fn on_command(&self, _ctx: RelayContext, _event: CommandEvent) -> HandlerFuture {
        Box::pin(async { Ok(()) })
    }
}

struct HandlerSet {
    version: u64,
    handlers: Vec<Arc<dyn EventHandler>>,
}

/// Registry of installed handlers. The whole set is swapped atomically and
/// the version bumped; in-flight dispatches keep running against the
/// snapshot they started with.
pub struct HandlerRegistry {
    inner: RwLock<HandlerSet>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HandlerSet {
                version: 0,
                handlers: Vec::new(),
            }),
        }
    }

    /// Replace the installed handler set, returning the new version.
    pub async fn install(&self, handlers: Vec<Arc<dyn EventHandler>>) -> u64 {
        let mut inner = self.inner.write().await;
        inner.version += 1;
        inner.handlers = handlers;
        debug!(
            "handler set v{} installed ({} handlers)",
            inner.version,
            inner.handlers.len()
        );
        inner.version
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    async fn snapshot(&self) -> Vec<Arc<dyn EventHandler>> {
        self.inner.read().await.handlers.clone()
    }

    /// Invoke `on_load` on every handler.
    pub async fn dispatch_load(&self, ctx: RelayContext) {
        self.invoke_all("onLoad", |handler| handler.on_load(ctx.clone()))
            .await;
    }

    /// Offer a chat message to every handler. Returns `true` when a handler
    /// cancelled the default broadcast.
    pub async fn dispatch_message(&self, ctx: RelayContext, event: MessageEvent) -> bool {
        self.invoke_all("onMessage", |handler| {
            handler.on_message(ctx.clone(), event.clone())
        })
        .await;
        event.is_cancelled()
    }

    /// Hand an inbound command/api request to every handler.
    pub async fn dispatch_command(&self, ctx: RelayContext, event: CommandEvent) {
        self.invoke_all("onCommand", |handler| {
            handler.on_command(ctx.clone(), event.clone())
        })
        .await;
    }

    async fn invoke_all<F>(&self, label: &str, make: F)
    where
        F: Fn(&Arc<dyn EventHandler>) -> HandlerFuture,
    {
        let handlers = self.snapshot().await;
        let mut invocations = Vec::with_capacity(handlers.len());

        for handler in &handlers {
            let name = handler.name().to_string();
            let fut = make(handler);
            invocations.push((
                name,
                tokio::spawn(tokio::time::timeout(HANDLER_BUDGET, fut)),
            ));
        }

        for (name, invocation) in invocations {
            match invocation.await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("handler {name} {label} failed: {e}"),
                Ok(Err(_)) => warn!("handler {name} {label} exceeded {HANDLER_BUDGET:?} budget"),
                Err(e) if e.is_panic() => error!("handler {name} {label} panicked"),
                Err(_) => {}
            }
        }
    }
}
