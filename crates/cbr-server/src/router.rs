//! Chat fan-out between bridge clients.
//!
//! Every inbound `message` frame is offered to the handler boundary first;
//! unless a handler suppresses delivery, it is forwarded to its receiver, or
//! broadcast to every other online client. Per-target write failures are
//! independent: one dead client never blocks delivery to the rest.

use cbr_proto::Envelope;
use tracing::{debug, warn};

use crate::plugin::MessageEvent;
use crate::registry::{ClientRecord, ClientRegistry};
use crate::server::ServerState;

/// Route one inbound chat message from `origin`.
pub async fn route_chat(
    state: &ServerState,
    origin: &str,
    client: String,
    player: String,
    message: String,
    receiver: String,
) {
    let event = MessageEvent::new(client.clone(), player.clone(), message.clone());
    if state
        .plugins
        .dispatch_message(state.relay_context(), event)
        .await
    {
        debug!("[{origin}] broadcast suppressed by handler");
        return;
    }

    let envelope = Envelope::Message {
        client,
        player,
        message,
        receiver: receiver.clone(),
    };

    if receiver.is_empty() {
        broadcast(&state.registry, origin, envelope).await;
    } else if let Some(record) = state.registry.get(&receiver) {
        deliver(&record, envelope).await;
    } else {
        debug!("[{origin}] message for unknown receiver: {receiver}");
    }
}

/// Deliver `envelope` to every online client except `exclude`.
pub async fn broadcast(registry: &ClientRegistry, exclude: &str, envelope: Envelope) {
    for record in registry.records() {
        if record.name() == exclude || !record.is_online() {
            continue;
        }
        deliver(record, envelope.clone()).await;
    }
}

/// Deliver one frame, flipping the target offline on failure.
async fn deliver(record: &ClientRecord, envelope: Envelope) {
    if !record.is_online() {
        debug!("[{}] skipping offline target", record.name());
        return;
    }

    let Some(sender) = record.sender().await else {
        return;
    };

    if sender.send(envelope).is_err() {
        warn!("[{}] delivery failed, marking offline", record.name());
        record.force_offline().await;
    }
}
