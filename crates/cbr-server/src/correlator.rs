//! Request/response correlation for command and api calls.
//!
//! Calls are single-outstanding-per-target: each [`ClientRecord`] carries one
//! correlation slot. Issuing a new call while one is pending replaces the
//! slot and the superseded caller resolves immediately with
//! [`CallOutcome::Superseded`]. Concurrent calls to *different* targets are
//! independent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cbr_proto::{CallResult, Envelope};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::registry::ClientRecord;

static CALL_TICKET: AtomicU64 = AtomicU64::new(1);

fn next_ticket() -> u64 {
    CALL_TICKET.fetch_add(1, Ordering::SeqCst)
}

/// An in-flight outbound request occupying a record's correlation slot.
#[derive(Debug)]
pub struct PendingCall {
    pub ticket: u64,
    pub tx: oneshot::Sender<CallOutcome>,
}

/// How a call ended.
#[derive(Debug, PartialEq)]
pub enum CallOutcome {
    /// The target answered within the wait.
    Reply(CallResult),
    /// No reply arrived within the wait; the slot was cleared.
    Timeout,
    /// The target was offline (no frame sent) or dropped mid-call.
    Unreachable,
    /// A newer call to the same target replaced this one.
    Superseded,
}

impl CallOutcome {
    /// The reply payload, if the call succeeded.
    #[must_use]
    pub fn into_result(self) -> Option<CallResult> {
        match self {
            CallOutcome::Reply(result) => Some(result),
            _ => None,
        }
    }
}

/// Send `request` to `record` and wait for the correlated reply.
///
/// Returns [`CallOutcome::Unreachable`] immediately when the target is
/// offline. The slot is always cleared on the way out (unless a newer call
/// already owns it).
pub async fn call(record: &ClientRecord, request: Envelope, timeout: Duration) -> CallOutcome {
    let Some(sender) = record.sender().await else {
        debug!("[{}] call target unreachable", record.name());
        return CallOutcome::Unreachable;
    };

    let ticket = next_ticket();
    let (tx, rx) = oneshot::channel();

    if let Some(previous) = record.put_call(PendingCall { ticket, tx }).await {
        warn!(
            "[{}] overwriting pending call #{}",
            record.name(),
            previous.ticket
        );
        let _ = previous.tx.send(CallOutcome::Superseded);
    }

    if sender.send(request).is_err() {
        record.force_offline().await;
        record.take_call_if(ticket).await;
        return CallOutcome::Unreachable;
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        // Slot dropped without an answer: the session went away.
        Ok(Err(_)) => CallOutcome::Unreachable,
        Err(_) => {
            record.take_call_if(ticket).await;
            debug!("[{}] call #{} timed out", record.name(), ticket);
            CallOutcome::Timeout
        }
    }
}

/// Complete the record's pending call with an inbound reply.
pub async fn complete(record: &ClientRecord, result: CallResult) {
    if let Some(pending) = record.take_call().await {
        let _ = pending.tx.send(CallOutcome::Reply(result));
    } else {
        debug!("[{}] unsolicited reply dropped", record.name());
    }
}
