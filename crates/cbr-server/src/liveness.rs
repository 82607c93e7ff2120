//! Keepalive probing for authenticated sessions.
//!
//! Each session runs one keepalive task: after `ping_interval` of inbound
//! silence it sends `keepAlive ping`; the peer answers `pong`. Separately,
//! [`probe`] is a one-shot liveness check reporting round-trip latency.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cbr_proto::Envelope;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::registry::ClientRecord;

/// Inbound-traffic clock shared between a session's read loop and its
/// keepalive task.
#[derive(Debug)]
pub struct Activity {
    started: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
        })
    }

    /// Record inbound traffic now.
    // Session lifetimes are far below u64 milliseconds
    #[allow(clippy::cast_possible_truncation)]
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_millis.store(elapsed, Ordering::SeqCst);
    }

    /// Time since the last inbound frame.
    // Session lifetimes are far below u64 milliseconds
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn idle(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_millis.load(Ordering::SeqCst);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// Spawn the per-session keepalive task. It ends on its own once the
/// session's writer channel closes; the session aborts it on teardown.
pub fn spawn_keepalive(
    sender: mpsc::UnboundedSender<Envelope>,
    activity: Arc<Activity>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;

            if activity.idle() < interval {
                trace!("keepalive skipped, connection active");
                continue;
            }

            if sender.send(Envelope::ping()).is_err() {
                break;
            }
        }

        debug!("keepalive task ended");
    })
}

/// One-shot liveness probe: send a ping and wait up to `timeout` for the
/// matching pong. Returns the round trip, or `None` for no response or an
/// offline target.
pub async fn probe(record: &ClientRecord, timeout: Duration) -> Option<Duration> {
    let sender = record.sender().await?;

    let (tx, rx) = oneshot::channel();
    record.put_pong_waiter(tx).await;

    let started = Instant::now();
    if sender.send(Envelope::ping()).is_err() {
        record.force_offline().await;
        return None;
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(())) => Some(started.elapsed()),
        _ => {
            debug!("[{}] probe got no pong", record.name());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientEntry;
    use crate::registry::{ClientRegistry, Connection, SessionId};
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(2);

    async fn online_record() -> (
        Arc<ClientRecord>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let registry = ClientRegistry::from_config(&[ClientEntry {
            name: "survival".to_string(),
            password: "pw".to_string(),
            client_type: String::new(),
        }]);
        let record = registry.get("survival").unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        record
            .bind(Connection {
                session_id: SessionId::new(),
                sender: tx,
                cancel: CancellationToken::new(),
                client_type: String::new(),
                lib_version: cbr_proto::LIB_VERSION.to_string(),
            })
            .await;
        (record, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_fires_when_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let activity = Activity::new();
        let task = spawn_keepalive(tx, activity, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rx.recv().await.unwrap(), Envelope::ping());

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_suppressed_by_traffic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let activity = Activity::new();
        let task = spawn_keepalive(tx, activity.clone(), Duration::from_secs(60));

        // Touch the activity clock every 30s; no ping should be sent.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            activity.touch();
        }
        assert!(rx.try_recv().is_err());

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_stops_on_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = Activity::new();
        let task = spawn_keepalive(tx, activity, Duration::from_secs(60));

        drop(rx);
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_probe_round_trip() {
        let (record, mut rx) = online_record().await;

        let pong_task = {
            let record = record.clone();
            tokio::spawn(async move {
                assert_eq!(rx.recv().await.unwrap(), Envelope::ping());
                record.complete_pong().await;
            })
        };

        let latency = probe(&record, WAIT).await;
        pong_task.await.unwrap();
        assert!(latency.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_no_response() {
        let (record, _rx) = online_record().await;
        assert_eq!(probe(&record, WAIT).await, None);
    }

    #[tokio::test]
    async fn test_probe_offline_target() {
        let registry = ClientRegistry::from_config(&[ClientEntry {
            name: "survival".to_string(),
            password: "pw".to_string(),
            client_type: String::new(),
        }]);
        let record = registry.get("survival").unwrap();
        assert_eq!(probe(&record, WAIT).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_idle_tracking() {
        let activity = Activity::new();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(activity.idle() >= Duration::from_secs(5));

        activity.touch();
        assert!(activity.idle() < Duration::from_secs(1));
    }
}
