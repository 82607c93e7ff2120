//! Background guardians: keepalive probing and backoff-driven reconnection.
//!
//! The reconnect guardian is an explicit state machine
//! {Standby, Connect, Waiting(step), Stopped} driven by events over a
//! channel - `start`, `stop`, `restart`, and elapsed waits. `restart`
//! resets the schedule to its first step and cancels the current wait;
//! `stop` cancels immediately and is idempotent; a successful reconnect
//! resets the schedule.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cbr_proto::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff;
use crate::client::{ClientShared, ConnState, SessionEnd, run_session};

/// Inbound-traffic clock shared between a session's read loop and its
/// keepalive guardian.
#[derive(Debug)]
pub(crate) struct IdleClock {
    started: Instant,
    last_millis: AtomicU64,
}

impl IdleClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
        })
    }

    /// Record inbound traffic now.
    // Session lifetimes are far below u64 milliseconds
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_millis.store(elapsed, Ordering::SeqCst);
    }

    /// Time since the last inbound frame.
    // Session lifetimes are far below u64 milliseconds
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn idle(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_millis.load(Ordering::SeqCst);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// Spawn the keepalive guardian: after `interval` of inbound silence, send
/// `keepAlive ping`. Ends on its own once the writer channel closes; the
/// session aborts it on teardown.
pub(crate) fn spawn_keepalive(
    sender: mpsc::UnboundedSender<Envelope>,
    clock: Arc<IdleClock>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;

            if clock.idle() < interval {
                trace!("keepalive skipped, connection active");
                continue;
            }

            if sender.send(Envelope::ping()).is_err() {
                break;
            }
        }

        debug!("keepalive guardian ended");
    })
}

/// Control events accepted by the reconnect guardian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardianEvent {
    Start,
    Stop,
    Restart,
}

enum Phase {
    /// Created but not started.
    Standby,
    /// Running (or establishing) a session; `retry` is the backoff step to
    /// wait on if this attempt fails before login.
    Connect { retry: usize },
    /// Between attempts, sleeping the scheduled wait.
    Waiting { step: usize },
    /// Terminal.
    Stopped,
}

/// The reconnection guardian task handle.
pub struct ReconnectGuardian {
    events: mpsc::UnboundedSender<GuardianEvent>,
    handle: JoinHandle<()>,
}

impl ReconnectGuardian {
    pub(crate) fn spawn(shared: Arc<ClientShared>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(shared, rx));
        Self { events, handle }
    }

    /// All three controls are idempotent: events after the guardian stopped
    /// are dropped.
    pub fn start(&self) {
        let _ = self.events.send(GuardianEvent::Start);
    }

    pub fn stop(&self) {
        let _ = self.events.send(GuardianEvent::Stop);
    }

    pub fn restart(&self) {
        let _ = self.events.send(GuardianEvent::Restart);
    }

    pub(crate) async fn join(self) {
        drop(self.events);
        let _ = self.handle.await;
    }
}

async fn run(shared: Arc<ClientShared>, mut events: mpsc::UnboundedReceiver<GuardianEvent>) {
    let mut phase = Phase::Standby;

    loop {
        phase = match phase {
            Phase::Standby => standby(&shared, &mut events).await,
            Phase::Connect { retry } => connect(&shared, &mut events, retry).await,
            Phase::Waiting { step } => wait(&mut events, step).await,
            Phase::Stopped => break,
        };
    }

    let _ = shared.state_tx.send(ConnState::Disconnected);
    debug!("reconnect guardian stopped");
}

async fn standby(
    shared: &Arc<ClientShared>,
    events: &mut mpsc::UnboundedReceiver<GuardianEvent>,
) -> Phase {
    match events.recv().await {
        Some(GuardianEvent::Start | GuardianEvent::Restart) => {
            shared.clear_stopping();
            Phase::Connect { retry: 0 }
        }
        Some(GuardianEvent::Stop) | None => Phase::Stopped,
    }
}

async fn connect(
    shared: &Arc<ClientShared>,
    events: &mut mpsc::UnboundedReceiver<GuardianEvent>,
    retry: usize,
) -> Phase {
    let cancel = CancellationToken::new();
    let session = run_session(shared.clone(), cancel.clone());
    tokio::pin!(session);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(GuardianEvent::Stop) | None => {
                    shared.set_stopping();
                    cancel.cancel();
                    let _ = session.as_mut().await;
                    return Phase::Stopped;
                }
                Some(GuardianEvent::Restart) => {
                    info!("restart requested, dropping connection");
                    cancel.cancel();
                    let _ = session.as_mut().await;
                    return Phase::Connect { retry: 0 };
                }
                Some(GuardianEvent::Start) => {}
            },
            end = session.as_mut() => return match end {
                Ok(SessionEnd::Stopped) => Phase::Stopped,
                Ok(SessionEnd::Disconnected) => Phase::Waiting { step: 0 },
                Err(e) => {
                    warn!("connection attempt failed: {e}");
                    Phase::Waiting { step: retry }
                }
            },
        }
    }
}

async fn wait(events: &mut mpsc::UnboundedReceiver<GuardianEvent>, step: usize) -> Phase {
    let delay = backoff::delay(step);
    info!("reconnecting in {}s", delay.as_secs());

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(GuardianEvent::Stop) | None => return Phase::Stopped,
                Some(GuardianEvent::Restart) => {
                    info!("restart requested, resetting backoff");
                    return Phase::Waiting { step: 0 };
                }
                Some(GuardianEvent::Start) => {}
            },
            () = &mut sleep => return Phase::Connect { retry: step + 1 },
        }
    }
}
