//! Reconnection backoff schedule.
//!
//! Fixed escalating waits in seconds: 5, 10, 30, 60, 120, 300, 600, 1200,
//! 1800, 3600, then 3600 forever. The step index resets on a successful
//! reconnect and on a manual restart.

use std::time::Duration;

const SCHEDULE_SECS: [u64; 10] = [5, 10, 30, 60, 120, 300, 600, 1200, 1800, 3600];

/// Wait before the attempt at `step` (0-based). Steps past the end of the
/// schedule repeat the final wait indefinitely.
#[must_use]
pub fn delay(step: usize) -> Duration {
    let secs = SCHEDULE_SECS[step.min(SCHEDULE_SECS.len() - 1)];
    Duration::from_secs(secs)
}
