//! The shared experiment clock.
//!
//! One clock is captured at run start and passed read-only into every task.
//! All schedule offsets (impairment events, traffic spikes, the total run
//! duration) are absolute from this single start instant, so slow collaborator
//! calls never accumulate drift: the next wait is always computed from
//! `elapsed()`, not chained from the previous wake.

use std::time::Duration;

use tokio::time::Instant;

use crate::cancel::CancelToken;

/// Outcome of a cancellable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The target offset was reached.
    Reached,
    /// Cancellation was requested before the offset elapsed.
    Cancelled,
}

/// Immutable per-run clock. Cheap to copy into every task.
#[derive(Debug, Clone, Copy)]
pub struct ExperimentClock {
    start: Instant,
}

impl ExperimentClock {
    pub fn start_now() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since experiment start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Sleep until `offset` past experiment start, waking early on
    /// cancellation.
    ///
    /// Returns immediately with [`Wait::Reached`] when the offset already
    /// lies in the past, and with [`Wait::Cancelled`] when the token is
    /// already set. A cancellation observed at or after the deadline still
    /// counts as [`Wait::Reached`]: the offset was reached, so a run whose
    /// full duration elapses reports the same way whether the stop token
    /// lands a tick before or after each waiter wakes.
    pub async fn wait_until(&self, offset: Duration, cancel: &CancelToken) -> Wait {
        let deadline = self.start + offset;
        if cancel.is_cancelled() {
            return if Instant::now() >= deadline {
                Wait::Reached
            } else {
                Wait::Cancelled
            };
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Wait::Reached,
            _ = cancel.cancelled() => {
                if Instant::now() >= deadline {
                    Wait::Reached
                } else {
                    Wait::Cancelled
                }
            }
        }
    }
}
