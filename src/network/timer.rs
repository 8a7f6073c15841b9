// src/network/timer.rs

use std::time::Duration;
use tokio::time::Instant;

/// Periodic reconciliation deadline owned by the listener loop.
///
/// After each tick the deadline moves to `now + interval`, so a slow tick
/// delays the next one instead of queueing catch-up ticks. Once cancelled the
/// timer never fires again and refuses to rearm.
#[derive(Debug)]
pub struct ReconcileTimer {
    interval: Duration,
    deadline: Instant,
    cancelled: bool,
}

impl ReconcileTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + interval,
            cancelled: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Resolves at the deadline; pends forever once cancelled.
    pub async fn wait(&self) {
        if self.cancelled {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep_until(self.deadline).await;
    }

    /// Returns false when the timer was cancelled.
    pub fn rearm(&mut self, now: Instant) -> bool {
        if self.cancelled {
            return false;
        }
        self.deadline = now + self.interval;
        true
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }
}
