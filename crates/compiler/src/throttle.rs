//! Process-wide spacing of model calls.
//!
//! One [`Throttle`] is shared by every call the compiler makes (planner and
//! all stages). Call start times are therefore monotonically non-decreasing
//! and at least `min_gap` apart. Waiting is cancellable.

use std::time::Duration;

use packet::StageError;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct Throttle {
    min_gap: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_gap: Duration) -> Self {
        Self { min_gap, last_start: Mutex::new(None) }
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Waits until a call may start, then reserves that start time.
    ///
    /// Callers queue on the internal lock, so concurrent callers are spaced
    /// as well.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Instant, StageError> {
        let mut last = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            guard = self.last_start.lock() => guard,
        };
        if let Some(previous) = *last {
            let ready_at = previous + self.min_gap;
            if ready_at > Instant::now() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                    _ = sleep_until(ready_at) => {}
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        let now = Instant::now();
        *last = Some(now);
        Ok(now)
    }
}
