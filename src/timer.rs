use core::time::Duration;

use tokio_util::sync::CancellationToken;

pub const PRODUCTION_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const STAGING_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const SIMULATION_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_CEILING: u32 = 10;
/// Half of the blink period: 0.5s on, 0.5s off
pub const BLINK_HALF_PERIOD: Duration = Duration::from_millis(500);

/// Counts consecutive failed acquisition cycles against a fixed ceiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    failures: u32,
    ceiling: u32,
}

impl RetryBudget {
    pub fn new(ceiling: u32) -> RetryBudget {
        Self {
            failures: 0,
            ceiling: ceiling.max(1),
        }
    }

    /// Records one failure and returns the new consecutive count
    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.ceiling
    }
}

/// How a cancellable sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Cancelled,
}

/// Sleeps for `interval` unless `token` is cancelled first
pub async fn sleep_or_cancel(interval: Duration, token: &CancellationToken) -> Wake {
    tokio::select! {
        _ = token.cancelled() => Wake::Cancelled,
        _ = tokio::time::sleep(interval) => Wake::Elapsed,
    }
}
