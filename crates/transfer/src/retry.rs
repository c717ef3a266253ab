//! Bounded retry policy shared by the download and upload paths.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Fixed-delay retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per side, including the first one.
    pub max_attempts: u32,
    /// Delay before each new attempt.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// What to do after attempt number `attempt` failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then start the next attempt.
    Retry { delay: Duration },
    /// Stop and surface this error.
    GiveUp(TransferError),
}

impl RetryPolicy {
    /// Decides whether a failure on attempt `attempt` (1-based) is retried.
    pub fn decide(&self, attempt: u32, err: TransferError) -> RetryDecision {
        if !err.is_transient() {
            return RetryDecision::GiveUp(err);
        }
        if attempt >= self.max_attempts.max(1) {
            return RetryDecision::GiveUp(TransferError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }
        RetryDecision::Retry { delay: self.delay }
    }

    /// Waits out `delay` unless `cancel` fires first.
    pub async fn wait(delay: Duration, cancel: &CancellationToken) -> Result<(), TransferError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
