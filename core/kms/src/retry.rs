//! Bounded retries with fixed backoff.

use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tokenkms_common::{Error, Result};

/// Retry limits for store and replay operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Commit attempts before falling back to rollback.
    pub commit_attempts: u32,
    /// Rollback attempts before requiring a restart.
    pub rollback_attempts: u32,
    /// Attempts to replay one update file.
    pub replay_attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Set the fixed backoff.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Check that every limit allows at least one attempt.
    pub fn validate(&self) -> Result<()> {
        if self.commit_attempts == 0 || self.rollback_attempts == 0 || self.replay_attempts == 0 {
            return Err(Error::Parameter(
                "Retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            commit_attempts: 3,
            rollback_attempts: 3,
            replay_attempts: 3,
            backoff_ms: 50,
        }
    }
}

/// Runs an operation up to a fixed number of attempts.
pub struct RetryExecutor {
    attempts: u32,
    backoff: Duration,
}

impl RetryExecutor {
    /// Create an executor making at most `attempts` calls.
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `operation`, retrying errors for which [`Error::is_retryable`] holds.
    pub fn execute<T>(&self, what: &str, operation: impl FnMut() -> Result<T>) -> Result<T> {
        self.execute_with_condition(what, operation, Error::is_retryable)
    }

    /// Run `operation`, retrying errors accepted by `should_retry`.
    ///
    /// Returns the last error once the attempts are exhausted.
    pub fn execute_with_condition<T>(
        &self,
        what: &str,
        mut operation: impl FnMut() -> Result<T>,
        should_retry: impl Fn(&Error) -> bool,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation() {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(what, attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) || attempt >= self.attempts {
                        if attempt > 1 {
                            warn!(what, attempt, error = %err, "Giving up");
                        }
                        return Err(err);
                    }
                    warn!(what, attempt, error = %err, "Attempt failed, retrying in {:?}", self.backoff);
                    sleep(self.backoff);
                }
            }
        }
    }
}
