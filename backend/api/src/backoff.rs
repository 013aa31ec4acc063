/// Exponential backoff for retried side effects
/// Shared by the post-commit runner and any caller that retries a transient failure

use shared::DomainResult;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Exponential backoff state tracker
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_interval: Duration,
    max_interval: Duration,
    current_attempt: u32,
    current_interval: Duration,
}

impl ExponentialBackoff {
    pub fn new(base_interval: Duration, max_interval: Duration) -> Self {
        ExponentialBackoff {
            base_interval,
            max_interval,
            current_attempt: 0,
            current_interval: base_interval,
        }
    }

    pub fn from_secs(base_secs: u64, max_secs: u64) -> Self {
        Self::new(Duration::from_secs(base_secs), Duration::from_secs(max_secs))
    }

    /// Record a failure and return how long to wait: base * 2^(attempts - 1), capped.
    pub fn on_failure(&mut self, error_message: &str) -> Duration {
        self.current_attempt += 1;

        let factor = 2_u32.saturating_pow(self.current_attempt.saturating_sub(1));
        self.current_interval = self
            .base_interval
            .saturating_mul(factor)
            .min(self.max_interval);

        warn!(
            attempt = self.current_attempt,
            interval_ms = self.current_interval.as_millis() as u64,
            error = error_message,
            "backing off before retry"
        );

        self.current_interval
    }

    pub fn on_success(&mut self) {
        if self.current_attempt > 0 {
            info!(
                attempts = self.current_attempt,
                "recovered after {} failed attempts", self.current_attempt
            );
        }
        self.current_attempt = 0;
        self.current_interval = self.base_interval;
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn interval(&self) -> Duration {
        self.current_interval
    }

    pub fn should_give_up(&self, max_total_attempts: u32) -> bool {
        self.current_attempt >= max_total_attempts
    }
}

/// Run `operation` until it succeeds, fails with a permanent error, or
/// `max_attempts` transient failures have been seen.
pub async fn execute_with_backoff<F, T, Fut>(
    mut backoff: ExponentialBackoff,
    max_attempts: u32,
    mut operation: F,
) -> DomainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DomainResult<T>>,
{
    loop {
        match operation().await {
            Ok(result) => {
                backoff.on_success();
                return Ok(result);
            }
            Err(err) if !err.is_transient() => {
                error!(error = %err, "permanent failure, not retrying");
                return Err(err);
            }
            Err(err) => {
                let wait = backoff.on_failure(&err.to_string());

                if backoff.should_give_up(max_attempts) {
                    error!(
                        attempts = backoff.attempts(),
                        error = %err,
                        "giving up after {} attempts",
                        backoff.attempts()
                    );
                    return Err(err);
                }

                crate::metrics::POST_COMMIT_RETRIES.inc();
                tokio::time::sleep(wait).await;
            }
        }
    }
}
