use crate::errors::{AppError, Result};
use log::warn;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub enum BackoffPolicy {
    /// Retry immediately.
    #[default]
    Immediate,
    /// Retry after a fixed delay.
    Delay(Duration),
    /// Retry after a delay, doubling each attempt.
    Exponential(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Total attempt ceiling, counting the first try.
    pub max_attempts: u32,
    pub policy: BackoffPolicy,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            policy: BackoffPolicy::Exponential(Duration::from_secs(1)),
        }
    }
}

impl RetryOptions {
    pub const fn new(max_attempts: u32, policy: BackoffPolicy) -> Self {
        Self { max_attempts, policy }
    }

    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self.policy {
            BackoffPolicy::Immediate => None,
            BackoffPolicy::Delay(delay) => Some(delay),
            BackoffPolicy::Exponential(delay) => Some(delay * 2u32.saturating_pow(attempt)),
        }
    }
}

/// Runs an operation up to `max_attempts` times, retrying only while the
/// error classifies as transient. Rate-limit errors override the backoff
/// with the server-provided delay.
pub async fn retry<T, F, Fut>(options: RetryOptions, msg: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;

                if !err.is_transient() || attempt >= options.max_attempts {
                    return Err(err);
                }

                let delay = match &err {
                    AppError::RateLimit { retry_after_secs } => {
                        Some(Duration::from_secs(*retry_after_secs))
                    }
                    _ => options.delay_for(attempt - 1),
                };

                warn!("[RETRY] {} failed (attempt {}/{}): {}", msg, attempt, options.max_attempts, err);

                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
