// ABOUTME: Exponential backoff retry helper returning the last error on exhaustion
// ABOUTME: Used for per-entry apply, schema statements, bulk windows and whole initial loads

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Default number of attempts for a single unit of work.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry parameters: attempt `n` (0-based) that fails waits `base_delay * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::from_secs(1))
    }
}

/// All attempts failed; carries how many were made and the final error.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryExhausted<E> {}

impl RetryExhausted<anyhow::Error> {
    pub fn into_inner(self) -> anyhow::Error {
        self.last_error
    }
}

/// Run `operation` until it succeeds or `policy.max_attempts` attempts fail.
///
/// Between failed attempts the helper sleeps `base_delay * 2^attempt`. No sleep
/// follows the last attempt. The label only feeds the warning logs.
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use trigger_replicator::retry::{retry_with_backoff, RetryPolicy};
/// # async fn example() {
/// let outcome = retry_with_backoff(
///     "ping",
///     RetryPolicy::new(3, Duration::from_millis(200)),
///     || async { Ok::<_, anyhow::Error>("pong") },
/// )
/// .await;
/// assert!(outcome.is_ok());
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    label: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    label,
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
