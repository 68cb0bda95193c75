use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff strategy for retries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff with jitter: delay = min(base * 2^attempt + jitter, max)
    ExponentialWithJitter { max: Duration },
}

/// Matches a response status code against a configured code or class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusMatcher {
    Code(u16),
    /// `4` matches 400..=499.
    Class(u16),
}

impl StatusMatcher {
    pub fn matches(&self, status: u16) -> bool {
        match self {
            StatusMatcher::Code(code) => *code == status,
            StatusMatcher::Class(class) => status / 100 == *class,
        }
    }
}

/// Read-only retry configuration shared by every invocation of a stage.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: BackoffStrategy,
    pub retry_on: Vec<StatusMatcher>,
    pub retry_transport_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_millis(1000),
            backoff: BackoffStrategy::Fixed,
            retry_on: vec![
                StatusMatcher::Class(1),
                StatusMatcher::Class(3),
                StatusMatcher::Class(4),
                StatusMatcher::Class(5),
            ],
            retry_transport_errors: true,
        }
    }
}

impl RetryPolicy {
    /// Total attempts an invocation may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_on.iter().any(|m| m.matches(status))
    }

    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::ExponentialWithJitter { max } => {
                let base_ms = self.delay.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                let base = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
                let jitter = random_jitter(base / 2);
                Duration::from_millis(base.saturating_add(jitter).min(max_ms))
            }
        }
    }
}

/// Generate random jitter up to max_jitter
fn random_jitter(max_jitter: u64) -> u64 {
    if max_jitter == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_jitter)
}

/// Trait for errors that may be retryable
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Execute an async operation with retries.
///
/// The operation receives the 1-based attempt number. Only errors reporting
/// `is_retryable() == true` are retried, and never beyond `policy.max_attempts()`.
/// Returns the final result together with the number of attempts made.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> (Result<T, E>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable,
{
    let attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(result) => return (Ok(result), attempt),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::debug!(
                    attempt,
                    max = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after retryable failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
