//! Retry and timeout utilities.
//!
//! Two flavours live here: a generic bounded retry helper used by short HTTP
//! calls (the login exchange), and the reconnect bookkeeping consulted by the
//! websocket receive loop.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns a short policy suitable for the one-shot login request.
    pub fn login() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::login()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Reconnect schedule for the websocket receive loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before the loop gives up.
    pub max_failed_attempts: u32,
    /// Delay applied after the first failure; doubled for each further one.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub const MAX_FAILED_ATTEMPTS: u32 = 5;
    pub const BASE_DELAY: Duration = Duration::from_secs(30);
    pub const MAX_DELAY: Duration = Duration::from_secs(300);

    /// Delay for the `failed_attempts`-th consecutive failure (1-based):
    /// `min(2^(n-1) * base, max)`.
    pub fn delay_for_failure(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: Self::MAX_FAILED_ATTEMPTS,
            base_delay: Self::BASE_DELAY,
            max_delay: Self::MAX_DELAY,
        }
    }
}

/// What the receive loop should do after a transient failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the delay, then reopen the socket.
    RetryAfter(Duration),
    /// The failure ceiling was reached; stop for good.
    GiveUp,
}

/// Consecutive-failure counter owned by one receive loop.
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: ReconnectPolicy,
    failed_attempts: u32,
}

impl RetryState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failed_attempts: 0,
        }
    }

    /// Number of consecutive failures since the last successful connection.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Called on every successful handshake.
    pub fn reset(&mut self) {
        self.failed_attempts = 0;
    }

    /// Records a transient failure and returns the next step.
    pub fn on_transient_failure(&mut self) -> RetryDecision {
        if self.failed_attempts >= self.policy.max_failed_attempts {
            return RetryDecision::GiveUp;
        }
        self.failed_attempts += 1;
        RetryDecision::RetryAfter(self.policy.delay_for_failure(self.failed_attempts))
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
