//! Explicit retry policy with bounded exponential backoff.
//!
//! Retries are a value passed to [`with_retry`], not something attached to a
//! function, so the schedule stays visible at the call site and testable.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::AppError;

/// How many times to try, how long to wait in between, and which errors are
/// worth another attempt.
pub struct RetryPolicy<E> {
    /// Total attempts including the first one. Treated as at least 1.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5]`.
    pub jitter: bool,
    pub retryable: fn(&E) -> bool,
    /// Server-provided minimum wait, e.g. a `Retry-After` header.
    pub delay_hint: fn(&E) -> Option<Duration>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    pub fn new(retryable: fn(&E) -> bool) -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            jitter: true,
            retryable,
            delay_hint: |_| None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_delay_hint(mut self, hint: fn(&E) -> Option<Duration>) -> Self {
        self.delay_hint = hint;
        self
    }

    pub fn should_retry(&self, error: &E) -> bool {
        (self.retryable)(error)
    }

    /// Delay after the given failed attempt (1-indexed), before jitter.
    ///
    /// `base · 2^(attempt-1)`, capped at `backoff_max`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// Delay after the given failed attempt, jitter applied, never above
    /// `backoff_max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(0.5..=1.5);
        delay.mul_f64(factor).min(self.backoff_max)
    }

    fn delay_after(&self, attempt: u32, error: &E) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        match (self.delay_hint)(error) {
            Some(hint) => backoff.max(hint).min(self.backoff_max),
            None => backoff,
        }
    }
}

impl Default for RetryPolicy<AppError> {
    /// 3 attempts, 500ms → 30s backoff with jitter, retrying transient and
    /// rate-limited errors.
    fn default() -> Self {
        RetryPolicy::new(AppError::is_retryable as fn(&AppError) -> bool)
            .with_delay_hint(AppError::retry_after)
    }
}

/// The last error of a retried operation and how many attempts were made.
#[derive(Debug)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        self.error
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// `op` receives the 1-indexed attempt number. Between attempts the task
/// sleeps for the policy's backoff; dropping the returned future cancels any
/// pending sleep or attempt.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !policy.should_retry(&error) {
                    return Err(RetryError {
                        error,
                        attempts: attempt,
                    });
                }

                let delay = policy.delay_after(attempt, &error);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = %delay.as_millis(),
                    error = %error,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
