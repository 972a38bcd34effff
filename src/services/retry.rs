// Retry policy shared by every remote call site.
//
// `RetryPolicy::run` is the only retry loop in the crate: it paces each
// attempt through the rate limiter, classifies failures, feeds overload
// signals back into the limiter and sleeps with exponential backoff plus
// jitter between attempts.

use crate::errors::{GenerationError, PipelineError};
use crate::services::cancel::CancelToken;
use crate::services::rate_limiter::RateLimiter;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

const NETWORK_MARKERS: &[&str] = &[
    "connection failed",
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "econnrefused",
    "timeout",
    "timed out",
    "etimedout",
    "dns",
    "enotfound",
    "getaddrinfo",
    "broken pipe",
    "socket hang up",
];

const OVERLOAD_MARKERS: &[&str] = &[
    "overloaded",
    "unavailable",
    "resource exhausted",
    "resource_exhausted",
    "rate limit",
    "quota",
    "try again later",
];

/// How a failed remote call is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 429/503 or an overload message. Retried and slows the limiter down.
    Overload,
    /// Any other 5xx.
    ServerError,
    Network,
    /// 4xx other than 429. Never retried.
    ClientError,
    /// Nothing classifiable; treated as transient.
    Unknown,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::ClientError)
    }
}

pub fn classify(error: &GenerationError) -> FailureKind {
    match error.status() {
        Some(429) | Some(503) => return FailureKind::Overload,
        Some(500..=599) => return FailureKind::ServerError,
        Some(400..=499) => return FailureKind::ClientError,
        _ => {}
    }

    let message = error.to_string().to_lowercase();
    if OVERLOAD_MARKERS.iter().any(|m| message.contains(m)) {
        FailureKind::Overload
    } else if NETWORK_MARKERS.iter().any(|m| message.contains(m)) {
        FailureKind::Network
    } else {
        FailureKind::Unknown
    }
}

pub fn is_retryable(error: &GenerationError) -> bool {
    classify(error).is_retryable()
}

pub fn is_overload(error: &GenerationError) -> bool {
    classify(error) == FailureKind::Overload
}

/// Result of a retried operation: the last outcome and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, GenerationError>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Jitter is drawn uniformly from `[0, jitter)`.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
            jitter,
        }
    }

    /// Backoff before the attempt following `attempt` (1-based), without jitter.
    ///
    /// Overload failures never back off for less than the limiter's current spacing.
    pub fn backoff(&self, attempt: u32, is_overload: bool, limiter_delay: Duration) -> Duration {
        let base = if is_overload {
            self.base_delay.max(limiter_delay)
        } else {
            self.base_delay
        };
        match 1u32.checked_shl(attempt.saturating_sub(1)) {
            Some(factor) => base.saturating_mul(factor),
            None => Duration::MAX,
        }
    }

    pub fn compute_delay(&self, attempt: u32, is_overload: bool, limiter_delay: Duration) -> Duration {
        self.backoff(attempt, is_overload, limiter_delay)
            .saturating_add(self.random_jitter())
    }

    fn random_jitter(&self) -> Duration {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::random::<u64>() % bound)
    }

    /// Drive `op` until it succeeds, fails non-retryably, or runs out of attempts.
    ///
    /// Remote failures come back inside the outcome; only cancellation is an `Err`.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        limiter: &RateLimiter,
        cancel: &CancelToken,
        mut op: F,
    ) -> Result<RetryOutcome<T>, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            limiter.wait_before_request(cancel).await?;
            debug!("{}: attempt {}/{}", label, attempt, self.max_retries);

            let error = match cancel.run(op(attempt)).await? {
                Ok(value) => {
                    limiter.on_success();
                    return Ok(RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                warn!("{}: non-retryable failure on attempt {}: {}", label, attempt, error);
                return Ok(RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                });
            }

            let overload = is_overload(&error);
            if overload {
                limiter.on_overload();
            }

            if attempt >= self.max_retries {
                warn!("{}: giving up after {} attempts: {}", label, attempt, error);
                return Ok(RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                });
            }

            let delay = self.compute_delay(attempt, overload, limiter.current_delay());
            info!(
                "{}: attempt {} failed ({:?}): {}. Retrying in {}ms",
                label,
                attempt,
                classify(&error),
                error,
                delay.as_millis()
            );
            cancel.sleep(delay).await?;
        }
    }
}
