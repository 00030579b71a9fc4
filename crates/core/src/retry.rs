//! Retry policy for calls from the edge to the storage owner.
//!
//! Only failures classified as transient are retried: connection and timeout failures, a
//! `service-unavailable` envelope, and bare `5xx`/`429` answers that carry no envelope.
//! Everything else, write errors and authentication failures in particular, surfaces on the
//! first attempt. Backoff is exponential with full jitter, and the number of attempts is bounded.

use crate::{StorageError, StorageResult};
use api_shared::ResponseStatus;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Transport-level failure kinds, extracted from the HTTP client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    Connect,
    Timeout,
    /// The request could not be sent or the connection dropped mid-exchange.
    Request,
    Other,
}

impl TransportFault {
    pub fn of(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportFault::Timeout
        } else if err.is_connect() {
            TransportFault::Connect
        } else if err.is_request() {
            TransportFault::Request
        } else {
            TransportFault::Other
        }
    }
}

pub fn classify_status(status: u16) -> FailureClass {
    match status {
        429 | 500..=599 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// Classifies an error answer. The envelope status decides when the storage service sent
/// one; the HTTP code is only consulted for bodies from something in between.
pub fn classify_response(status: u16, envelope: Option<ResponseStatus>) -> FailureClass {
    match envelope {
        Some(ResponseStatus::Ok) | None => classify_status(status),
        Some(reported) if reported.is_transient() => FailureClass::Transient,
        Some(_) => FailureClass::Permanent,
    }
}

pub fn classify_transport(fault: TransportFault) -> FailureClass {
    match fault {
        TransportFault::Connect | TransportFault::Timeout | TransportFault::Request => {
            FailureClass::Transient
        }
        TransportFault::Other => FailureClass::Permanent,
    }
}

/// A failed attempt and whether it is worth repeating.
#[derive(Debug)]
pub struct AttemptError {
    pub class: FailureClass,
    pub error: StorageError,
}

impl AttemptError {
    pub fn transient(error: StorageError) -> Self {
        Self {
            class: FailureClass::Transient,
            error,
        }
    }

    pub fn permanent(error: StorageError) -> Self {
        Self {
            class: FailureClass::Permanent,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt, for operations that must not be repeated blindly.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the attempt after `attempt` (1-based): a uniform draw between zero and
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }
}

/// Runs `attempt` until it succeeds, fails permanently, or the policy's budget is spent.
///
/// The closure receives the 1-based attempt number. An exhausted budget is reported as
/// `ServiceUnavailable`.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> StorageResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        let failure = match attempt(tries).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        if failure.class == FailureClass::Permanent {
            return Err(failure.error);
        }

        if tries >= max_attempts {
            tracing::warn!(
                operation,
                attempts = tries,
                "Giving up on storage owner: {}",
                failure.error
            );
            return Err(match failure.error {
                unavailable @ StorageError::ServiceUnavailable(_) if tries == 1 => unavailable,
                other => StorageError::ServiceUnavailable(format!(
                    "{operation} failed after {tries} attempt(s): {other}"
                )),
            });
        }

        let delay = {
            let mut rng = rand::thread_rng();
            policy.backoff(tries, &mut rng)
        };
        tracing::debug!(
            operation,
            attempt = tries,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying: {}",
            failure.error
        );
        tokio::time::sleep(delay).await;
    }
}
