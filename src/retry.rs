//! Retry planning for a single logical request.
//!
//! Only idempotent requests whose body can be replayed are attempted more
//! than once. The executor asks [`RetryPlan::decide`] after every attempt.

use http::Method;
use std::time::Duration;

/// Methods that may be sent again without changing the outcome.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE | Method::PUT | Method::TRACE
    )
}

/// What the executor does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Return the last outcome to the caller.
    Stop,
    /// Wait `backoff`, then send the request again.
    Retry { backoff: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPlan {
    max_attempts: usize,
    idempotent: bool,
    backoff: Duration,
}

impl RetryPlan {
    /// `replayable` is false when the body can only be read once.
    pub fn new(method: &Method, replayable: bool, max_attempts: usize, backoff: Duration) -> Self {
        let idempotent = is_idempotent(method);
        let max_attempts = if idempotent && replayable {
            max_attempts.max(1)
        } else {
            1
        };
        Self {
            max_attempts,
            idempotent,
            backoff,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// The predicate used when none is configured: retry failed idempotent requests.
    pub fn default_should_retry<T, E>(&self, outcome: &Result<T, E>) -> bool {
        self.idempotent && outcome.is_err()
    }

    /// `attempt` is the 1-based number of the attempt that just finished.
    pub fn decide(&self, attempt: usize, should_retry: bool) -> Decision {
        if should_retry && attempt < self.max_attempts {
            Decision::Retry {
                backoff: self.backoff,
            }
        } else {
            Decision::Stop
        }
    }
}
