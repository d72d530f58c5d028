//! Bounded attempt loop.
//!
//! Each attempt is one call of the body; the loop stops at the first
//! success, at the first error outside the retried class, on cancellation,
//! or when the attempt budget is spent.

use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::errors::{ErrorKind, LifecycleError};

/// What one attempt left behind. Serialized into the trajectory's `retry`
/// section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub session_id: Option<String>,
    pub patch_valid: bool,
    pub patch_validation_reason: String,
    pub patch_length: usize,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Seconds, rounded to milliseconds.
    pub duration: f64,
}

impl AttemptRecord {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            session_id: None,
            patch_valid: false,
            patch_validation_reason: String::new(),
            patch_length: 0,
            error: None,
            error_kind: None,
            duration: 0.0,
        }
    }

    /// Fill the error fields from `err`.
    pub fn failed(mut self, err: &LifecycleError) -> Self {
        self.patch_valid = false;
        self.patch_validation_reason = match err {
            LifecycleError::PatchValidation(detail) => detail.to_string(),
            _ => "no patch".to_string(),
        };
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self
    }
}

/// Result of one attempt plus its record.
#[derive(Debug)]
pub struct Attempt<T> {
    pub result: Result<T, LifecycleError>,
    pub record: AttemptRecord,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Succeeded,
    Exhausted,
    NotRetryable,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Exhausted => "attempt_budget_exhausted",
            Self::NotRetryable => "non_retryable_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, LifecycleError>,
    pub attempts: Vec<AttemptRecord>,
    pub stop: StopReason,
}

/// Run `body(attempt)` for attempt = 1..=`max_attempts`.
pub fn run_attempts<T, F>(max_attempts: u32, cancel: &CancelToken, mut body: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Attempt<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempts = Vec::new();
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        if let Err(e) = cancel.check() {
            return RetryOutcome {
                result: Err(e),
                attempts,
                stop: StopReason::Cancelled,
            };
        }
        info!(attempt, max_attempts, "attempt started");
        let Attempt { result, record } = body(attempt);
        attempts.push(record);

        match result {
            Ok(value) => {
                info!(attempt, "attempt succeeded");
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                    stop: StopReason::Succeeded,
                };
            }
            Err(LifecycleError::Cancelled) => {
                return RetryOutcome {
                    result: Err(LifecycleError::Cancelled),
                    attempts,
                    stop: StopReason::Cancelled,
                };
            }
            Err(e) if !e.is_retryable() => {
                warn!(attempt, error = %e, "attempt failed; not retrying");
                return RetryOutcome {
                    result: Err(e),
                    attempts,
                    stop: StopReason::NotRetryable,
                };
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "attempt failed");
                last_error = Some(e);
            }
        }
    }

    warn!(max_attempts, "all attempts failed");
    RetryOutcome {
        result: Err(last_error.unwrap_or(LifecycleError::Cancelled)),
        attempts,
        stop: StopReason::Exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AgentCommunicationError, GitOperationError, PatchValidationError};

    fn timeout() -> LifecycleError {
        AgentCommunicationError::Timeout {
            endpoint: "POST /session".to_string(),
        }
        .into()
    }

    fn failing(attempt: u32, err: LifecycleError) -> Attempt<()> {
        let record = AttemptRecord::new(attempt).failed(&err);
        Attempt {
            result: Err(err),
            record,
        }
    }

    #[test]
    fn test_exhausts_budget_on_retryable_errors() {
        let mut calls = 0;
        let out = run_attempts(3, &CancelToken::new(), |n| {
            calls += 1;
            failing(n, timeout())
        });
        assert_eq!(calls, 3);
        assert_eq!(out.stop, StopReason::Exhausted);
        assert_eq!(out.attempts.len(), 3);
        assert_eq!(out.attempts[2].attempt, 3);
        assert_eq!(out.attempts[0].error_kind, Some(ErrorKind::AgentCommunication));
        assert!(matches!(out.result, Err(LifecycleError::AgentCommunication(_))));
    }

    #[test]
    fn test_stops_on_success() {
        let out = run_attempts(3, &CancelToken::new(), |n| {
            if n == 2 {
                Attempt {
                    result: Ok(n),
                    record: AttemptRecord::new(n),
                }
            } else {
                let err: LifecycleError = PatchValidationError::Empty.into();
                Attempt {
                    record: AttemptRecord::new(n).failed(&err),
                    result: Err(err),
                }
            }
        });
        assert_eq!(out.result.unwrap(), 2);
        assert_eq!(out.stop, StopReason::Succeeded);
        assert_eq!(out.attempts[0].patch_validation_reason, "agent produced an empty diff");
    }

    #[test]
    fn test_stops_on_non_retryable() {
        let mut calls = 0;
        let out = run_attempts(3, &CancelToken::new(), |n| {
            calls += 1;
            failing(
                n,
                GitOperationError::BranchNotFound {
                    branch: "x".to_string(),
                }
                .into(),
            )
        });
        assert_eq!(calls, 1);
        assert_eq!(out.stop, StopReason::NotRetryable);
    }

    #[test]
    fn test_cancel_before_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = run_attempts(3, &cancel, |n| failing(n, timeout()));
        assert!(out.attempts.is_empty());
        assert_eq!(out.stop, StopReason::Cancelled);
        assert!(matches!(out.result, Err(LifecycleError::Cancelled)));
    }

    #[test]
    fn test_zero_budget_still_runs_once() {
        let out = run_attempts(0, &CancelToken::new(), |n| failing(n, timeout()));
        assert_eq!(out.attempts.len(), 1);
    }
}
