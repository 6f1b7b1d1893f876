//! Failure Classification and Retry Policy
//!
//! A send that got no answer (the peer never responded, the connection could
//! not be established, or it was reset) is transient once; anything else is
//! permanent. The retry delay is a timed step inside the caller's own future
//! so the flow can be cancelled while it waits.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ForwardingConfig;
use crate::error::Error;

/// Failure class of a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying after the policy's delay
    Transient,
    /// Escalate immediately
    Permanent,
}

/// Classify a transport error, ignoring how many attempts were made
pub fn classify(error: &Error) -> FailureClass {
    if error.is_no_response() {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub struct RetryFailure {
    /// Error of the last attempt (`Error::Cancelled` if cancelled while waiting)
    pub error: Error,
    /// Attempts made
    pub attempts: u32,
    /// Cancelled during the retry delay rather than failing
    pub cancelled: bool,
}

/// Bounded retry for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed delay before each retry
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Build from forwarding configuration
    pub fn from_config(config: &ForwardingConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    /// Classify an error given that `attempt` attempts (1-based) have been made.
    /// Transient errors become permanent once the retries are used up.
    pub fn classify_attempt(&self, error: &Error, attempt: u32) -> FailureClass {
        match classify(error) {
            FailureClass::Transient if attempt <= self.max_retries => FailureClass::Transient,
            _ => FailureClass::Permanent,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or `cancel` fires during a delay
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        target: &str,
        mut op: F,
    ) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if self.classify_attempt(&error, attempt) == FailureClass::Permanent {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    cancelled: false,
                });
            }

            tracing::warn!(
                "No response from {} (attempt {}), retrying in {:?}: {}",
                target,
                attempt,
                self.retry_delay,
                error
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        cancelled: true,
                    });
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(10))
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&Error::NoResponse("r".into())), FailureClass::Transient);
        assert_eq!(classify(&Error::ConnectionReset("r".into())), FailureClass::Transient);
        assert_eq!(
            classify(&Error::Rejected {
                address: "r".into(),
                code: ErrorCode::OutOfSequence,
                message: String::new(),
            }),
            FailureClass::Permanent
        );
        assert_eq!(classify(&Error::Internal("x".into())), FailureClass::Permanent);
    }

    #[test]
    fn test_transient_only_once() {
        let err = Error::NoResponse("r".into());
        assert_eq!(policy().classify_attempt(&err, 1), FailureClass::Transient);
        assert_eq!(policy().classify_attempt(&err, 2), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn test_single_retry_on_no_response() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = policy()
            .run(&CancellationToken::new(), "r", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::NoResponse("r".into())) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert!(!failure.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run(&CancellationToken::new(), "r", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::NoResponse("r".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = policy()
            .run(&CancellationToken::new(), "r", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Internal("boom".into())) }
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_delay() {
        let cancel = CancellationToken::new();
        let slow = RetryPolicy::new(1, Duration::from_secs(30));
        cancel.cancel();

        let result: std::result::Result<(), _> = slow
            .run(&cancel, "r", || async { Err(Error::NoResponse("r".into())) })
            .await;
        let failure = result.unwrap_err();
        assert!(failure.cancelled);
        assert_eq!(failure.attempts, 1);
    }
}
