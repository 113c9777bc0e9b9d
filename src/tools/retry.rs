//! Retry with linear backoff for network-backed tools

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Retry policy for network-backed tool calls
///
/// Transient failures are retried up to `max_retries` times, waiting
/// `base_delay * attempt` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first
    pub max_retries: u32,
    /// Delay unit, multiplied by the attempt number
    #[serde(with = "millis", rename = "base_delay_ms")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out
    ///
    /// Only [`Error::TransientNetwork`] is retried. Exhaustion is reported as
    /// [`Error::ToolExecution`].
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or `ToolExecution` after the last retry
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(Error::TransientNetwork(reason)) => {
                    if attempt >= self.max_retries {
                        tracing::warn!(
                            operation = what,
                            attempts = attempt + 1,
                            %reason,
                            "giving up after transient failures"
                        );
                        return Err(Error::ToolExecution(format!(
                            "{what} failed after {} attempts: {reason}",
                            attempt + 1
                        )));
                    }
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        operation = what,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %reason,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an HTTP status is worth retrying
///
/// Rate limits (429) and server errors (5xx) are; authentication failures
/// and other client errors are not.
#[must_use]
pub fn is_recoverable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Classify a reqwest error as transient or permanent
#[must_use]
pub fn classify_request_error(error: reqwest::Error) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        Error::TransientNetwork(error.to_string())
    } else {
        Error::Http(error)
    }
}

/// Classify a non-success HTTP status
#[must_use]
pub fn classify_status(status: u16, body: &str) -> Error {
    let body = body.trim();
    if matches!(status, 401 | 403) {
        Error::ToolExecution(format!("authentication rejected (status {status})"))
    } else if is_recoverable(status) {
        Error::TransientNetwork(format!("status {status}: {body}"))
    } else {
        Error::ToolExecution(format!("status {status}: {body}"))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    // -- classification -----------------------------------------------------

    #[test]
    fn test_recoverable_statuses() {
        assert!(is_recoverable(429));
        assert!(is_recoverable(500));
        assert!(is_recoverable(503));
        assert!(!is_recoverable(400));
        assert!(!is_recoverable(401));
        assert!(!is_recoverable(404));
    }

    #[test]
    fn test_auth_failures_are_permanent() {
        assert!(matches!(classify_status(401, ""), Error::ToolExecution(_)));
        assert!(matches!(classify_status(403, ""), Error::ToolExecution(_)));
        assert!(matches!(classify_status(502, "bad gateway"), Error::TransientNetwork(_)));
    }

    // -- delays -------------------------------------------------------------

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_deserialize_millis() {
        let policy: RetryPolicy =
            serde_json::from_value(serde_json::json!({"max_retries": 5, "base_delay_ms": 20}))
                .unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(20));
    }

    // -- run ----------------------------------------------------------------

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
        };

        let counter = Arc::clone(&calls);
        let result = policy
            .run("ping", move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::TransientNetwork("reset".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_is_tool_execution() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
        };

        let counter = Arc::clone(&calls);
        let err = policy
            .run("ping", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::TransientNetwork("timeout".to_string()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ToolExecution(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = RetryPolicy::default()
            .run("ping", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(classify_status(401, "unauthorized"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ToolExecution(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
