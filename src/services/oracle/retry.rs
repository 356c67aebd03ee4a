// Oracle Retry Adapter
// Fixed per-call timeout plus bounded, fixed-backoff retry (no jitter) around any TopicOracle.

use super::{OracleError, TopicOracle};
use crate::models::{ChangeVerdict, TopicVerdict};
use crate::services::config_store::OracleConfig;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&OracleConfig> for RetryPolicy {
    fn from(config: &OracleConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Wraps an oracle so every call is timed out and retried per `RetryPolicy`.
/// Exhaustion surfaces as `OracleError::ClassificationFailed`.
pub struct RetryingOracle<O> {
    inner: O,
    policy: RetryPolicy,
}

impl<O: TopicOracle> RetryingOracle<O> {
    pub fn new(inner: O, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, OracleError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, OracleError>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts();
        let mut last_err: Option<String> = None;

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.policy.call_timeout, call()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        info!(
                            "[ORACLE] {} succeeded on attempt {}/{}",
                            operation, attempt, max_attempts
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    warn!(
                        "[ORACLE] {} error attempt={}/{} : {}",
                        operation, attempt, max_attempts, e
                    );
                    if !e.is_transient() {
                        return Err(OracleError::ClassificationFailed {
                            operation,
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    let e = OracleError::Timeout(self.policy.call_timeout);
                    warn!(
                        "[ORACLE] {} timeout attempt={}/{} ({:?})",
                        operation, attempt, max_attempts, self.policy.call_timeout
                    );
                    last_err = Some(e.to_string());
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        Err(OracleError::ClassificationFailed {
            operation,
            attempts: max_attempts,
            last_error: last_err.unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

#[async_trait]
impl<O: TopicOracle> TopicOracle for RetryingOracle<O> {
    async fn classify(
        &self,
        text: &str,
        current_topic: Option<&str>,
    ) -> Result<TopicVerdict, OracleError> {
        self.run("classify", || self.inner.classify(text, current_topic))
            .await
    }

    async fn detect_initial(&self, text: &str) -> Result<String, OracleError> {
        self.run("detect_initial", || self.inner.detect_initial(text))
            .await
    }

    async fn detect_change(
        &self,
        text: &str,
        current_label: &str,
        previous_summary: Option<&str>,
    ) -> Result<ChangeVerdict, OracleError> {
        self.run("detect_change", || {
            self.inner.detect_change(text, current_label, previous_summary)
        })
        .await
    }
}
