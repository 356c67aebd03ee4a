// Topic Oracle
// The external classification capability, treated as a latency-bound, failure-prone black box:
// - TopicOracle: the three classification operations both detectors call
// - retry: timeout + bounded fixed-backoff retry around any oracle
// - llm_oracle: chat-completions backed implementation

pub mod llm_oracle;
pub mod retry;

use crate::models::{ChangeVerdict, TopicVerdict};
use crate::services::providers::ProviderError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use llm_oracle::LlmOracle;
pub use retry::{RetryPolicy, RetryingOracle};

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("oracle call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    ClassificationFailed {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
}

impl OracleError {
    /// Timeouts and remote errors are worth another attempt; a missing key or an
    /// already-exhausted inner adapter is not.
    pub fn is_transient(&self) -> bool {
        match self {
            OracleError::Provider(e) => e.is_transient(),
            OracleError::Timeout(_) => true,
            OracleError::ClassificationFailed { .. } => false,
        }
    }
}

#[async_trait]
pub trait TopicOracle: Send + Sync {
    /// Fine-grained label for one fragment, relative to the current topic.
    async fn classify(
        &self,
        text: &str,
        current_topic: Option<&str>,
    ) -> Result<TopicVerdict, OracleError>;

    /// Label for the text that opens the first major segment.
    async fn detect_initial(&self, text: &str) -> Result<String, OracleError>;

    /// Whether the open segment's text has moved away from `current_label`.
    async fn detect_change(
        &self,
        text: &str,
        current_label: &str,
        previous_summary: Option<&str>,
    ) -> Result<ChangeVerdict, OracleError>;
}

#[async_trait]
impl<T: TopicOracle + ?Sized> TopicOracle for Arc<T> {
    async fn classify(
        &self,
        text: &str,
        current_topic: Option<&str>,
    ) -> Result<TopicVerdict, OracleError> {
        (**self).classify(text, current_topic).await
    }

    async fn detect_initial(&self, text: &str) -> Result<String, OracleError> {
        (**self).detect_initial(text).await
    }

    async fn detect_change(
        &self,
        text: &str,
        current_label: &str,
        previous_summary: Option<&str>,
    ) -> Result<ChangeVerdict, OracleError> {
        (**self).detect_change(text, current_label, previous_summary).await
    }
}
