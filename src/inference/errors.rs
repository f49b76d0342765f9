use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum InferenceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Shard unavailable: {0}")]
    Unavailable(String),

    #[error("Engine communication error: {0}")]
    Communication(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Failed to load weight version {version}: {reason}")]
    WeightLoad { version: u64, reason: String },
}

impl InferenceError {
    /// Whether resubmitting the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Unavailable(_)
                | InferenceError::Communication(_)
                | InferenceError::Timeout(_)
        )
    }
}
