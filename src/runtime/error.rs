use thiserror::Error;

/// Why a submitted task produced no value.
#[derive(Debug, Error)]
pub enum Error {
    /// Aborted through its handle, or its runtime shut down first.
    #[error("task was aborted before it finished")]
    Canceled,

    #[error("task panicked: {0}")]
    Panicked(String),
}
