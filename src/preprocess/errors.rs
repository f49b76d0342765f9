use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("preprocess queue is closed")]
    Closed,
}
