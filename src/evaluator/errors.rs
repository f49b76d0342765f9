use std::path::PathBuf;

use thiserror::Error;

use crate::inference::InferenceError;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("result for dataset {dataset} at weight version {version} already recorded")]
    Duplicate { dataset: String, version: u64 },

    #[error("evaluation log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed evaluation log line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode evaluation result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to load weight version {version} for evaluation: {source}")]
    WeightLoad {
        version: u64,
        #[source]
        source: InferenceError,
    },
}
