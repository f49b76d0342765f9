use thiserror::Error;

use crate::weights::WeightError;

#[derive(Error, Debug)]
pub enum LearnerError {
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("no gradient accumulated")]
    NoGradient,

    #[error("learner error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum FinetuneError {
    #[error("learner failed at step {step}: {source}")]
    Learner {
        step: u64,
        #[source]
        source: LearnerError,
    },

    #[error("failed to export weights at step {step}: {source}")]
    Export {
        step: u64,
        #[source]
        source: LearnerError,
    },

    #[error("failed to publish weights at step {step}: {source}")]
    Publish {
        step: u64,
        #[source]
        source: WeightError,
    },
}
