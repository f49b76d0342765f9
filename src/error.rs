use thiserror::Error;

use crate::actor::ActorError;
use crate::config::ConfigError;
use crate::data::DataError;
use crate::evaluator::EvalError;
use crate::finetune::FinetuneError;
use crate::preprocess::PreprocessError;
use crate::weights::WeightError;

/// Any failure that ends a pipeline run.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Finetune(#[from] FinetuneError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Weights(#[from] WeightError),

    #[error("pipeline task failed: {0}")]
    Runtime(#[from] crate::runtime::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
