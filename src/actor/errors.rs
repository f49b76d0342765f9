use thiserror::Error;

use crate::inference::InferenceError;

#[derive(Error, Debug)]
pub enum ActorError {
    #[error("actor {worker} gave up on shard {shard} after {failures} consecutive lost rollouts: {last_error}")]
    ShardUnreachable {
        worker: usize,
        shard: String,
        failures: u32,
        last_error: InferenceError,
    },

    #[error("actor {worker} failed to load weight version {version}: {source}")]
    WeightLoad {
        worker: usize,
        version: u64,
        #[source]
        source: InferenceError,
    },

    #[error("actor task failed: {0}")]
    Runtime(#[from] crate::runtime::Error),
}
