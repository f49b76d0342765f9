use std::fmt;

use serde::{Deserialize, Serialize};

use crate::inference::StopReason;

/// A prompt pulled from a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    #[serde(default)]
    pub dataset: String,
    pub tokens: Vec<u32>,
    /// Reference answer the scorer compares against.
    #[serde(default)]
    pub answer: Option<Vec<u32>>,
}

/// Identifies the submission lane that produced a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaneId {
    pub worker: usize,
    pub lane: usize,
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor{}/lane{}", self.worker, self.lane)
    }
}

/// One generated trajectory.
///
/// Produced by an actor lane and moved into the preprocess queue; never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub prompt_id: String,
    pub prompt_tokens: Vec<u32>,
    pub completion: Vec<u32>,
    /// Sampling log-probability of each completion token.
    pub logprobs: Vec<f32>,
    pub reward: f32,
    /// Version loaded on the shard when the request was submitted.
    pub weight_version: u64,
    pub stop_reason: StopReason,
    pub lane: LaneId,
}
