use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

/// Sampling parameters sent with every generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 256,
            top_p: 1.0,
            top_k: None,
            stop: Vec::new(),
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), InferenceError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(InferenceError::InvalidInput(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(InferenceError::InvalidInput("max_tokens must be positive".to_string()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(InferenceError::InvalidInput(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k == Some(0) {
            return Err(InferenceError::InvalidInput("top_k must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt_id: String,
    pub prompt_tokens: Vec<u32>,
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Stop,          // Normal completion
    Length,        // Hit max_tokens
    Other(String), // Whatever else the engine reports
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub tokens: Vec<u32>,
    /// One log-probability per generated token.
    pub logprobs: Vec<f32>,
    pub stop_reason: StopReason,
}

/// Limits an inference shard advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCapacity {
    pub max_num_seqs: usize,
    pub max_num_batched_tokens: usize,
}
