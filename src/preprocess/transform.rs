use serde::{Deserialize, Serialize};

use crate::config::PreprocessConfig;
use crate::rollout::Rollout;

/// A fixed-shape training example derived from one rollout.
///
/// Every vector has the stage's `seq_length`. Position `i` predicts
/// `target_tokens[i]` from `input_tokens[..=i]`; `loss_mask` is 1.0 on
/// completion targets only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub prompt_id: String,
    pub input_tokens: Vec<u32>,
    pub target_tokens: Vec<u32>,
    pub loss_mask: Vec<f32>,
    /// Sampling log-probabilities aligned with `target_tokens`.
    pub old_logprobs: Vec<f32>,
    pub advantage: f32,
    /// Shaped reward before the baseline is subtracted.
    pub reward: f32,
    /// Version that generated the source rollout.
    pub weight_version: u64,
}

impl TrainingExample {
    pub fn seq_length(&self) -> usize {
        self.input_tokens.len()
    }

    /// Number of positions that contribute to the loss.
    pub fn num_loss_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|m| **m > 0.0).count()
    }

    /// Versions between generation and `current_version`.
    pub fn lag(&self, current_version: u64) -> u64 {
        current_version.saturating_sub(self.weight_version)
    }
}

/// Why a rollout was filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyPrompt,
    EmptyCompletion,
    LogprobMismatch,
    NonFiniteReward,
    NonFiniteLogprob,
    TooLong,
}

/// The pure rollout → example function and its reward shaping.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    seq_length: usize,
    reward_scale: f32,
    reward_clip: Option<f32>,
}

impl Transform {
    pub fn new(seq_length: usize, reward_scale: f32, reward_clip: Option<f32>) -> Self {
        Self {
            seq_length,
            reward_scale,
            reward_clip,
        }
    }

    pub fn from_config(config: &PreprocessConfig) -> Self {
        Self::new(config.seq_length, config.reward_scale, config.reward_clip)
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    pub fn shape_reward(&self, reward: f32) -> f32 {
        let scaled = reward * self.reward_scale;
        match self.reward_clip {
            Some(clip) => scaled.clamp(-clip, clip),
            None => scaled,
        }
    }

    pub fn validate(&self, rollout: &Rollout) -> Result<(), RejectReason> {
        if rollout.prompt_tokens.is_empty() {
            return Err(RejectReason::EmptyPrompt);
        }
        if rollout.completion.is_empty() {
            return Err(RejectReason::EmptyCompletion);
        }
        if rollout.logprobs.len() != rollout.completion.len() {
            return Err(RejectReason::LogprobMismatch);
        }
        if !rollout.reward.is_finite() {
            return Err(RejectReason::NonFiniteReward);
        }
        if rollout.logprobs.iter().any(|lp| !lp.is_finite()) {
            return Err(RejectReason::NonFiniteLogprob);
        }
        if rollout.prompt_tokens.len() + rollout.completion.len() - 1 > self.seq_length {
            return Err(RejectReason::TooLong);
        }
        Ok(())
    }

    /// Build the example for `rollout`, with `advantage` already computed.
    pub fn apply(&self, rollout: &Rollout, advantage: f32) -> Result<TrainingExample, RejectReason> {
        self.validate(rollout)?;

        let full: Vec<u32> = rollout
            .prompt_tokens
            .iter()
            .chain(rollout.completion.iter())
            .copied()
            .collect();
        let used = full.len() - 1;
        // Targets from here on are completion tokens.
        let first_completion_target = rollout.prompt_tokens.len() - 1;

        let mut input_tokens = vec![0u32; self.seq_length];
        let mut target_tokens = vec![0u32; self.seq_length];
        let mut loss_mask = vec![0.0f32; self.seq_length];
        let mut old_logprobs = vec![0.0f32; self.seq_length];

        input_tokens[..used].copy_from_slice(&full[..used]);
        target_tokens[..used].copy_from_slice(&full[1..]);
        for (offset, logprob) in rollout.logprobs.iter().enumerate() {
            let pos = first_completion_target + offset;
            loss_mask[pos] = 1.0;
            old_logprobs[pos] = *logprob;
        }

        Ok(TrainingExample {
            prompt_id: rollout.prompt_id.clone(),
            input_tokens,
            target_tokens,
            loss_mask,
            old_logprobs,
            advantage,
            reward: self.shape_reward(rollout.reward),
            weight_version: rollout.weight_version,
        })
    }
}
