use async_trait::async_trait;
use serde::Serialize;

use super::errors::LearnerError;
use super::objective::Objective;
use crate::preprocess::TrainingExample;

/// Exactly `train_batch_size` examples, consumed by one accumulation pass.
#[derive(Debug, Clone)]
pub struct Batch {
    examples: Vec<TrainingExample>,
}

impl Batch {
    pub fn new(examples: Vec<TrainingExample>) -> Self {
        Self { examples }
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn num_loss_tokens(&self) -> usize {
        self.examples.iter().map(|e| e.num_loss_tokens()).sum()
    }

    pub fn mean_reward(&self) -> f32 {
        if self.examples.is_empty() {
            return 0.0;
        }
        self.examples.iter().map(|e| e.reward).sum::<f32>() / self.examples.len() as f32
    }

    /// Largest staleness in the batch relative to `current_version`.
    pub fn max_lag(&self, current_version: u64) -> u64 {
        self.examples
            .iter()
            .map(|e| e.lag(current_version))
            .max()
            .unwrap_or(0)
    }
}

/// What one forward/backward pass reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PassMetrics {
    pub loss: f64,
    pub policy_loss: f64,
    pub kl: f64,
    pub num_tokens: usize,
}

/// Arguments of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub step: u64,
    pub lr: f64,
    pub weight_decay: f64,
    /// Applied to the accumulated gradient, `1 / gradient_accumulation_passes`.
    pub grad_scale: f64,
}

/// Gradient computation and optimizer state, owned by the finetune stage.
#[async_trait]
pub trait Learner: Send + Sync {
    /// Accumulate the gradient of `objective` over `batch`.
    async fn forward_backward(&mut self, batch: &Batch, objective: &Objective) -> Result<PassMetrics, LearnerError>;

    /// Apply the accumulated gradient once and clear it.
    async fn apply_step(&mut self, params: StepParams) -> Result<(), LearnerError>;

    /// Serialize the current parameters.
    async fn export_weights(&self) -> Result<Vec<u8>, LearnerError>;
}
