use async_trait::async_trait;

use super::policy::{UnigramPolicy, log_softmax};
use crate::finetune::{Batch, Learner, LearnerError, Objective, PassMetrics, StepParams};

/// REINFORCE with a KL penalty against the initial policy, on unigram logits.
#[derive(Debug, Clone)]
pub struct UnigramLearner {
    logits: Vec<f64>,
    reference: Vec<f64>,
    grad: Vec<f64>,
    accumulated: usize,
}

impl UnigramLearner {
    pub fn new(initial: &UnigramPolicy) -> Self {
        let logits: Vec<f64> = initial.logits().iter().map(|z| *z as f64).collect();
        Self {
            reference: log_softmax(&logits),
            grad: vec![0.0; logits.len()],
            logits,
            accumulated: 0,
        }
    }

    pub fn policy(&self) -> UnigramPolicy {
        UnigramPolicy::from_logits(self.logits.iter().map(|z| *z as f32).collect())
    }
}

#[async_trait]
impl Learner for UnigramLearner {
    async fn forward_backward(&mut self, batch: &Batch, objective: &Objective) -> Result<PassMetrics, LearnerError> {
        if batch.is_empty() {
            return Err(LearnerError::InvalidBatch("empty batch".to_string()));
        }
        let vocab = self.logits.len();
        let logp = log_softmax(&self.logits);
        let probs: Vec<f64> = logp.iter().map(|lp| lp.exp()).collect();
        let weight = objective.example_weight(batch.len());

        let mut totals = Vec::with_capacity(batch.len());
        let mut policies = Vec::with_capacity(batch.len());
        let mut kls = Vec::with_capacity(batch.len());
        let mut num_tokens = 0;

        for example in batch.examples() {
            let targets: Vec<usize> = example
                .target_tokens
                .iter()
                .zip(&example.loss_mask)
                .filter(|(_, m)| **m > 0.0)
                .map(|(t, _)| *t as usize)
                .collect();
            if let Some(bad) = targets.iter().find(|t| **t >= vocab) {
                return Err(LearnerError::InvalidBatch(format!(
                    "token {bad} outside vocabulary of {vocab} in {}",
                    example.prompt_id
                )));
            }

            let current: Vec<f64> = targets.iter().map(|t| logp[*t]).collect();
            let reference: Vec<f64> = targets.iter().map(|t| self.reference[*t]).collect();
            let loss = objective.example_loss(example.advantage, &current, &reference);
            totals.push(loss.total);
            policies.push(loss.policy);
            kls.push(loss.kl);
            if targets.is_empty() {
                continue;
            }
            num_tokens += targets.len();

            // d/dz of c * mean_t(log p_t) is c / n * sum_t (onehot_t - p).
            let n = targets.len() as f64;
            let coef = weight * (objective.kl_coef - example.advantage as f64) / n;
            for t in &targets {
                self.grad[*t] += coef;
            }
            for (g, p) in self.grad.iter_mut().zip(&probs) {
                *g -= coef * n * p;
            }
        }

        self.accumulated += 1;
        Ok(PassMetrics {
            loss: objective.reduce(&totals),
            policy_loss: objective.reduce(&policies),
            kl: objective.reduce(&kls),
            num_tokens,
        })
    }

    async fn apply_step(&mut self, params: StepParams) -> Result<(), LearnerError> {
        if self.accumulated == 0 {
            return Err(LearnerError::NoGradient);
        }
        for (z, g) in self.logits.iter_mut().zip(self.grad.iter_mut()) {
            *z -= params.lr * (*g * params.grad_scale + params.weight_decay * *z);
            *g = 0.0;
        }
        self.accumulated = 0;
        Ok(())
    }

    async fn export_weights(&self) -> Result<Vec<u8>, LearnerError> {
        Ok(self.policy().to_bytes())
    }
}
