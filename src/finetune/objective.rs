use serde::Serialize;

use crate::config::{FinetuneConfig, LossAggregation};

/// Per-example loss terms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExampleLoss {
    /// `-A * mean_t(log pi)` over masked tokens.
    pub policy: f64,
    /// `mean_t(log pi - log pi_ref)` over masked tokens.
    pub kl: f64,
    pub total: f64,
}

/// Policy-gradient objective with a KL penalty and a batch reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Objective {
    pub kl_coef: f64,
    pub aggregation: LossAggregation,
}

impl Objective {
    pub fn from_config(config: &FinetuneConfig) -> Self {
        Self {
            kl_coef: config.kl_coef,
            aggregation: config.aggregate_loss,
        }
    }

    /// Weight of one example's loss (and gradient) in a batch of `batch_size`.
    pub fn example_weight(&self, batch_size: usize) -> f64 {
        match self.aggregation {
            LossAggregation::Mean => 1.0 / batch_size.max(1) as f64,
            LossAggregation::Sum => 1.0,
        }
    }

    /// Loss terms of one example from the current and reference log-probs of
    /// its masked tokens.
    pub fn example_loss(&self, advantage: f32, logprobs: &[f64], ref_logprobs: &[f64]) -> ExampleLoss {
        if logprobs.is_empty() {
            return ExampleLoss::default();
        }
        let n = logprobs.len() as f64;
        let mean_logprob = logprobs.iter().sum::<f64>() / n;
        let kl = logprobs
            .iter()
            .zip(ref_logprobs)
            .map(|(lp, rp)| lp - rp)
            .sum::<f64>()
            / n;
        let policy = -(advantage as f64) * mean_logprob;
        ExampleLoss {
            policy,
            kl,
            total: self.combine(policy, kl),
        }
    }

    pub fn combine(&self, policy: f64, kl: f64) -> f64 {
        policy + self.kl_coef * kl
    }

    /// Batch loss from per-example losses.
    pub fn reduce(&self, losses: &[f64]) -> f64 {
        losses.iter().sum::<f64>() * self.example_weight(losses.len())
    }
}
