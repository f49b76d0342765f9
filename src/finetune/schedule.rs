//! Learning-rate schedules.

use crate::config::{FinetuneConfig, LrSchedule};

/// Learning-rate multiplier for `step` (0-based).
///
/// - Warmup: `(step + 1) / warmup_steps` while `step < warmup_steps`
/// - Afterwards: `constant` stays at 1.0, `linear` and `cosine` decay to 0.0
///   at `total_steps`
pub fn lr_multiplier(schedule: LrSchedule, step: u64, warmup_steps: u64, total_steps: u64) -> f64 {
    if step < warmup_steps {
        return (step + 1) as f64 / warmup_steps as f64;
    }

    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
    let progress = ((step - warmup_steps) as f64 / decay_steps as f64).min(1.0);
    match schedule {
        LrSchedule::Constant => 1.0,
        LrSchedule::Linear => 1.0 - progress,
        LrSchedule::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrScheduler {
    pub base_lr: f64,
    pub schedule: LrSchedule,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

impl LrScheduler {
    pub fn from_config(config: &FinetuneConfig) -> Self {
        Self {
            base_lr: config.learning_rate,
            schedule: config.lr_schedule,
            warmup_steps: config.num_warmup_steps,
            total_steps: config.max_train_steps,
        }
    }

    pub fn lr(&self, step: u64) -> f64 {
        self.base_lr * lr_multiplier(self.schedule, step, self.warmup_steps, self.total_steps)
    }
}
