use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::errors::FinetuneError;
use super::learner::{Batch, Learner, PassMetrics, StepParams};
use super::objective::Objective;
use super::schedule::LrScheduler;
use crate::config::Config;
use crate::evaluator::EvalTrigger;
use crate::logging::log_metrics;
use crate::preprocess::TrainingExample;
use crate::weights::WeightPublisher;

/// Whether the step counter has reached an evaluation point. `every == 0`
/// disables evaluation.
pub fn should_evaluate(step: u64, every: u64) -> bool {
    every > 0 && step > 0 && step % every == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinetuneState {
    Accumulating,
    Stepping,
    Publishing,
    Finished,
}

#[derive(Debug, Default)]
pub struct FinetuneStats {
    pub received: AtomicU64,
    pub used: AtomicU64,
    pub stale: AtomicU64,
    pub passes: AtomicU64,
    pub steps: AtomicU64,
    pub published: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinetuneReport {
    pub steps: u64,
    pub passes: u64,
    pub examples_used: u64,
    pub stale_examples: u64,
    /// Examples of a batch that never completed.
    pub incomplete_examples: u64,
    pub published_versions: u64,
    pub final_version: u64,
    pub eval_requests: u64,
    /// Evaluation requests dropped because the evaluator was busy.
    pub eval_skipped: u64,
}

/// Drives a [`Learner`] from the example stream.
///
/// ACCUMULATING → STEPPING → (every `weight_update_interval` steps)
/// PUBLISHING → ACCUMULATING. The stage owns the step counter and the only
/// weight publisher.
pub struct FinetuneStage<L: Learner> {
    learner: L,
    publisher: WeightPublisher,
    objective: Objective,
    lr: LrScheduler,
    train_batch_size: usize,
    passes: usize,
    weight_update_interval: u64,
    weight_decay: f64,
    max_train_steps: u64,
    max_lag: Option<u64>,
    eval_every: u64,
    eval: Option<EvalTrigger>,
    last_eval_version: Option<u64>,
    step: u64,
    state: FinetuneState,
    incomplete: u64,
    eval_requests: u64,
    stats: Arc<FinetuneStats>,
}

impl<L: Learner> FinetuneStage<L> {
    pub fn new(config: &Config, learner: L, publisher: WeightPublisher, eval: Option<EvalTrigger>) -> Self {
        let ft = &config.finetune;
        Self {
            learner,
            publisher,
            objective: Objective::from_config(ft),
            lr: LrScheduler::from_config(ft),
            train_batch_size: ft.train_batch_size.max(1),
            passes: ft.gradient_accumulation_passes.max(1),
            weight_update_interval: ft.weight_update_interval.max(1),
            weight_decay: ft.weight_decay,
            max_train_steps: ft.max_train_steps,
            max_lag: ft.max_lag,
            eval_every: config.eval_every_n_versions,
            eval,
            last_eval_version: None,
            step: 0,
            state: FinetuneState::Accumulating,
            incomplete: 0,
            eval_requests: 0,
            stats: Arc::new(FinetuneStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FinetuneStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> FinetuneState {
        self.state
    }

    /// Train until `max_train_steps` or until the example supply closes.
    ///
    /// A gradient accumulated from an unfinished step is discarded.
    pub async fn run(mut self, mut examples: mpsc::Receiver<TrainingExample>) -> Result<FinetuneReport, FinetuneError> {
        info!(
            train_batch_size = self.train_batch_size,
            passes = self.passes,
            weight_update_interval = self.weight_update_interval,
            max_train_steps = self.max_train_steps,
            max_lag = ?self.max_lag,
            "finetune stage started"
        );

        'train: while self.step < self.max_train_steps {
            self.state = FinetuneState::Accumulating;
            let mut passes = Vec::with_capacity(self.passes);
            let mut batch_stats = Vec::with_capacity(self.passes);

            for _ in 0..self.passes {
                let Some(batch) = self.next_batch(&mut examples).await else {
                    debug!(step = self.step, completed_passes = passes.len(), "example supply closed mid-step");
                    break 'train;
                };
                let metrics = self
                    .learner
                    .forward_backward(&batch, &self.objective)
                    .await
                    .map_err(|source| FinetuneError::Learner {
                        step: self.step,
                        source,
                    })?;
                self.stats.passes.fetch_add(1, Ordering::Relaxed);
                self.stats.used.fetch_add(batch.len() as u64, Ordering::Relaxed);
                batch_stats.push((batch.mean_reward(), batch.max_lag(self.current_version())));
                passes.push(metrics);
            }

            self.state = FinetuneState::Stepping;
            let lr = self.lr.lr(self.step);
            self.learner
                .apply_step(StepParams {
                    step: self.step,
                    lr,
                    weight_decay: self.weight_decay,
                    grad_scale: 1.0 / self.passes as f64,
                })
                .await
                .map_err(|source| FinetuneError::Learner {
                    step: self.step,
                    source,
                })?;
            self.step += 1;
            self.stats.steps.store(self.step, Ordering::Relaxed);
            self.log_step(lr, &passes, &batch_stats);

            if self.step % self.weight_update_interval == 0 {
                self.state = FinetuneState::Publishing;
                self.publish().await?;
            }
            if should_evaluate(self.step, self.eval_every) {
                self.request_eval();
            }
        }

        self.state = FinetuneState::Finished;
        let report = FinetuneReport {
            steps: self.step,
            passes: self.stats.passes.load(Ordering::Relaxed),
            examples_used: self.stats.used.load(Ordering::Relaxed),
            stale_examples: self.stats.stale.load(Ordering::Relaxed),
            incomplete_examples: self.incomplete,
            published_versions: self.stats.published.load(Ordering::Relaxed),
            final_version: self.current_version(),
            eval_requests: self.eval_requests,
            eval_skipped: self.eval.as_ref().map_or(0, |trigger| trigger.skipped()),
        };
        info!(?report, "finetune stage finished");
        Ok(report)
    }

    fn current_version(&self) -> u64 {
        self.publisher.current().version()
    }

    /// Pull examples until a full batch is formed, discarding stale ones.
    async fn next_batch(&mut self, examples: &mut mpsc::Receiver<TrainingExample>) -> Option<Batch> {
        let mut batch = Vec::with_capacity(self.train_batch_size);
        while batch.len() < self.train_batch_size {
            let Some(example) = examples.recv().await else {
                self.incomplete += batch.len() as u64;
                return None;
            };
            self.stats.received.fetch_add(1, Ordering::Relaxed);

            if let Some(max_lag) = self.max_lag {
                let current = self.current_version();
                let lag = example.lag(current);
                if lag > max_lag {
                    self.stats.stale.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        prompt_id = %example.prompt_id,
                        example_version = example.weight_version,
                        current,
                        lag,
                        max_lag,
                        "discarding stale example"
                    );
                    continue;
                }
            }
            batch.push(example);
        }
        Some(Batch::new(batch))
    }

    async fn publish(&mut self) -> Result<(), FinetuneError> {
        let step = self.step;
        let params = self
            .learner
            .export_weights()
            .await
            .map_err(|source| FinetuneError::Export { step, source })?;
        self.publisher
            .publish(params, step)
            .map_err(|source| FinetuneError::Publish { step, source })?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn request_eval(&mut self) {
        let Some(trigger) = &self.eval else {
            return;
        };
        let version = self.publisher.current();
        if self.last_eval_version == Some(version.version()) {
            debug!(step = self.step, version = version.version(), "version already evaluated");
            return;
        }
        if trigger.request(version.clone(), self.step) {
            self.last_eval_version = Some(version.version());
            self.eval_requests += 1;
        }
    }

    fn log_step(&self, lr: f64, passes: &[PassMetrics], batches: &[(f32, u64)]) {
        let n = passes.len().max(1) as f64;
        let loss = passes.iter().map(|p| p.loss).sum::<f64>() / n;
        if !loss.is_finite() {
            warn!(step = self.step, loss, "non-finite loss");
        }
        let policy_loss = passes.iter().map(|p| p.policy_loss).sum::<f64>() / n;
        let kl = passes.iter().map(|p| p.kl).sum::<f64>() / n;
        let tokens = passes.iter().map(|p| p.num_tokens).sum::<usize>();
        let reward = batches.iter().map(|(r, _)| *r as f64).sum::<f64>() / n;
        let max_lag = batches.iter().map(|(_, lag)| *lag).max().unwrap_or(0);

        log_metrics(
            self.step,
            &[
                ("loss", loss),
                ("policy_loss", policy_loss),
                ("kl", kl),
                ("lr", lr),
                ("reward", reward),
                ("tokens", tokens as f64),
                ("max_lag", max_lag as f64),
            ],
        );
    }
}
