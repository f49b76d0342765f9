use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::queue::RolloutReceiver;
use super::transform::{TrainingExample, Transform};
use crate::config::PreprocessConfig;
use crate::rollout::Rollout;

/// Group-relative advantages: `r - mean(r)`, divided by the population std
/// when `normalize` is set.
///
/// A group with (near) zero spread gets all-zero advantages when normalized.
pub fn group_advantages(rewards: &[f32], normalize: bool) -> Vec<f32> {
    if rewards.is_empty() {
        return Vec::new();
    }
    let n = rewards.len() as f32;
    let mean = rewards.iter().sum::<f32>() / n;
    if !normalize {
        return rewards.iter().map(|r| r - mean).collect();
    }

    let std = (rewards.iter().map(|r| (r - mean).powi(2)).sum::<f32>() / n).sqrt();
    if std < 1e-6 {
        return vec![0.0; rewards.len()];
    }
    rewards.iter().map(|r| (r - mean) / std).collect()
}

#[derive(Debug, Default)]
pub struct PreprocessStats {
    pub received: AtomicU64,
    pub produced: AtomicU64,
    pub filtered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreprocessReport {
    pub received: u64,
    pub produced: u64,
    pub filtered: u64,
    pub shed: u64,
}

/// Consumes the rollout queue and feeds the finetune stage.
pub struct PreprocessStage {
    transform: Transform,
    group_size: usize,
    normalize_advantage: bool,
    max_pending_groups: usize,
    stats: Arc<PreprocessStats>,
}

impl PreprocessStage {
    pub fn new(config: &PreprocessConfig) -> Self {
        Self {
            transform: Transform::from_config(config),
            group_size: config.group_size.max(1),
            normalize_advantage: config.normalize_advantage,
            max_pending_groups: config.queue_size.max(1),
            stats: Arc::new(PreprocessStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PreprocessStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the rollout queue closes or the finetune stage stops listening.
    pub async fn run(
        self,
        mut rollouts: RolloutReceiver,
        examples: mpsc::Sender<TrainingExample>,
    ) -> PreprocessReport {
        let queue_stats = rollouts.stats();
        let mut groups = GroupBuffer::new(self.group_size, self.max_pending_groups);

        'outer: while let Some(rollout) = rollouts.recv().await {
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            for group in groups.push(rollout) {
                for example in self.process_group(group) {
                    if examples.send(example).await.is_err() {
                        debug!("finetune stage stopped accepting examples");
                        break 'outer;
                    }
                }
            }
        }

        if !examples.is_closed() {
            for group in groups.drain() {
                for example in self.process_group(group) {
                    if examples.send(example).await.is_err() {
                        break;
                    }
                }
            }
        }

        let report = PreprocessReport {
            received: self.stats.received.load(Ordering::Relaxed),
            produced: self.stats.produced.load(Ordering::Relaxed),
            filtered: self.stats.filtered.load(Ordering::Relaxed),
            shed: queue_stats.shed.load(Ordering::Relaxed),
        };
        info!(?report, "preprocess stage finished");
        report
    }

    /// Turn one complete (or flushed) group into examples, filtering bad rollouts.
    pub fn process_group(&self, group: Vec<Rollout>) -> Vec<TrainingExample> {
        let mut valid = Vec::with_capacity(group.len());
        for rollout in group {
            match self.transform.validate(&rollout) {
                Ok(()) => valid.push(rollout),
                Err(reason) => {
                    self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                    debug!(prompt_id = %rollout.prompt_id, lane = %rollout.lane, ?reason, "filtered rollout");
                }
            }
        }

        let shaped: Vec<f32> = valid
            .iter()
            .map(|r| self.transform.shape_reward(r.reward))
            .collect();
        let advantages = if self.group_size > 1 {
            group_advantages(&shaped, self.normalize_advantage)
        } else {
            shaped
        };

        let mut out = Vec::with_capacity(valid.len());
        for (rollout, advantage) in valid.iter().zip(advantages) {
            if let Ok(example) = self.transform.apply(rollout, advantage) {
                out.push(example);
            }
        }
        self.stats.produced.fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }
}

/// Collects rollouts of the same prompt until the group is complete.
struct GroupBuffer {
    group_size: usize,
    max_pending: usize,
    pending: HashMap<String, Vec<Rollout>>,
    order: VecDeque<String>,
}

impl GroupBuffer {
    fn new(group_size: usize, max_pending: usize) -> Self {
        Self {
            group_size,
            max_pending,
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns the groups that became ready.
    fn push(&mut self, rollout: Rollout) -> Vec<Vec<Rollout>> {
        if self.group_size == 1 {
            return vec![vec![rollout]];
        }

        let key = rollout.prompt_id.clone();
        let entry = self.pending.entry(key.clone()).or_insert_with(|| {
            self.order.push_back(key.clone());
            Vec::with_capacity(self.group_size)
        });
        entry.push(rollout);

        let mut ready = Vec::new();
        if entry.len() >= self.group_size {
            if let Some(group) = self.pending.remove(&key) {
                self.order.retain(|k| k != &key);
                ready.push(group);
            }
        }

        // Lost rollouts leave groups incomplete; flush the oldest ones.
        while self.pending.len() > self.max_pending {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(group) = self.pending.remove(&oldest) {
                debug!(prompt_id = %oldest, size = group.len(), "flushing incomplete group");
                ready.push(group);
            }
        }
        ready
    }

    fn drain(&mut self) -> Vec<Vec<Rollout>> {
        self.order
            .drain(..)
            .filter_map(|key| self.pending.remove(&key))
            .collect()
    }
}
