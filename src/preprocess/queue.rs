use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use super::errors::PreprocessError;
use crate::config::ShedPolicy;
use crate::rollout::Rollout;

/// Counters shared by every producer and the consumer of one queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub shed: AtomicU64,
}

/// Create the bounded multi-producer / single-consumer rollout queue.
pub fn rollout_queue(capacity: usize, policy: ShedPolicy) -> (RolloutSender, RolloutReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(QueueStats::default());
    (
        RolloutSender {
            tx,
            policy,
            stats: Arc::clone(&stats),
        },
        RolloutReceiver { rx, stats },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    /// The queue was full and the shed policy dropped the rollout.
    Shed,
}

#[derive(Debug, Clone)]
pub struct RolloutSender {
    tx: mpsc::Sender<Rollout>,
    policy: ShedPolicy,
    stats: Arc<QueueStats>,
}

impl RolloutSender {
    /// Hand a rollout to the preprocess stage.
    ///
    /// Under `ShedPolicy::Block` this waits for room.
    pub async fn send(&self, rollout: Rollout) -> Result<SendOutcome, PreprocessError> {
        match self.policy {
            ShedPolicy::Block => {
                self.tx.send(rollout).await.map_err(|_| PreprocessError::Closed)?;
            }
            ShedPolicy::DropNewest => match self.tx.try_send(rollout) {
                Ok(()) => {}
                Err(TrySendError::Full(rollout)) => {
                    self.stats.shed.fetch_add(1, Ordering::Relaxed);
                    debug!(prompt_id = %rollout.prompt_id, lane = %rollout.lane, "queue full, shedding rollout");
                    return Ok(SendOutcome::Shed);
                }
                Err(TrySendError::Closed(_)) => return Err(PreprocessError::Closed),
            },
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(SendOutcome::Enqueued)
    }

    /// Rollouts currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[derive(Debug)]
pub struct RolloutReceiver {
    rx: mpsc::Receiver<Rollout>,
    stats: Arc<QueueStats>,
}

impl RolloutReceiver {
    /// `None` once every sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<Rollout> {
        self.rx.recv().await
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}
