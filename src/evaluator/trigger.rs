use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::weights::WeightVersion;

/// Evaluate `version`, pinned when `step` was reached.
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub version: Arc<WeightVersion>,
    pub step: u64,
}

/// Bounded queue between the finetune stage and the evaluator.
pub fn eval_queue(max_pending: usize) -> (EvalTrigger, mpsc::Receiver<EvalRequest>) {
    let (tx, rx) = mpsc::channel(max_pending.max(1));
    let trigger = EvalTrigger {
        tx,
        skipped: Arc::new(AtomicU64::new(0)),
    };
    (trigger, rx)
}

#[derive(Debug, Clone)]
pub struct EvalTrigger {
    tx: mpsc::Sender<EvalRequest>,
    skipped: Arc<AtomicU64>,
}

impl EvalTrigger {
    /// Queue an evaluation without waiting. Returns false when the request was
    /// skipped because the queue is full or the evaluator is gone.
    pub fn request(&self, version: Arc<WeightVersion>, step: u64) -> bool {
        let v = version.version();
        match self.tx.try_send(EvalRequest { version, step }) {
            Ok(()) => {
                debug!(step, version = v, "queued evaluation");
                true
            }
            Err(TrySendError::Full(_)) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                warn!(step, version = v, "evaluation queue full, skipping");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                warn!(step, version = v, "evaluator stopped, skipping");
                false
            }
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}
