use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::errors::WeightError;
use super::version::WeightVersion;

/// Create the distribution channel.
///
/// `retain` is how many published versions stay buffered for subscribers that
/// have not caught up yet.
pub fn channel(initial: WeightVersion, retain: usize) -> (WeightPublisher, WeightReader) {
    let initial = Arc::new(initial);
    let (latest_tx, latest_rx) = watch::channel(Arc::clone(&initial));
    let (updates_tx, updates_rx) = broadcast::channel(retain.max(1));

    let publisher = WeightPublisher {
        latest: latest_tx,
        updates: updates_tx,
    };
    let reader = WeightReader {
        latest: latest_rx,
        updates: updates_rx,
    };
    (publisher, reader)
}

/// The single writer of weight versions.
///
/// Not `Clone`: only the finetune stage publishes.
#[derive(Debug)]
pub struct WeightPublisher {
    latest: watch::Sender<Arc<WeightVersion>>,
    updates: broadcast::Sender<Arc<WeightVersion>>,
}

impl WeightPublisher {
    /// Publish `params` as the next version. Never waits for readers.
    pub fn publish(&mut self, params: Vec<u8>, step: u64) -> Result<Arc<WeightVersion>, WeightError> {
        if params.is_empty() {
            return Err(WeightError::EmptyPayload { step });
        }

        let next = self.latest.borrow().version() + 1;
        let version = Arc::new(WeightVersion::new(next, step, params.into()));

        // The watch swap makes the version visible to `latest()` in one step.
        self.latest.send_replace(Arc::clone(&version));
        // No subscribers is fine.
        let receivers = self.updates.send(Arc::clone(&version)).unwrap_or(0);

        info!(
            version = next,
            step,
            bytes = version.params().len(),
            receivers,
            "published weight version"
        );
        Ok(version)
    }

    pub fn current(&self) -> Arc<WeightVersion> {
        Arc::clone(&self.latest.borrow())
    }
}

/// Read access to the published versions. Cheap to clone.
#[derive(Debug)]
pub struct WeightReader {
    latest: watch::Receiver<Arc<WeightVersion>>,
    updates: broadcast::Receiver<Arc<WeightVersion>>,
}

impl Clone for WeightReader {
    fn clone(&self) -> Self {
        Self {
            latest: self.latest.clone(),
            updates: self.updates.resubscribe(),
        }
    }
}

impl WeightReader {
    /// The most recently published version.
    pub fn latest(&self) -> Arc<WeightVersion> {
        Arc::clone(&self.latest.borrow())
    }

    /// Start observing every version published from now on.
    pub fn subscribe(&self) -> WeightSubscriber {
        // Subscribe before reading `latest` so nothing published in between is missed.
        let updates = self.updates.resubscribe();
        let current = self.latest();
        WeightSubscriber {
            updates,
            current,
            lagged: 0,
        }
    }
}

/// One consumer's ordered view of the version stream.
#[derive(Debug)]
pub struct WeightSubscriber {
    updates: broadcast::Receiver<Arc<WeightVersion>>,
    current: Arc<WeightVersion>,
    lagged: u64,
}

impl WeightSubscriber {
    pub fn current(&self) -> &Arc<WeightVersion> {
        &self.current
    }

    /// Versions that were evicted before this subscriber read them.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// The next version after `current()`, in publish order.
    ///
    /// Returns `None` once the publisher is dropped and everything buffered was
    /// read.
    pub async fn next(&mut self) -> Option<Arc<WeightVersion>> {
        loop {
            match self.updates.recv().await {
                Ok(version) if version.version() <= self.current.version() => {
                    debug!(
                        version = version.version(),
                        current = self.current.version(),
                        "skipping already observed weight version"
                    );
                }
                Ok(version) => {
                    self.current = Arc::clone(&version);
                    return Some(version);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.lagged += missed;
                    warn!(
                        missed,
                        current = self.current.version(),
                        "weight subscriber fell behind the retention window"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
