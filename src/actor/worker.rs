use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::chunker::PromptFeed;
use super::errors::ActorError;
use super::pool::ActorSettings;
use crate::ferrite_task;
use crate::inference::{GenerationRequest, InferenceError, RetryingClient};
use crate::preprocess::{PreprocessError, RolloutSender, SendOutcome};
use crate::rollout::{LaneId, Prompt, Rollout, Scorer};
use crate::runtime::{LocalScheduler, Scheduler, TaskGroup};
use crate::weights::{WeightSubscriber, WeightVersion};

#[derive(Debug, Default)]
pub struct ActorStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub lost: AtomicU64,
    pub shed: AtomicU64,
    pub chunks: AtomicU64,
    pub partial_chunks: AtomicU64,
    pub weight_updates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActorStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub lost: u64,
    pub shed: u64,
    pub chunks: u64,
    pub partial_chunks: u64,
    pub weight_updates: u64,
}

impl ActorStats {
    pub fn snapshot(&self) -> ActorStatsSnapshot {
        ActorStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            partial_chunks: self.partial_chunks.load(Ordering::Relaxed),
            weight_updates: self.weight_updates.load(Ordering::Relaxed),
        }
    }
}

impl std::ops::Add for ActorStatsSnapshot {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            submitted: self.submitted + other.submitted,
            completed: self.completed + other.completed,
            lost: self.lost + other.lost,
            shed: self.shed + other.shed,
            chunks: self.chunks + other.chunks,
            partial_chunks: self.partial_chunks + other.partial_chunks,
            weight_updates: self.weight_updates + other.weight_updates,
        }
    }
}

/// One actor bound to one inference shard.
///
/// Lanes hold a read guard on the loaded version for the whole lifetime of a
/// request. Loading a new version takes the write guard, so it waits for
/// in-flight requests and holds back new submissions until the shard serves
/// the new weights.
pub struct ActorWorker {
    inner: Arc<WorkerInner>,
    weights: WeightSubscriber,
}

struct WorkerInner {
    id: usize,
    client: RetryingClient,
    settings: ActorSettings,
    loaded: RwLock<Arc<WeightVersion>>,
    sequences: Semaphore,
    /// One permit per token of `max_num_batched_tokens`.
    tokens: Semaphore,
    token_budget: u32,
    scorer: Arc<dyn Scorer>,
    queue: RolloutSender,
    stats: Arc<ActorStats>,
    consecutive_failures: AtomicU32,
}

#[derive(Debug)]
enum LaneExit {
    FeedClosed,
    QueueClosed,
}

impl ActorWorker {
    pub fn new(
        id: usize,
        client: RetryingClient,
        settings: ActorSettings,
        scorer: Arc<dyn Scorer>,
        queue: RolloutSender,
        weights: WeightSubscriber,
    ) -> Self {
        let capacity = client.capacity();
        let max_num_seqs = capacity.max_num_seqs.max(1);
        let token_budget = capacity.max_num_batched_tokens.clamp(1, u32::MAX as usize) as u32;
        let initial = Arc::clone(weights.current());
        Self {
            inner: Arc::new(WorkerInner {
                id,
                client,
                settings,
                loaded: RwLock::new(initial),
                sequences: Semaphore::new(max_num_seqs),
                tokens: Semaphore::new(token_budget as usize),
                token_budget,
                scorer,
                queue,
                stats: Arc::new(ActorStats::default()),
                consecutive_failures: AtomicU32::new(0),
            }),
            weights,
        }
    }

    pub fn stats(&self) -> Arc<ActorStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Load the subscribed version onto the shard, then run lanes until the
    /// prompt feed or the rollout queue closes.
    pub async fn run(self, feed: PromptFeed, scheduler: LocalScheduler) -> Result<ActorStatsSnapshot, ActorError> {
        let ActorWorker { inner, mut weights } = self;
        inner.load(Arc::clone(weights.current()), true).await?;

        let mut lanes: TaskGroup<Result<LaneExit, ActorError>> = (0..inner.settings.threads_per_llm)
            .map(|lane| {
                let inner = Arc::clone(&inner);
                let feed = feed.clone();
                let id = LaneId {
                    worker: inner.id,
                    lane,
                };
                scheduler.submit(ferrite_task!(move || async move { inner.run_lane(id, feed).await }))
            })
            .collect();
        info!(worker = inner.id, shard = inner.client.name(), lanes = lanes.len(), "actor started");

        let outcome = {
            let follow = async {
                while let Some(version) = weights.next().await {
                    inner.load(version, false).await?;
                }
                Ok::<(), ActorError>(())
            };
            tokio::pin!(follow);

            let mut following = true;
            loop {
                tokio::select! {
                    next = lanes.next() => match next {
                        None => break Ok(()),
                        Some(Ok(Ok(exit))) => debug!(worker = inner.id, ?exit, "lane finished"),
                        Some(Ok(Err(e))) => break Err(e),
                        Some(Err(e)) => break Err(ActorError::Runtime(e)),
                    },
                    result = &mut follow, if following => {
                        // Without a publisher the lanes keep the last version.
                        following = false;
                        if let Err(e) = result {
                            break Err(e);
                        }
                    }
                }
            }
        };

        // Dropping `lanes` on the error path aborts whatever is still running.
        outcome?;

        let snapshot = inner.stats.snapshot();
        info!(worker = inner.id, ?snapshot, lagged = weights.lagged(), "actor finished");
        Ok(snapshot)
    }
}

impl WorkerInner {
    /// Swap the shard to `version`. Waits for in-flight requests to finish.
    async fn load(&self, version: Arc<WeightVersion>, force: bool) -> Result<(), ActorError> {
        let mut loaded = self.loaded.write().await;
        if !force && version.version() <= loaded.version() {
            return Ok(());
        }
        self.client
            .load_weights(&version)
            .await
            .map_err(|source| ActorError::WeightLoad {
                worker: self.id,
                version: version.version(),
                source,
            })?;
        let previous = loaded.version();
        *loaded = version;
        self.stats.weight_updates.fetch_add(1, Ordering::Relaxed);
        info!(
            worker = self.id,
            from = previous,
            to = loaded.version(),
            "actor switched weight version"
        );
        Ok(())
    }

    async fn run_lane(self: Arc<Self>, lane: LaneId, feed: PromptFeed) -> Result<LaneExit, ActorError> {
        let settings = &self.settings;
        while let Some(chunk) = feed.next_chunk(settings.chunk_size, settings.submit_delay).await {
            self.stats.chunks.fetch_add(1, Ordering::Relaxed);
            if chunk.is_partial() {
                self.stats.partial_chunks.fetch_add(1, Ordering::Relaxed);
                debug!(%lane, size = chunk.prompts.len(), reason = ?chunk.reason, "flushing partial chunk");
            }

            let results = join_all(chunk.prompts.into_iter().map(|prompt| self.generate(lane, prompt))).await;

            // Forward in submission order.
            for result in results {
                match result {
                    Ok(rollout) => match self.queue.send(rollout).await {
                        Ok(SendOutcome::Enqueued) => {}
                        Ok(SendOutcome::Shed) => {
                            self.stats.shed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(PreprocessError::Closed) => return Ok(LaneExit::QueueClosed),
                    },
                    Err((prompt_id, error)) => self.record_loss(lane, &prompt_id, error)?,
                }
            }
        }
        Ok(LaneExit::FeedClosed)
    }

    async fn generate(&self, lane: LaneId, prompt: Prompt) -> Result<Rollout, (String, InferenceError)> {
        // Neither semaphore is ever closed.
        let _sequence = self.sequences.acquire().await.ok();
        let _tokens = self.tokens.acquire_many(self.token_cost(&prompt)).await.ok();
        let loaded = self.loaded.read().await;
        let weight_version = loaded.version();

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let request = GenerationRequest {
            prompt_id: prompt.id.clone(),
            prompt_tokens: prompt.tokens.clone(),
            sampling: self.settings.sampling.clone(),
        };
        let generation = self.client.generate(request).await;
        drop(loaded);

        let generation = generation.map_err(|e| (prompt.id.clone(), e))?;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);

        let reward = self.scorer.score(&prompt, &generation.tokens);
        Ok(Rollout {
            prompt_id: prompt.id,
            prompt_tokens: prompt.tokens,
            completion: generation.tokens,
            logprobs: generation.logprobs,
            reward,
            weight_version,
            stop_reason: generation.stop_reason,
            lane,
        })
    }

    /// Tokens a request may occupy on the shard: the prompt plus the longest
    /// allowed completion, capped at the shard budget.
    fn token_cost(&self, prompt: &Prompt) -> u32 {
        let wanted = prompt.tokens.len() as u64 + u64::from(self.settings.sampling.max_tokens);
        wanted.min(u64::from(self.token_budget)) as u32
    }

    fn record_loss(&self, lane: LaneId, prompt_id: &str, error: InferenceError) -> Result<(), ActorError> {
        self.stats.lost.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(%lane, prompt_id, failures, error = %error, "dropping rollout after exhausting retries");

        if failures >= self.settings.max_consecutive_failures {
            return Err(ActorError::ShardUnreachable {
                worker: self.id,
                shard: self.client.name().to_string(),
                failures,
                last_error: error,
            });
        }
        Ok(())
    }
}
