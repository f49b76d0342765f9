use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use super::chunker::PromptFeed;
use super::errors::ActorError;
use super::worker::{ActorStats, ActorStatsSnapshot, ActorWorker};
use crate::config::Config;
use crate::ferrite_task;
use crate::inference::{InferenceService, RetryPolicy, RetryingClient, SamplingParams};
use crate::preprocess::RolloutSender;
use crate::rollout::Scorer;
use crate::runtime::{LocalScheduler, Scheduler, TaskGroup};
use crate::weights::WeightReader;

/// Per-worker knobs resolved from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorSettings {
    pub chunk_size: usize,
    pub threads_per_llm: usize,
    pub submit_delay: Duration,
    pub sampling: SamplingParams,
    pub retry: RetryPolicy,
    pub max_consecutive_failures: u32,
}

impl ActorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.actor.chunk_size,
            threads_per_llm: config.actor.threads_per_llm,
            submit_delay: config.submit_delay(),
            sampling: config.llm.parameters.clone(),
            retry: RetryPolicy::from_config(&config.inference),
            max_consecutive_failures: config.inference.max_consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub workers: Vec<ActorStatsSnapshot>,
    pub total: ActorStatsSnapshot,
}

impl PoolReport {
    fn from_stats(stats: &[Arc<ActorStats>]) -> Self {
        let workers: Vec<_> = stats.iter().map(|s| s.snapshot()).collect();
        let total = workers
            .iter()
            .copied()
            .fold(ActorStatsSnapshot::default(), |acc, s| acc + s);
        Self { workers, total }
    }
}

/// Fixed set of actor workers, one per inference shard. Dropping the pool
/// aborts workers that are still running.
pub struct ActorPool {
    workers: TaskGroup<Result<ActorStatsSnapshot, ActorError>>,
    stats: Vec<Arc<ActorStats>>,
}

impl ActorPool {
    /// Start one worker per shard. The rollout queue closes once every worker
    /// has finished.
    pub fn spawn(
        shards: Vec<Arc<dyn InferenceService>>,
        settings: ActorSettings,
        scorer: Arc<dyn Scorer>,
        queue: RolloutSender,
        weights: &WeightReader,
        feed: PromptFeed,
        scheduler: &LocalScheduler,
    ) -> Self {
        let mut workers = TaskGroup::new();
        let mut stats = Vec::with_capacity(shards.len());

        for (id, shard) in shards.into_iter().enumerate() {
            let client = RetryingClient::new(shard, settings.retry);
            let worker = ActorWorker::new(
                id,
                client,
                settings.clone(),
                Arc::clone(&scorer),
                queue.clone(),
                weights.subscribe(),
            );
            stats.push(worker.stats());

            let feed = feed.clone();
            let lanes = scheduler.clone();
            workers.push(scheduler.submit(ferrite_task!(move || async move { worker.run(feed, lanes).await })));
        }

        info!(
            workers = workers.len(),
            lanes_per_worker = settings.threads_per_llm,
            chunk_size = settings.chunk_size,
            "actor pool started"
        );
        Self { workers, stats }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Live counters of every worker.
    pub fn stats(&self) -> PoolReport {
        PoolReport::from_stats(&self.stats)
    }

    pub fn abort(&self) {
        self.workers.abort_all();
    }

    /// Wait for every worker. The first failure aborts the rest.
    pub async fn join(self) -> Result<PoolReport, ActorError> {
        let ActorPool { mut workers, stats } = self;

        while let Some(result) = workers.next().await {
            let failure = match result {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(e) => ActorError::Runtime(e),
            };
            error!(error = %failure, remaining = workers.len(), "actor worker failed, stopping pool");
            return Err(failure);
        }

        let report = PoolReport::from_stats(&stats);
        info!(total = ?report.total, "actor pool finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShedPolicy;
    use crate::inference::{Generation, GenerationRequest, InferenceError, ShardCapacity, StopReason};
    use crate::preprocess::rollout_queue;
    use crate::rollout::{ExactMatch, Prompt, Rollout};
    use crate::weights::{self, WeightVersion};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::mpsc;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Healthy,
        Failing,
        Hanging,
        /// Every n-th call fails.
        FailEvery(u64),
    }

    /// Answers with the version it has loaded, so tests can check tagging.
    struct VersionEcho {
        name: String,
        behaviour: Behaviour,
        latency: Duration,
        loaded: AtomicU64,
        batched_tokens: usize,
        calls: AtomicU64,
        in_flight: AtomicU64,
        peak_in_flight: AtomicU64,
    }

    impl VersionEcho {
        fn new(name: &str, behaviour: Behaviour, latency: Duration) -> Arc<dyn InferenceService> {
            Self::with_token_budget(name, behaviour, latency, 4096)
        }

        fn with_token_budget(name: &str, behaviour: Behaviour, latency: Duration, batched_tokens: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behaviour,
                latency,
                loaded: AtomicU64::new(u64::MAX),
                batched_tokens,
                calls: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                peak_in_flight: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceService for VersionEcho {
        async fn generate(&self, _request: GenerationRequest) -> Result<Generation, InferenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.behaviour {
                Behaviour::Failing => return Err(InferenceError::Unavailable("shard down".to_string())),
                Behaviour::FailEvery(n) if call % n == 0 => {
                    return Err(InferenceError::Unavailable("request dropped".to_string()));
                }
                Behaviour::Hanging => tokio::time::sleep(Duration::from_secs(3600)).await,
                Behaviour::Healthy | Behaviour::FailEvery(_) => {}
            }
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            let before = self.loaded.load(Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.loaded.load(Ordering::SeqCst) != before {
                return Err(InferenceError::InvalidInput("weights changed mid-request".to_string()));
            }
            Ok(Generation {
                tokens: vec![before as u32],
                logprobs: vec![-0.5],
                stop_reason: StopReason::Stop,
            })
        }

        async fn load_weights(&self, version: &WeightVersion) -> Result<(), InferenceError> {
            self.loaded.store(version.version(), Ordering::SeqCst);
            Ok(())
        }

        fn capacity(&self) -> ShardCapacity {
            ShardCapacity {
                max_num_seqs: 64,
                max_num_batched_tokens: self.batched_tokens,
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn settings(chunk_size: usize, threads_per_llm: usize) -> ActorSettings {
        ActorSettings {
            chunk_size,
            threads_per_llm,
            submit_delay: Duration::from_millis(10),
            sampling: SamplingParams::default(),
            retry: RetryPolicy {
                timeout: Duration::from_secs(5),
                max_retries: 1,
                backoff: Duration::from_millis(1),
            },
            max_consecutive_failures: 3,
        }
    }

    fn prompt(i: usize) -> Prompt {
        Prompt {
            id: format!("p{i}"),
            dataset: "train".to_string(),
            tokens: vec![1, 2, 3],
            answer: None,
        }
    }

    async fn drain(rx: &mut crate::preprocess::RolloutReceiver) -> Vec<Rollout> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn test_pool_turns_prompts_into_rollouts() {
        let (_publisher, reader) = weights::channel(WeightVersion::initial(vec![0]), 4);
        let (queue_tx, mut queue_rx) = rollout_queue(64, ShedPolicy::Block);
        let (prompt_tx, prompt_rx) = mpsc::channel(64);
        for i in 0..40 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }
        drop(prompt_tx);

        let shards = vec![
            VersionEcho::new("shard0", Behaviour::Healthy, Duration::from_millis(1)),
            VersionEcho::new("shard1", Behaviour::Healthy, Duration::from_millis(1)),
        ];
        let pool = ActorPool::spawn(
            shards,
            settings(4, 2),
            Arc::new(ExactMatch),
            queue_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &LocalScheduler::new("actors"),
        );
        assert_eq!(pool.len(), 2);

        let report = pool.join().await.unwrap();
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.total.submitted, 40);
        assert_eq!(report.total.completed, 40);
        assert_eq!(report.total.lost, 0);
        assert_eq!(report.total.weight_updates, 2, "each worker loads the initial version");

        let rollouts = drain(&mut queue_rx).await;
        assert_eq!(rollouts.len(), 40);
        assert!(rollouts.iter().all(|r| r.weight_version == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_weight_switch_lets_in_flight_requests_finish() {
        let (mut publisher, reader) = weights::channel(WeightVersion::initial(vec![0]), 4);
        let (queue_tx, mut queue_rx) = rollout_queue(64, ShedPolicy::Block);
        let (prompt_tx, prompt_rx) = mpsc::channel(64);

        let pool = ActorPool::spawn(
            vec![VersionEcho::new("shard0", Behaviour::Healthy, Duration::from_millis(100))],
            settings(4, 2),
            Arc::new(ExactMatch),
            queue_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &LocalScheduler::new("actors"),
        );

        for i in 0..16 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.publish(vec![1], 1).unwrap();
        for i in 16..32 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }
        drop(prompt_tx);

        let report = pool.join().await.unwrap();
        assert_eq!(report.total.lost, 0, "no request saw its weights change");
        assert_eq!(report.total.weight_updates, 2);

        let rollouts = drain(&mut queue_rx).await;
        assert_eq!(rollouts.len(), 32);
        for r in &rollouts {
            // The shard echoes the version it served the request with.
            assert_eq!(r.completion[0] as u64, r.weight_version);
        }
        assert!(rollouts.iter().any(|r| r.weight_version == 0));
        assert!(rollouts.iter().any(|r| r.weight_version == 1));
    }

    #[tokio::test]
    async fn test_lane_order_is_preserved() {
        let (_publisher, reader) = weights::channel(WeightVersion::initial(vec![0]), 4);
        let (queue_tx, mut queue_rx) = rollout_queue(64, ShedPolicy::Block);
        let (prompt_tx, prompt_rx) = mpsc::channel(64);
        for i in 0..24 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }
        drop(prompt_tx);

        let pool = ActorPool::spawn(
            vec![VersionEcho::new("shard0", Behaviour::Healthy, Duration::from_millis(1))],
            settings(4, 1),
            Arc::new(ExactMatch),
            queue_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &LocalScheduler::default(),
        );
        pool.join().await.unwrap();

        let ids: Vec<String> = drain(&mut queue_rx).await.into_iter().map(|r| r.prompt_id).collect();
        let expected: Vec<String> = (0..24).map(|i| format!("p{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_unreachable_shard_stops_the_pool() {
        let (_publisher, reader) = weights::channel(WeightVersion::initial(vec![0]), 4);
        let (queue_tx, _queue_rx) = rollout_queue(64, ShedPolicy::Block);
        let (prompt_tx, prompt_rx) = mpsc::channel(64);
        for i in 0..10 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }

        let pool = ActorPool::spawn(
            vec![
                VersionEcho::new("stuck", Behaviour::Hanging, Duration::ZERO),
                VersionEcho::new("down", Behaviour::Failing, Duration::ZERO),
            ],
            settings(1, 2),
            Arc::new(ExactMatch),
            queue_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &LocalScheduler::default(),
        );

        // The feed stays open, so only the failure can end the pool.
        let result = tokio::time::timeout(Duration::from_secs(30), pool.join())
            .await
            .expect("pool should stop on its own");
        match result {
            Err(ActorError::ShardUnreachable { worker, shard, failures, .. }) => {
                assert_eq!(worker, 1);
                assert_eq!(shard, "down");
                assert!(failures >= 3);
            }
            other => panic!("expected ShardUnreachable, got {other:?}"),
        }
        drop(prompt_tx);
    }

    #[tokio::test]
    async fn test_dropped_requests_do_not_stall_the_pool() {
        let (_publisher, reader) = weights::channel(WeightVersion::initial(vec![0]), 4);
        let (queue_tx, mut queue_rx) = rollout_queue(64, ShedPolicy::Block);
        let (prompt_tx, prompt_rx) = mpsc::channel(64);
        for i in 0..20 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }
        drop(prompt_tx);

        let mut settings = settings(4, 1);
        settings.retry.max_retries = 0;
        let pool = ActorPool::spawn(
            vec![VersionEcho::new("flaky", Behaviour::FailEvery(4), Duration::from_millis(1))],
            settings,
            Arc::new(ExactMatch),
            queue_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &LocalScheduler::default(),
        );

        // One loss per chunk never reaches three in a row.
        let report = pool.join().await.unwrap();
        assert_eq!(report.total.submitted, 20);
        assert_eq!(report.total.lost, 5);
        assert_eq!(report.total.completed, 15);
        assert_eq!(report.total.completed + report.total.lost, report.total.submitted);
        assert_eq!(drain(&mut queue_rx).await.len(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_token_budget_limits_concurrency() {
        let (_publisher, reader) = weights::channel(WeightVersion::initial(vec![0]), 4);
        let (queue_tx, mut queue_rx) = rollout_queue(64, ShedPolicy::Block);
        let (prompt_tx, prompt_rx) = mpsc::channel(64);
        for i in 0..16 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }
        drop(prompt_tx);

        // 3 prompt tokens + 4 completion tokens: two requests fit in 14.
        let shard = VersionEcho::with_token_budget("narrow", Behaviour::Healthy, Duration::from_millis(10), 14);
        let mut settings = settings(4, 2);
        settings.sampling.max_tokens = 4;
        let pool = ActorPool::spawn(
            vec![Arc::clone(&shard) as Arc<dyn InferenceService>],
            settings,
            Arc::new(ExactMatch),
            queue_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &LocalScheduler::default(),
        );

        let report = pool.join().await.unwrap();
        assert_eq!(report.total.completed, 16);
        assert_eq!(drain(&mut queue_rx).await.len(), 16);
        assert_eq!(shard.peak_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_still_runs_alone() {
        let (_publisher, reader) = weights::channel(WeightVersion::initial(vec![0]), 4);
        let (queue_tx, mut queue_rx) = rollout_queue(64, ShedPolicy::Block);
        let (prompt_tx, prompt_rx) = mpsc::channel(64);
        for i in 0..4 {
            prompt_tx.send(prompt(i)).await.unwrap();
        }
        drop(prompt_tx);

        let shard = VersionEcho::with_token_budget("tiny", Behaviour::Healthy, Duration::from_millis(10), 5);
        let mut settings = settings(4, 1);
        settings.sampling.max_tokens = 16;
        let pool = ActorPool::spawn(
            vec![Arc::clone(&shard) as Arc<dyn InferenceService>],
            settings,
            Arc::new(ExactMatch),
            queue_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &LocalScheduler::default(),
        );

        pool.join().await.unwrap();
        assert_eq!(drain(&mut queue_rx).await.len(), 4);
        assert_eq!(shard.peak_in_flight.load(Ordering::SeqCst), 1);
    }
}
