use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::errors::EvalError;
use super::log::{EvalLog, EvalResult};
use super::trigger::EvalRequest;
use crate::data::Dataset;
use crate::inference::{GenerationRequest, RetryingClient, SamplingParams};
use crate::rollout::Scorer;

/// Runs the test datasets against pinned weight versions on its own shard.
pub struct Evaluator {
    client: RetryingClient,
    datasets: Vec<Dataset>,
    sampling: SamplingParams,
    scorer: Arc<dyn Scorer>,
    log: EvalLog,
}

impl Evaluator {
    pub fn new(
        client: RetryingClient,
        datasets: Vec<Dataset>,
        sampling: SamplingParams,
        scorer: Arc<dyn Scorer>,
        log: EvalLog,
    ) -> Self {
        Self {
            client,
            datasets,
            sampling,
            scorer,
            log,
        }
    }

    pub fn log(&self) -> &EvalLog {
        &self.log
    }

    /// Serve requests until the trigger side is dropped, then return the log.
    ///
    /// A version that cannot be loaded or was already recorded is skipped;
    /// failing to write the log is fatal.
    pub async fn run(mut self, mut requests: mpsc::Receiver<EvalRequest>) -> Result<EvalLog, EvalError> {
        while let Some(request) = requests.recv().await {
            match self.evaluate(&request).await {
                Ok(results) => {
                    for r in &results {
                        info!(
                            dataset = %r.dataset_name,
                            version = r.weight_version,
                            step = r.step,
                            score = format!("{:.3}", r.aggregate_score),
                            failed = r.num_failed,
                            "evaluation finished"
                        );
                    }
                }
                Err(e @ EvalError::WeightLoad { .. }) | Err(e @ EvalError::Duplicate { .. }) => {
                    warn!(step = request.step, error = %e, "skipping evaluation");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.log)
    }

    /// Evaluate every dataset not yet recorded for `request.version`.
    ///
    /// Fails with `Duplicate` only when every dataset already has a result.
    pub async fn evaluate(&mut self, request: &EvalRequest) -> Result<Vec<EvalResult>, EvalError> {
        let version = request.version.version();
        let (done, pending): (Vec<&Dataset>, Vec<&Dataset>) = self
            .datasets
            .iter()
            .partition(|dataset| self.log.contains(&dataset.name, version));
        if pending.is_empty() {
            if let Some(dataset) = done.first() {
                return Err(EvalError::Duplicate {
                    dataset: dataset.name.clone(),
                    version,
                });
            }
        }
        for dataset in &done {
            debug!(dataset = %dataset.name, version, "already evaluated");
        }

        self.client
            .load_weights(&request.version)
            .await
            .map_err(|source| EvalError::WeightLoad { version, source })?;

        let concurrency = self.client.capacity().max_num_seqs;
        let mut results = Vec::with_capacity(pending.len());
        for dataset in pending {
            let requests = dataset
                .prompts
                .iter()
                .map(|p| GenerationRequest {
                    prompt_id: p.id.clone(),
                    prompt_tokens: p.tokens.clone(),
                    sampling: self.sampling.clone(),
                })
                .collect();
            let generations = self.client.generate_all(requests, concurrency).await;

            let mut total = 0.0f64;
            let mut scored = 0usize;
            let mut failed = 0usize;
            for (prompt, generation) in dataset.prompts.iter().zip(generations) {
                match generation {
                    Ok(g) => {
                        total += self.scorer.score(prompt, &g.tokens) as f64;
                        scored += 1;
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(dataset = %dataset.name, prompt_id = %prompt.id, error = %e, "evaluation prompt failed");
                    }
                }
            }

            let result = EvalResult {
                run_id: self.log.run_id(),
                dataset_name: dataset.name.clone(),
                weight_version: version,
                step: request.step,
                aggregate_score: if scored > 0 { total / scored as f64 } else { 0.0 },
                num_prompts: dataset.prompts.len(),
                num_failed: failed,
            };
            self.log.append(result.clone())?;
            results.push(result);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::eval_queue;
    use crate::inference::{Generation, InferenceError, InferenceService, RetryPolicy, ShardCapacity, StopReason};
    use crate::rollout::{ExactMatch, Prompt};
    use crate::weights::WeightVersion;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Answers correctly once version 2 or later is loaded.
    struct LearningShard {
        loaded: AtomicU64,
    }

    #[async_trait]
    impl InferenceService for LearningShard {
        async fn generate(&self, request: GenerationRequest) -> Result<Generation, InferenceError> {
            if request.prompt_id == "broken" {
                return Err(InferenceError::InvalidInput("bad prompt".to_string()));
            }
            let token = if self.loaded.load(Ordering::SeqCst) >= 2 {
                request.prompt_tokens[0]
            } else {
                0
            };
            Ok(Generation {
                tokens: vec![token],
                logprobs: vec![-0.1],
                stop_reason: StopReason::Stop,
            })
        }

        async fn load_weights(&self, version: &WeightVersion) -> Result<(), InferenceError> {
            if version.params().is_empty() {
                return Err(InferenceError::WeightLoad {
                    version: version.version(),
                    reason: "empty".to_string(),
                });
            }
            self.loaded.store(version.version(), Ordering::SeqCst);
            Ok(())
        }

        fn capacity(&self) -> ShardCapacity {
            ShardCapacity {
                max_num_seqs: 4,
                max_num_batched_tokens: 1024,
            }
        }

        fn name(&self) -> &str {
            "eval"
        }
    }

    fn evaluator(log: EvalLog) -> Evaluator {
        let prompts = (1..=4)
            .map(|i| Prompt {
                id: format!("t{i}"),
                dataset: "test".to_string(),
                tokens: vec![i],
                answer: Some(vec![i]),
            })
            .chain(std::iter::once(Prompt {
                id: "broken".to_string(),
                dataset: "test".to_string(),
                tokens: vec![9],
                answer: Some(vec![9]),
            }))
            .collect();
        evaluator_with(vec![Dataset::new("test", prompts)], log)
    }

    fn evaluator_with(datasets: Vec<Dataset>, log: EvalLog) -> Evaluator {
        let client = RetryingClient::new(
            Arc::new(LearningShard {
                loaded: AtomicU64::new(0),
            }),
            RetryPolicy {
                timeout: Duration::from_secs(5),
                max_retries: 0,
                backoff: Duration::ZERO,
            },
        );
        Evaluator::new(
            client,
            datasets,
            SamplingParams {
                temperature: 0.0,
                ..SamplingParams::default()
            },
            Arc::new(ExactMatch),
            log,
        )
    }

    fn request(version: u64) -> EvalRequest {
        EvalRequest {
            version: Arc::new(WeightVersion::new(version, version * 10, vec![1u8].into())),
            step: version * 10,
        }
    }

    #[tokio::test]
    async fn test_scores_pinned_version() {
        let mut eval = evaluator(EvalLog::in_memory());

        let early = eval.evaluate(&request(1)).await.unwrap();
        assert_eq!(early[0].aggregate_score, 0.0);
        assert_eq!(early[0].num_prompts, 5);
        assert_eq!(early[0].num_failed, 1);

        let late = eval.evaluate(&request(2)).await.unwrap();
        assert_eq!(late[0].aggregate_score, 1.0);
        assert_eq!(late[0].weight_version, 2);
        assert_eq!(late[0].step, 20);
        assert_eq!(eval.log().results().len(), 2);
    }

    #[tokio::test]
    async fn test_run_skips_duplicates_and_bad_versions() {
        let (trigger, rx) = eval_queue(8);
        let eval = evaluator(EvalLog::in_memory());

        assert!(trigger.request(request(2).version, 20));
        assert!(trigger.request(request(2).version, 20));
        assert!(trigger.request(Arc::new(WeightVersion::new(3, 30, Vec::<u8>::new().into())), 30));
        drop(trigger);

        let log = eval.run(rx).await.unwrap();
        assert_eq!(log.results().len(), 1);
        assert_eq!(log.results()[0].weight_version, 2);
    }

    #[tokio::test]
    async fn test_recorded_dataset_does_not_block_the_others() {
        let dataset = |name: &str| {
            let prompts = (1..=3)
                .map(|i| Prompt {
                    id: format!("{name}{i}"),
                    dataset: name.to_string(),
                    tokens: vec![i],
                    answer: Some(vec![i]),
                })
                .collect();
            Dataset::new(name, prompts)
        };

        let mut log = EvalLog::in_memory();
        log.append(EvalResult {
            run_id: log.run_id(),
            dataset_name: "a".to_string(),
            weight_version: 2,
            step: 20,
            aggregate_score: 0.5,
            num_prompts: 3,
            num_failed: 0,
        })
        .unwrap();
        let mut eval = evaluator_with(vec![dataset("a"), dataset("b")], log);

        let results = eval.evaluate(&request(2)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dataset_name, "b");
        assert_eq!(results[0].aggregate_score, 1.0);
        assert_eq!(eval.log().results().len(), 2);
        assert_eq!(eval.log().results()[0].aggregate_score, 0.5);

        let again = eval.evaluate(&request(2)).await;
        assert!(matches!(again, Err(EvalError::Duplicate { version: 2, .. })));
    }
}
