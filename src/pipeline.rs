//! Wires the stages together and runs them until training finishes.
//!
//! ```text
//! prompts -> actor pool -> rollout queue -> preprocess -> finetune
//!                ^                                           |
//!                +------------- weight channel --------------+
//!                                                            |
//!                                  evaluator <-- eval trigger+
//! ```
//!
//! Shutdown cascades downstream to upstream: the finetune stage returning
//! drops the example receiver, preprocess stops and drops the rollout queue,
//! and actor lanes see the queue close. Once every lane is gone the prompt
//! feed is dropped and the producer returns.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::actor::{ActorPool, ActorSettings, PoolReport, PromptFeed};
use crate::config::{Config, ConfigError, WorldLayout};
use crate::data::{DataError, Dataset, feed_prompts};
use crate::error::Error;
use crate::evaluator::{EvalLog, EvalResult, Evaluator, eval_queue};
use crate::ferrite_task;
use crate::finetune::{FinetuneReport, FinetuneStage, Learner};
use crate::inference::{InferenceService, RetryPolicy, RetryingClient};
use crate::logging::flatten_config;
use crate::preprocess::{PreprocessReport, PreprocessStage, rollout_queue};
use crate::rollout::Scorer;
use crate::runtime::{LocalScheduler, Scheduler};
use crate::weights::{self, WeightVersion};

pub const EVAL_LOG_FILE: &str = "eval_results.jsonl";

/// Everything model-specific the pipeline drives.
pub struct Backend<L> {
    /// One inference shard per actor worker.
    pub actor_shards: Vec<Arc<dyn InferenceService>>,
    /// Dedicated evaluation capacity. `None` disables evaluation.
    pub eval_shard: Option<Arc<dyn InferenceService>>,
    pub learner: L,
    /// Parameters every shard starts from, published as version 0.
    pub initial_weights: Vec<u8>,
    pub scorer: Arc<dyn Scorer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub layout: WorldLayout,
    pub actors: PoolReport,
    pub preprocess: PreprocessReport,
    pub finetune: FinetuneReport,
    pub evaluations: Vec<EvalResult>,
    /// Prompt draws handed to the actors.
    pub prompt_draws: u64,
    pub elapsed_secs: f64,
}

pub struct Pipeline<L> {
    config: Config,
    layout: WorldLayout,
    backend: Backend<L>,
    train: Vec<Dataset>,
    test: Vec<Dataset>,
}

impl<L: Learner + 'static> Pipeline<L> {
    pub fn new(config: Config, backend: Backend<L>, train: Vec<Dataset>, test: Vec<Dataset>) -> Result<Self, Error> {
        config.validate()?;
        let layout = WorldLayout::resolve(&config.world, config.vllm_config.vllm_kwargs.tensor_parallel_size)?;

        if backend.actor_shards.is_empty() {
            return Err(ConfigError::Invalid("backend has no actor shards".to_string()).into());
        }
        if backend.actor_shards.len() != layout.actor_workers {
            warn!(
                shards = backend.actor_shards.len(),
                expected = layout.actor_workers,
                "shard count differs from the world layout"
            );
        }
        if train.iter().all(Dataset::is_empty) {
            return Err(DataError::Empty(config.train_dataset_names.join(",")).into());
        }

        Ok(Self {
            config,
            layout,
            backend,
            train,
            test,
        })
    }

    pub fn layout(&self) -> WorldLayout {
        self.layout
    }

    /// Run until the finetune stage reaches `max_train_steps` or any stage
    /// fails. A failing actor pool stops everything.
    pub async fn run(self) -> Result<PipelineReport, Error> {
        let started = Instant::now();
        let Pipeline {
            config,
            layout,
            backend,
            train,
            test,
        } = self;

        match serde_json::to_value(&config) {
            Ok(value) => {
                for (key, value) in flatten_config(&value) {
                    info!(%key, %value, "config");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize config for logging"),
        }
        info!(?layout, "starting pipeline");

        let scheduler = LocalScheduler::new("pipeline");
        let (publisher, reader) = weights::channel(
            WeightVersion::initial(backend.initial_weights),
            config.weights.retain_versions,
        );

        let evaluation = match &backend.eval_shard {
            Some(shard) if config.eval_every_n_versions > 0 && !test.is_empty() => {
                let log = EvalLog::open(config.output_dir.join(EVAL_LOG_FILE))?;
                let (trigger, requests) = eval_queue(config.evaluator.max_pending);
                let evaluator = Evaluator::new(
                    RetryingClient::new(Arc::clone(shard), RetryPolicy::from_config(&config.inference)),
                    test,
                    config.test_llm.parameters.clone(),
                    Arc::clone(&backend.scorer),
                    log,
                );
                let handle = scheduler.submit(ferrite_task!(move || evaluator.run(requests)));
                Some((trigger, handle))
            }
            _ => {
                info!("evaluation disabled");
                None
            }
        };
        let (trigger, evaluator) = evaluation.unzip();

        let feed_capacity = (config.actor.chunk_size * config.actor.threads_per_llm).max(1);
        let (prompt_tx, prompt_rx) = mpsc::channel(feed_capacity);
        let group_size = config.preprocess.group_size;
        let seed = config.seed;
        let producer = scheduler.submit(ferrite_task!(move || feed_prompts(train, group_size, seed, prompt_tx)));

        let (rollout_tx, rollout_rx) = rollout_queue(config.preprocess.queue_size, config.preprocess.shed_policy);
        let (example_tx, example_rx) = mpsc::channel(config.finetune.train_batch_size.max(1));

        let preprocess = PreprocessStage::new(&config.preprocess);
        let preprocess = scheduler.submit(ferrite_task!(move || preprocess.run(rollout_rx, example_tx)));

        let finetune = FinetuneStage::new(&config, backend.learner, publisher, trigger);
        let mut finetune = scheduler.submit(ferrite_task!(move || finetune.run(example_rx)));

        let pool = ActorPool::spawn(
            backend.actor_shards,
            ActorSettings::from_config(&config),
            Arc::clone(&backend.scorer),
            rollout_tx,
            &reader,
            PromptFeed::new(prompt_rx),
            &scheduler,
        );
        drop(reader);
        let actors = pool.join();
        tokio::pin!(actors);

        let (finetune_report, actor_report) = tokio::select! {
            finished = &mut finetune => {
                let report = finished??;
                info!(steps = report.steps, "training finished, draining actors");
                (report, actors.await?)
            }
            joined = &mut actors => match joined {
                Ok(report) => {
                    warn!("actor pool finished before training");
                    (finetune.await??, report)
                }
                Err(e) => {
                    error!(error = %e, "actor pool failed, stopping pipeline");
                    producer.abort();
                    finetune.abort();
                    return Err(e.into());
                }
            },
        };

        let preprocess_report = preprocess.await?;
        let prompt_draws = producer.await.unwrap_or(0);
        let evaluations = match evaluator {
            Some(handle) => handle.await??.results().to_vec(),
            None => Vec::new(),
        };

        let report = PipelineReport {
            layout,
            actors: actor_report,
            preprocess: preprocess_report,
            finetune: finetune_report,
            evaluations,
            prompt_draws,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            steps = report.finetune.steps,
            versions = report.finetune.published_versions,
            lost = report.actors.total.lost,
            filtered = report.preprocess.filtered,
            stale = report.finetune.stale_examples,
            evaluations = report.evaluations.len(),
            elapsed_secs = format!("{:.1}", report.elapsed_secs),
            "pipeline finished"
        );
        Ok(report)
    }
}

/// Write the report as pretty JSON to `path`.
pub fn write_report(report: &PipelineReport, path: &Path) -> Result<(), Error> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let text = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    std::fs::write(path, text)?;
    Ok(())
}
