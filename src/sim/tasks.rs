use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::learner::UnigramLearner;
use super::policy::UnigramPolicy;
use super::shard::SimulatedShard;
use crate::config::{Config, SimConfig, WorldLayout};
use crate::data::Dataset;
use crate::inference::{InferenceService, ShardCapacity};
use crate::pipeline::Backend;
use crate::rollout::{Prompt, scorer_for};

/// Random prompts whose reference answer is `sim.target_token`.
pub fn synthetic_dataset(name: &str, sim: &SimConfig, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let vocab = sim.vocab_size.max(2) as u32;
    let prompts = (0..sim.prompts_per_dataset)
        .map(|i| Prompt {
            id: format!("{name}-{i}"),
            dataset: name.to_string(),
            tokens: (0..sim.prompt_len).map(|_| rng.gen_range(1..vocab)).collect(),
            answer: Some(vec![sim.target_token]),
        })
        .collect();
    Dataset::new(name, prompts)
}

/// Synthetic train and test datasets for the configured names.
pub fn datasets(config: &Config) -> (Vec<Dataset>, Vec<Dataset>) {
    let make = |names: &[String], offset: u64| -> Vec<Dataset> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| synthetic_dataset(name, &config.sim, config.seed + offset + i as u64))
            .collect()
    };
    (
        make(&config.train_dataset_names, 0),
        make(&config.test_dataset_names, 1_000),
    )
}

/// One simulated shard per actor worker plus a dedicated evaluation shard,
/// all starting from the uniform policy.
pub fn backend(config: &Config, layout: &WorldLayout) -> Backend<UnigramLearner> {
    let initial = UnigramPolicy::uniform(config.sim.vocab_size);
    let kwargs = &config.vllm_config.vllm_kwargs;
    let capacity = ShardCapacity {
        max_num_seqs: kwargs.max_num_seqs,
        max_num_batched_tokens: kwargs.max_num_batched_tokens,
    };

    let shard = |name: String, seed: u64| {
        SimulatedShard::new(name, initial.clone(), capacity, seed)
            .with_latency(config.sim.latency())
            .with_failure_rate(config.sim.failure_rate)
    };
    let actor_shards = (0..layout.actor_workers.max(1))
        .map(|i| Arc::new(shard(format!("sim{i}"), config.seed + i as u64)) as Arc<dyn InferenceService>)
        .collect();
    let eval_shard: Arc<dyn InferenceService> = Arc::new(shard("sim-eval".to_string(), config.seed + 10_000));

    Backend {
        actor_shards,
        eval_shard: Some(eval_shard),
        learner: UnigramLearner::new(&initial),
        initial_weights: initial.to_bytes(),
        scorer: scorer_for(config.reward),
    }
}
