//! Typed run configuration.
//!
//! Every section rejects unknown keys at load time, and `Config::validate`
//! checks cross-field constraints before anything is spawned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::inference::SamplingParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Run directory: logs and the evaluation log land here.
    pub output_dir: PathBuf,
    /// Directory holding `<dataset>.jsonl` prompt files. `None` uses synthetic prompts.
    pub data_dir: Option<PathBuf>,
    pub seed: u64,
    pub world: WorldConfig,
    pub vllm_config: VllmConfig,
    pub actor: ActorConfig,
    pub inference: InferenceConfig,
    pub preprocess: PreprocessConfig,
    /// Training-time sampling parameters.
    pub llm: LlmConfig,
    /// Evaluation-time sampling parameters.
    pub test_llm: LlmConfig,
    pub finetune: FinetuneConfig,
    pub weights: WeightsConfig,
    pub evaluator: EvaluatorConfig,
    pub train_dataset_names: Vec<String>,
    pub test_dataset_names: Vec<String>,
    /// Evaluate whenever the step counter is a multiple of this. 0 disables evaluation.
    pub eval_every_n_versions: u64,
    /// How completions are scored against reference answers.
    pub reward: RewardKind,
    /// Built-in simulated backend used by the binary.
    pub sim: SimConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorldConfig {
    /// Accelerator slots shared by the three stages.
    pub total_slots: usize,
    pub actor_fraction: u32,
    pub preprocessor_fraction: u32,
    pub finetune_fraction: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct VllmConfig {
    pub vllm_kwargs: VllmKwargs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VllmKwargs {
    /// Sequences a shard runs concurrently.
    pub max_num_seqs: usize,
    /// Token budget of one engine step.
    pub max_num_batched_tokens: usize,
    /// Slots used by one shard.
    pub tensor_parallel_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ActorConfig {
    pub chunk_size: usize,
    pub threads_per_llm: usize,
    /// Seconds a lane waits before flushing a partial chunk.
    pub submit_delay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InferenceConfig {
    /// Per-attempt timeout in seconds.
    pub request_timeout: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Initial backoff in seconds, doubled after every failed attempt.
    pub retry_backoff: f64,
    /// Consecutive lost rollouts after which a worker gives up on its shard.
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShedPolicy {
    /// Producers wait for room.
    #[default]
    Block,
    /// A full queue drops the incoming rollout.
    DropNewest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PreprocessConfig {
    pub queue_size: usize,
    pub shed_policy: ShedPolicy,
    /// Fixed length of every training example.
    pub seq_length: usize,
    /// Rollouts per prompt that share an advantage baseline.
    pub group_size: usize,
    pub reward_scale: f32,
    pub reward_clip: Option<f32>,
    pub normalize_advantage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LlmConfig {
    pub parameters: SamplingParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossAggregation {
    #[default]
    Mean,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    /// 1.0 when the completion starts with the answer.
    #[default]
    ExactMatch,
    /// Fraction of completion tokens found in the answer.
    AnswerOverlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    Linear,
    Cosine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FinetuneConfig {
    pub train_batch_size: usize,
    pub gradient_accumulation_passes: usize,
    pub weight_update_interval: u64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub num_warmup_steps: u64,
    pub lr_schedule: LrSchedule,
    pub max_train_steps: u64,
    pub kl_coef: f64,
    pub aggregate_loss: LossAggregation,
    /// `None` means unbounded staleness.
    pub max_lag: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WeightsConfig {
    /// Published versions kept for subscribers that are behind.
    pub retain_versions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EvaluatorConfig {
    /// Evaluation requests queued behind the one running.
    pub max_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimConfig {
    pub vocab_size: usize,
    /// Token every synthetic prompt's reference answer consists of.
    pub target_token: u32,
    pub prompts_per_dataset: usize,
    pub prompt_len: usize,
    /// Seconds each simulated generation takes.
    pub latency: f64,
    /// Probability that a simulated request fails transiently.
    pub failure_rate: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32,
            target_token: 7,
            prompts_per_dataset: 64,
            prompt_len: 6,
            latency: 0.0,
            failure_rate: 0.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results/ferrite"),
            data_dir: None,
            seed: 42,
            world: WorldConfig::default(),
            vllm_config: VllmConfig::default(),
            actor: ActorConfig::default(),
            inference: InferenceConfig::default(),
            preprocess: PreprocessConfig::default(),
            llm: LlmConfig {
                parameters: SamplingParams {
                    temperature: 1.0,
                    max_tokens: 64,
                    ..SamplingParams::default()
                },
            },
            test_llm: LlmConfig {
                parameters: SamplingParams {
                    temperature: 0.0,
                    max_tokens: 64,
                    ..SamplingParams::default()
                },
            },
            finetune: FinetuneConfig::default(),
            weights: WeightsConfig::default(),
            evaluator: EvaluatorConfig::default(),
            train_dataset_names: vec!["train".to_string()],
            test_dataset_names: vec!["test".to_string()],
            eval_every_n_versions: 43_200,
            reward: RewardKind::default(),
            sim: SimConfig::default(),
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            total_slots: 8,
            actor_fraction: 4,
            preprocessor_fraction: 0,
            finetune_fraction: 4,
        }
    }
}

impl Default for VllmKwargs {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 8192,
            tensor_parallel_size: 1,
        }
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8,
            threads_per_llm: 16,
            submit_delay: 1.0,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            request_timeout: 600.0,
            max_retries: 3,
            retry_backoff: 1.0,
            max_consecutive_failures: 64,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            shed_policy: ShedPolicy::Block,
            seq_length: 256,
            group_size: 1,
            reward_scale: 1.0,
            reward_clip: None,
            normalize_advantage: false,
        }
    }
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            train_batch_size: 4,
            gradient_accumulation_passes: 8,
            weight_update_interval: 1,
            learning_rate: 1e-6,
            weight_decay: 0.01,
            num_warmup_steps: 25,
            lr_schedule: LrSchedule::Constant,
            max_train_steps: 1000,
            kl_coef: 0.0,
            aggregate_loss: LossAggregation::Mean,
            max_lag: None,
        }
    }
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self { retain_versions: 4 }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self { max_pending: 2 }
    }
}

impl Config {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require(ok: bool, msg: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(msg.to_string()))
            }
        }

        let kwargs = &self.vllm_config.vllm_kwargs;
        require(kwargs.max_num_seqs > 0, "vllm_kwargs.max_num_seqs must be positive")?;
        require(kwargs.max_num_batched_tokens > 0, "vllm_kwargs.max_num_batched_tokens must be positive")?;
        require(kwargs.tensor_parallel_size > 0, "vllm_kwargs.tensor_parallel_size must be positive")?;

        require(self.actor.chunk_size > 0, "actor.chunk_size must be positive")?;
        require(self.actor.threads_per_llm > 0, "actor.threads_per_llm must be positive")?;
        require(is_seconds(self.actor.submit_delay), "actor.submit_delay must be a non-negative number of seconds")?;

        require(
            is_seconds(self.inference.request_timeout) && self.inference.request_timeout > 0.0,
            "inference.request_timeout must be positive",
        )?;
        require(is_seconds(self.inference.retry_backoff), "inference.retry_backoff must be non-negative")?;
        require(
            self.inference.max_consecutive_failures > 0,
            "inference.max_consecutive_failures must be positive",
        )?;

        let pre = &self.preprocess;
        require(pre.queue_size > 0, "preprocess.queue_size must be positive")?;
        require(pre.seq_length >= 2, "preprocess.seq_length must be at least 2")?;
        require(pre.group_size > 0, "preprocess.group_size must be positive")?;
        require(pre.reward_scale.is_finite(), "preprocess.reward_scale must be finite")?;
        if let Some(clip) = pre.reward_clip {
            require(clip.is_finite() && clip > 0.0, "preprocess.reward_clip must be positive")?;
        }

        for (name, params) in [("llm", &self.llm.parameters), ("test_llm", &self.test_llm.parameters)] {
            params
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("{name}.parameters: {e}")))?;
        }

        let ft = &self.finetune;
        require(ft.train_batch_size > 0, "finetune.train_batch_size must be positive")?;
        require(
            ft.gradient_accumulation_passes > 0,
            "finetune.gradient_accumulation_passes must be positive",
        )?;
        require(ft.weight_update_interval > 0, "finetune.weight_update_interval must be positive")?;
        require(
            ft.learning_rate.is_finite() && ft.learning_rate > 0.0,
            "finetune.learning_rate must be positive",
        )?;
        require(
            ft.weight_decay.is_finite() && ft.weight_decay >= 0.0,
            "finetune.weight_decay must be non-negative",
        )?;
        require(ft.kl_coef.is_finite() && ft.kl_coef >= 0.0, "finetune.kl_coef must be non-negative")?;
        require(ft.max_train_steps > 0, "finetune.max_train_steps must be positive")?;

        require(self.weights.retain_versions > 0, "weights.retain_versions must be positive")?;
        require(self.evaluator.max_pending > 0, "evaluator.max_pending must be positive")?;
        require(!self.train_dataset_names.is_empty(), "train_dataset_names must not be empty")?;

        WorldLayout::resolve(&self.world, kwargs.tensor_parallel_size)?;

        let sim = &self.sim;
        require(sim.vocab_size >= 2, "sim.vocab_size must be at least 2")?;
        require(
            (sim.target_token as usize) < sim.vocab_size,
            "sim.target_token must be inside the vocabulary",
        )?;
        require(sim.prompt_len > 0, "sim.prompt_len must be positive")?;
        require(is_seconds(sim.latency), "sim.latency must be non-negative")?;
        require(
            sim.failure_rate.is_finite() && (0.0..1.0).contains(&sim.failure_rate),
            "sim.failure_rate must be in [0, 1)",
        )?;

        let lanes_in_flight = self.actor.threads_per_llm * self.actor.chunk_size;
        if lanes_in_flight > kwargs.max_num_seqs {
            warn!(
                lanes_in_flight,
                max_num_seqs = kwargs.max_num_seqs,
                "actor lanes can hold more sequences than a shard admits; lanes will queue on capacity"
            );
        }
        Ok(())
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_secs_f64(self.actor.submit_delay)
    }
}

impl InferenceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff)
    }
}

impl SimConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency)
    }
}

/// Non-negative and small enough to become a `Duration`.
fn is_seconds(value: f64) -> bool {
    Duration::try_from_secs_f64(value).is_ok()
}

/// How the world's slots are split between the three stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorldLayout {
    pub actor_slots: usize,
    pub preprocessor_slots: usize,
    pub finetune_slots: usize,
    /// One per inference shard.
    pub actor_workers: usize,
}

impl WorldLayout {
    pub fn resolve(world: &WorldConfig, tensor_parallel_size: usize) -> Result<Self, ConfigError> {
        let parts = world.actor_fraction as usize
            + world.preprocessor_fraction as usize
            + world.finetune_fraction as usize;
        if world.actor_fraction == 0 || world.finetune_fraction == 0 {
            return Err(ConfigError::Invalid(
                "world.actor_fraction and world.finetune_fraction must be positive".to_string(),
            ));
        }
        if world.total_slots < 2 {
            return Err(ConfigError::Invalid("world.total_slots must be at least 2".to_string()));
        }

        let actor_slots = world.total_slots * world.actor_fraction as usize / parts;
        let preprocessor_slots = world.total_slots * world.preprocessor_fraction as usize / parts;
        let finetune_slots = world.total_slots - actor_slots - preprocessor_slots;

        if actor_slots < tensor_parallel_size.max(1) {
            return Err(ConfigError::Invalid(format!(
                "{actor_slots} actor slots cannot host a shard of tensor_parallel_size {tensor_parallel_size}"
            )));
        }
        if finetune_slots == 0 {
            return Err(ConfigError::Invalid("no slots left for finetune".to_string()));
        }

        Ok(Self {
            actor_slots,
            preprocessor_slots,
            finetune_slots,
            actor_workers: actor_slots / tensor_parallel_size.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = Config::from_json(
            r#"{
                "actor": {"chunk_size": 4},
                "finetune": {"weight_update_interval": 144, "max_lag": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(config.actor.chunk_size, 4);
        assert_eq!(config.actor.threads_per_llm, 16);
        assert_eq!(config.finetune.weight_update_interval, 144);
        assert_eq!(config.finetune.max_lag, Some(2));
        assert_eq!(config.finetune.aggregate_loss, LossAggregation::Mean);
    }

    #[test]
    fn test_null_max_lag_is_unbounded() {
        let config = Config::from_json(r#"{"finetune": {"max_lag": null}}"#).unwrap();
        assert_eq!(config.finetune.max_lag, None);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let top = Config::from_json(r#"{"actors": {}}"#);
        assert!(matches!(top, Err(ConfigError::Parse(_))));

        let nested = Config::from_json(r#"{"actor": {"chunk": 3}}"#);
        assert!(matches!(nested, Err(ConfigError::Parse(_))));

        let sampling = Config::from_json(r#"{"llm": {"parameters": {"temp": 0.5}}}"#);
        assert!(matches!(sampling, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_batch = Config::from_json(r#"{"finetune": {"train_batch_size": 0}}"#);
        assert!(matches!(zero_batch, Err(ConfigError::Invalid(_))));

        let negative_delay = Config::from_json(r#"{"actor": {"submit_delay": -1.0}}"#);
        assert!(matches!(negative_delay, Err(ConfigError::Invalid(_))));

        let bad_temp = Config::from_json(r#"{"test_llm": {"parameters": {"temperature": -0.1}}}"#);
        assert!(matches!(bad_temp, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_durations_too_large_for_duration_rejected() {
        for json in [
            r#"{"actor": {"submit_delay": 1e30}}"#,
            r#"{"inference": {"request_timeout": 1e30}}"#,
            r#"{"inference": {"retry_backoff": 1e300}}"#,
            r#"{"sim": {"latency": 1e30}}"#,
        ] {
            assert!(matches!(Config::from_json(json), Err(ConfigError::Invalid(_))), "{json}");
        }

        let config = Config::from_json(r#"{"actor": {"submit_delay": 86400.0}}"#).unwrap();
        assert_eq!(config.submit_delay(), Duration::from_secs(86400));
    }

    #[test]
    fn test_reward_kind_names() {
        let config = Config::from_json(r#"{"reward": "answer_overlap"}"#).unwrap();
        assert_eq!(config.reward, RewardKind::AnswerOverlap);
        assert_eq!(Config::default().reward, RewardKind::ExactMatch);
        assert!(Config::from_json(r#"{"reward": "bleu"}"#).is_err());
    }

    #[test]
    fn test_shed_policy_names() {
        let config = Config::from_json(r#"{"preprocess": {"shed_policy": "drop_newest"}}"#).unwrap();
        assert_eq!(config.preprocess.shed_policy, ShedPolicy::DropNewest);
    }

    #[test]
    fn test_world_layout_split() {
        let layout = WorldLayout::resolve(&WorldConfig::default(), 1).unwrap();
        assert_eq!(layout.actor_slots, 4);
        assert_eq!(layout.preprocessor_slots, 0);
        assert_eq!(layout.finetune_slots, 4);
        assert_eq!(layout.actor_workers, 4);

        let tp2 = WorldLayout::resolve(&WorldConfig::default(), 2).unwrap();
        assert_eq!(tp2.actor_workers, 2);
    }

    #[test]
    fn test_world_layout_rejects_missing_stage() {
        let world = WorldConfig {
            finetune_fraction: 0,
            ..WorldConfig::default()
        };
        assert!(WorldLayout::resolve(&world, 1).is_err());

        let tiny = WorldConfig {
            total_slots: 8,
            actor_fraction: 1,
            preprocessor_fraction: 0,
            finetune_fraction: 7,
        };
        assert!(WorldLayout::resolve(&tiny, 2).is_err());
    }

    #[test]
    fn test_from_file_reports_path() {
        let err = Config::from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
