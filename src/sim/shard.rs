use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::policy::UnigramPolicy;
use crate::inference::{Generation, GenerationRequest, InferenceError, InferenceService, ShardCapacity};
use crate::weights::WeightVersion;

/// In-process inference shard serving a [`UnigramPolicy`].
pub struct SimulatedShard {
    name: String,
    policy: RwLock<UnigramPolicy>,
    rng: Mutex<StdRng>,
    capacity: ShardCapacity,
    latency: Duration,
    failure_rate: f64,
    loaded_version: AtomicU64,
}

impl SimulatedShard {
    pub fn new(name: impl Into<String>, policy: UnigramPolicy, capacity: ShardCapacity, seed: u64) -> Self {
        Self {
            name: name.into(),
            policy: RwLock::new(policy),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            capacity,
            latency: Duration::ZERO,
            failure_rate: 0.0,
            loaded_version: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail this fraction of requests with a transient error.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate;
        self
    }

    pub fn loaded_version(&self) -> u64 {
        self.loaded_version.load(Ordering::Relaxed)
    }

    pub async fn policy(&self) -> UnigramPolicy {
        self.policy.read().await.clone()
    }
}

#[async_trait]
impl InferenceService for SimulatedShard {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, InferenceError> {
        request.sampling.validate()?;
        if request.prompt_tokens.is_empty() {
            return Err(InferenceError::InvalidInput(format!("prompt {} is empty", request.prompt_id)));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let policy = self.policy.read().await;
        let mut rng = self.rng.lock().await;
        if self.failure_rate > 0.0 && rng.r#gen::<f64>() < self.failure_rate {
            return Err(InferenceError::Unavailable(format!("{} dropped the request", self.name)));
        }
        let (tokens, logprobs, stop_reason) = policy.sample(&mut *rng, &request.sampling);
        Ok(Generation {
            tokens,
            logprobs,
            stop_reason,
        })
    }

    async fn load_weights(&self, version: &WeightVersion) -> Result<(), InferenceError> {
        let policy = UnigramPolicy::from_bytes(version.params()).ok_or_else(|| InferenceError::WeightLoad {
            version: version.version(),
            reason: format!("{} bytes are not a logit vector", version.params().len()),
        })?;

        let mut current = self.policy.write().await;
        if policy.vocab_size() != current.vocab_size() {
            return Err(InferenceError::WeightLoad {
                version: version.version(),
                reason: format!(
                    "vocabulary size {} does not match {}",
                    policy.vocab_size(),
                    current.vocab_size()
                ),
            });
        }
        *current = policy;
        self.loaded_version.store(version.version(), Ordering::Relaxed);
        debug!(shard = %self.name, version = version.version(), "loaded weights");
        Ok(())
    }

    fn capacity(&self) -> ShardCapacity {
        self.capacity
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::SamplingParams;

    fn capacity() -> ShardCapacity {
        ShardCapacity {
            max_num_seqs: 8,
            max_num_batched_tokens: 1024,
        }
    }

    fn request(tokens: Vec<u32>) -> GenerationRequest {
        GenerationRequest {
            prompt_id: "p0".to_string(),
            prompt_tokens: tokens,
            sampling: SamplingParams {
                max_tokens: 4,
                ..SamplingParams::default()
            },
        }
    }

    #[tokio::test]
    async fn test_generate_respects_max_tokens() {
        let shard = SimulatedShard::new("sim0", UnigramPolicy::uniform(16), capacity(), 3);
        let generation = shard.generate(request(vec![1, 2])).await.unwrap();
        assert!(!generation.tokens.is_empty() && generation.tokens.len() <= 4);
        assert_eq!(generation.tokens.len(), generation.logprobs.len());
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let shard = SimulatedShard::new("sim0", UnigramPolicy::uniform(16), capacity(), 3);
        let err = shard.generate(request(vec![])).await.unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_load_weights_swaps_policy() {
        let shard = SimulatedShard::new("sim0", UnigramPolicy::uniform(4), capacity(), 3);
        let trained = UnigramPolicy::from_logits(vec![0.0, 0.0, 9.0, 0.0]);
        let version = WeightVersion::new(5, 50, trained.to_bytes().into());

        shard.load_weights(&version).await.unwrap();
        assert_eq!(shard.loaded_version(), 5);
        assert_eq!(shard.policy().await, trained);

        let wrong = WeightVersion::new(6, 60, UnigramPolicy::uniform(8).to_bytes().into());
        assert!(matches!(
            shard.load_weights(&wrong).await,
            Err(InferenceError::WeightLoad { version: 6, .. })
        ));
        assert_eq!(shard.loaded_version(), 5);
    }

    #[tokio::test]
    async fn test_failure_injection_is_transient() {
        let shard = SimulatedShard::new("flaky", UnigramPolicy::uniform(4), capacity(), 11).with_failure_rate(0.999);
        let err = shard.generate(request(vec![1])).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
