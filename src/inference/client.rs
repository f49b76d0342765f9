use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::warn;

use super::errors::InferenceError;
use super::traits::InferenceService;
use super::types::{Generation, GenerationRequest, ShardCapacity};
use crate::config::InferenceConfig;
use crate::weights::WeightVersion;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Wraps one shard with timeouts and bounded retries.
#[derive(Clone)]
pub struct RetryingClient {
    service: Arc<dyn InferenceService>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(service: Arc<dyn InferenceService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    pub fn capacity(&self) -> ShardCapacity {
        self.service.capacity()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Generate one completion, retrying transient failures with the same prompt.
    ///
    /// Returns the last error once `max_retries` is exhausted or the error is not
    /// retryable.
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation, InferenceError> {
        let prompt_id = request.prompt_id.clone();
        self.with_retries("generate", &prompt_id, || {
            let service = Arc::clone(&self.service);
            let request = request.clone();
            async move { service.generate(request).await }
        })
        .await
    }

    /// Generate completions for many requests, keeping at most `concurrency`
    /// in flight. Results come back in request order.
    pub async fn generate_all(
        &self,
        requests: Vec<GenerationRequest>,
        concurrency: usize,
    ) -> Vec<Result<Generation, InferenceError>> {
        futures::stream::iter(requests)
            .map(|request| self.generate(request))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    pub async fn load_weights(&self, version: &WeightVersion) -> Result<(), InferenceError> {
        let label = version.version().to_string();
        self.with_retries("load_weights", &label, || {
            let service = Arc::clone(&self.service);
            let version = version.clone();
            async move { service.load_weights(&version).await }
        })
        .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        subject: &str,
        mut call: F,
    ) -> Result<T, InferenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.policy.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(InferenceError::Timeout(self.policy.timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff_for(attempt);
                    warn!(
                        shard = self.service.name(),
                        operation,
                        subject,
                        attempt,
                        ?delay,
                        error = %e,
                        "inference call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
