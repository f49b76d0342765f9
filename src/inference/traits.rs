use async_trait::async_trait;

use super::errors::InferenceError;
use super::types::{Generation, GenerationRequest, ShardCapacity};
use crate::weights::WeightVersion;

/// One inference shard. Stateless apart from the weights it has loaded.
#[async_trait]
pub trait InferenceService: Send + Sync + 'static {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, InferenceError>;

    /// Replace the served parameters. Callers guarantee no request is in flight.
    async fn load_weights(&self, version: &WeightVersion) -> Result<(), InferenceError>;

    fn capacity(&self) -> ShardCapacity;

    fn name(&self) -> &str;
}
