mod client;
mod errors;
mod traits;
mod types;

pub use client::{RetryPolicy, RetryingClient};
pub use errors::InferenceError;
pub use traits::InferenceService;
pub use types::{Generation, GenerationRequest, SamplingParams, ShardCapacity, StopReason};
