//! Asynchronous RL fine-tuning orchestration.
//!
//! Actor workers sample completions from inference shards, preprocess turns
//! them into fixed-length training examples, the finetune stage steps a
//! [`finetune::Learner`] and publishes new weight versions that flow back to
//! the actors. An optional evaluator scores pinned versions on test datasets.

pub mod actor;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod finetune;
pub mod inference;
pub mod logging;
pub mod pipeline;
pub mod preprocess;
pub mod rollout;
pub mod runtime;
pub mod sim;
pub mod weights;

pub use config::Config;
pub use error::Error;
pub use pipeline::{Backend, Pipeline, PipelineReport};
