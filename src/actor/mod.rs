//! The pool of inference actors that turns prompts into rollouts.

mod chunker;
mod errors;
mod pool;
mod worker;

pub use chunker::{Chunk, FlushReason, PromptFeed};
pub use errors::ActorError;
pub use pool::{ActorPool, ActorSettings, PoolReport};
pub use worker::{ActorStats, ActorStatsSnapshot, ActorWorker};
