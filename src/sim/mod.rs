//! A self-contained backend: a unigram softmax policy served by simulated
//! shards and trained by a REINFORCE learner. Drives the binary and the
//! end-to-end tests.

mod learner;
mod policy;
mod shard;
mod tasks;

pub use learner::UnigramLearner;
pub use policy::UnigramPolicy;
pub use shard::SimulatedShard;
pub use tasks::{backend, datasets, synthetic_dataset};
