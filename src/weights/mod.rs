//! Weight versions and the channel that distributes them.
//!
//! The finetune stage owns the only [`WeightPublisher`]. Actors and the
//! evaluator hold [`WeightReader`]s and per-consumer [`WeightSubscriber`]s.

mod channel;
mod errors;
mod version;

pub use channel::{WeightPublisher, WeightReader, WeightSubscriber, channel};
pub use errors::WeightError;
pub use version::WeightVersion;
