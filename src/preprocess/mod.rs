//! Rollout queue and the rollout → training-example transform.

mod errors;
mod queue;
mod stage;
mod transform;

pub use errors::PreprocessError;
pub use queue::{QueueStats, RolloutReceiver, RolloutSender, SendOutcome, rollout_queue};
pub use stage::{PreprocessReport, PreprocessStage, PreprocessStats, group_advantages};
pub use transform::{RejectReason, TrainingExample, Transform};
