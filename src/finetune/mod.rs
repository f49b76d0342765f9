//! The finetune stage: fixed-size batches, accumulated optimizer steps and
//! weight publication.

mod errors;
mod learner;
mod objective;
mod schedule;
mod stage;

pub use errors::{FinetuneError, LearnerError};
pub use learner::{Batch, Learner, PassMetrics, StepParams};
pub use objective::{ExampleLoss, Objective};
pub use schedule::{LrScheduler, lr_multiplier};
pub use stage::{FinetuneReport, FinetuneStage, FinetuneState, FinetuneStats, should_evaluate};
