//! Periodic evaluation of pinned weight versions.

mod errors;
mod log;
mod runner;
mod trigger;

pub use errors::EvalError;
pub use log::{EvalLog, EvalResult};
pub use runner::Evaluator;
pub use trigger::{EvalRequest, EvalTrigger, eval_queue};
