pub mod error;
pub mod group;
pub mod handle;
pub mod scheduler;
pub mod task;

pub use error::Error;
pub use group::TaskGroup;
pub use handle::{LocalTaskHandle, TaskHandle};
pub use scheduler::{LocalScheduler, Scheduler};
pub use task::{Task, TaskWrapper};
