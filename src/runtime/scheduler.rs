use std::future::Future;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{Instrument, debug_span};
use uuid::Uuid;

use crate::runtime::error::Error;
use crate::runtime::handle::TaskHandle;
use crate::runtime::task::Task;

pub trait Scheduler: Send + Sync {
    type Handle<T>: Future<Output = Result<T, Error>> + Send
    where
        T: Send + 'static;

    fn submit<T>(&self, task: T) -> Self::Handle<T::Output>
    where
        T: Task + 'static;
}

/// Runs every task on the ambient tokio runtime.
#[derive(Debug, Clone)]
pub struct LocalScheduler {
    name: &'static str,
}

impl LocalScheduler {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new("local")
    }
}

impl Scheduler for LocalScheduler {
    type Handle<T>
        = TaskHandle<T>
    where
        T: Send + 'static;

    fn submit<T>(&self, task: T) -> Self::Handle<T::Output>
    where
        T: Task + 'static,
    {
        let task_id = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        let span = debug_span!("task", scheduler = self.name, %task_id);

        let join = tokio::spawn(
            async move {
                let result = std::panic::AssertUnwindSafe(task.call())
                    .catch_unwind()
                    .await
                    .map_err(|panic| Error::Panicked(panic_message(panic.as_ref())));
                let _ = sender.send(result);
            }
            .instrument(span),
        );

        TaskHandle::new(task_id, receiver, join.abort_handle())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
