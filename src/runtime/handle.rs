use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::runtime::error::Error;

/// Awaitable result of a submitted task.
///
/// Dropping the handle detaches the task; it keeps running.
pub struct TaskHandle<T: Send + 'static> {
    id: Uuid,
    result: oneshot::Receiver<Result<T, Error>>,
    abort: AbortHandle,
}

pub type LocalTaskHandle<T> = TaskHandle<T>;

impl<T: Send + 'static> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.abort.is_finished())
            .field("output", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new(id: Uuid, result: oneshot::Receiver<Result<T, Error>>, abort: AbortHandle) -> Self {
        Self { id, result, abort }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    /// Abort the task. Awaiting the handle afterwards yields `Error::Canceled`
    /// unless the task already finished.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

impl<T: Send + 'static> Future for TaskHandle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the task never reported back.
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Canceled)))
    }
}
