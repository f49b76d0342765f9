use futures::StreamExt;
use futures::stream::FuturesUnordered;

use crate::runtime::error::Error;
use crate::runtime::handle::LocalTaskHandle;

/// Set of task handles polled in completion order.
///
/// Tasks still running when the group drops are aborted.
pub struct TaskGroup<T: Send + 'static> {
    running: FuturesUnordered<LocalTaskHandle<T>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self {
            running: FuturesUnordered::new(),
        }
    }

    pub fn push(&mut self, handle: LocalTaskHandle<T>) {
        self.running.push(handle);
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Next task to finish, or `None` once the group is empty.
    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        self.running.next().await
    }

    pub fn abort_all(&self) {
        for handle in self.running.iter() {
            handle.abort();
        }
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> FromIterator<LocalTaskHandle<T>> for TaskGroup<T> {
    fn from_iter<I: IntoIterator<Item = LocalTaskHandle<T>>>(iter: I) -> Self {
        Self {
            running: iter.into_iter().collect(),
        }
    }
}

impl<T: Send + 'static> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        self.abort_all();
    }
}
