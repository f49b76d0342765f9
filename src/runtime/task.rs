use std::future::Future;

/// A unit of work the scheduler can run to completion.
pub trait Task: Send {
    type Output: Send + 'static;
    type Future: Future<Output = Self::Output> + Send + 'static;

    fn call(self) -> Self::Future;
}

// What `ferrite_task!` builds around a closure
pub struct TaskWrapper<F, Fut>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    func: F,
}

impl<F, Fut> TaskWrapper<F, Fut>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> Task for TaskWrapper<F, Fut>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    type Output = Fut::Output;
    type Future = Fut;

    fn call(self) -> Self::Future {
        (self.func)()
    }
}

#[macro_export]
macro_rules! ferrite_task {
    ($func:expr) => {{ $crate::runtime::task::TaskWrapper::new($func) }};
}
