//! Execution contexts that run transfer completions.
//!
//! Completions are never run on the thread that the native layer calls back
//! on. They are posted to the [`Executor`] the transfer was created with.

mod context;
pub use context::{ContextExecutor, ExecutionContext};

/// Somewhere to run completion handlers.
///
/// Work posted to an executor must not run inline in `post`. Executors that
/// track outstanding work (like [`ExecutionContext`]) use
/// `on_work_started` / `on_work_finished` to stay alive while a transfer is
/// in flight; see [`WorkGuard`].
pub trait Executor: Clone + Send + Sync + 'static {
    /// Queue `work` for later execution on this executor.
    fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static;

    /// Count a unit of outstanding work.
    fn on_work_started(&self) {}

    /// Release a unit of outstanding work counted by `on_work_started`.
    fn on_work_finished(&self) {}
}

/// Keeps an executor from running out of work.
///
/// While a guard exists, the executor considers work to be outstanding, so
/// e.g. [`ExecutionContext::run`] keeps waiting for posted work instead of
/// returning. Dropping the guard releases it.
#[must_use]
pub struct WorkGuard<E: Executor> {
    executor: E,
}

impl<E: Executor> WorkGuard<E> {
    /// Count outstanding work on `executor` until the guard is dropped.
    pub fn new(executor: E) -> WorkGuard<E> {
        executor.on_work_started();
        WorkGuard { executor }
    }

    /// The guarded executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Release the guard. Same as dropping it.
    pub fn reset(self) {}
}

impl<E: Executor> Drop for WorkGuard<E> {
    fn drop(&mut self) {
        self.executor.on_work_finished();
    }
}

/// Completion handlers are spawned as tasks on the runtime.
///
/// A Tokio runtime does not shut down for lack of work, so work guards are
/// not tracked.
#[cfg(feature = "tokio")]
impl Executor for tokio::runtime::Handle {
    fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.spawn(async move { work() }));
    }
}

#[cfg(feature = "smol")]
pub use self::blocking_pool::BlockingExecutor;

#[cfg(feature = "smol")]
mod blocking_pool {
    use super::Executor;

    /// Runs completion handlers on the `blocking` crate's thread pool.
    ///
    /// Handlers may run concurrently with each other.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct BlockingExecutor;

    impl Executor for BlockingExecutor {
        fn post<F>(&self, work: F)
        where
            F: FnOnce() + Send + 'static,
        {
            blocking::unblock(work).detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_keeps_context_busy() {
        let ctx = ExecutionContext::new();
        let guard = WorkGuard::new(ctx.executor());
        assert_eq!(ctx.outstanding_work(), 1);
        drop(guard);
        assert_eq!(ctx.outstanding_work(), 0);

        let guard = WorkGuard::new(ctx.executor());
        guard.reset();
        assert_eq!(ctx.outstanding_work(), 0);
    }
}
