use std::future::IntoFuture;

/// IO that may be performed synchronously or asynchronously.
///
/// A `MaybeFuture` can be run asynchronously with `.await`, or
/// run synchronously (blocking the current thread) with `.wait()`.
///
/// Blocking only makes progress if the work it waits for runs on another
/// thread, e.g. an [`ExecutionContext`][crate::ExecutionContext] run by a
/// dedicated thread.
pub trait MaybeFuture: IntoFuture {
    /// Block waiting for the action to complete
    fn wait(self) -> Self::Output;
}
