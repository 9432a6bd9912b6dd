#![warn(missing_docs)]
//! Asynchronous USB transfers.
//!
//! `usb-async` wraps the native transfer primitives of an opened device
//! ([`native::Backend`]) in a [`Transfer`] type per transfer shape: control,
//! bulk, interrupt, isochronous and bulk stream, each IN or OUT. A transfer is
//! submitted once with [`async_read_some`][Transfer::async_read_some],
//! [`async_write_some`][Transfer::async_write_some] or
//! [`async_control`][Transfer::async_control], and reports a [`Completion`]
//! holding the status, the result and the buffer it was given.
//!
//! ## Completions
//!
//! The native layer reports completion on a thread of its own. The completion
//! handler never runs there: it is posted to the [`Executor`] the transfer was
//! created with, exactly once per submission, even if the native layer
//! rejected the submission. Until then, a [`WorkGuard`] keeps the executor
//! from running out of work.
//!
//! The handler is chosen by a [`CompletionToken`]: a closure taking the
//! [`Completion`], or [`UseFuture`] to get a [`TransferFuture`] instead.
//!
//! [`ExecutionContext`] is a run queue driven by threads that call
//! [`ExecutionContext::run`]. With the `tokio` feature, a
//! `tokio::runtime::Handle` is also an executor.
//!
//! ## Cancellation
//!
//! [`Transfer::cancel`] requests cancellation. The transfer still completes
//! through its handler, usually with [`TransferError::Cancelled`]. Dropping a
//! submitted transfer cancels it, and the completion is still posted.
//!
//! ## Platforms
//!
//! [`platform::LinuxDevice`] implements [`native::Backend`] on Linux usbfs.
//!
//! ## Logging
//!
//! `usb-async` uses the [`log`](https://docs.rs/log) crate. Errors from the
//! native layer are logged at `error` or `debug` level, and transfer
//! submission and completion at `debug` level.

mod error;
pub use error::{Error, ErrorKind, TransferError};

mod executor;
#[cfg(feature = "smol")]
pub use executor::BlockingExecutor;
pub use executor::{ContextExecutor, ExecutionContext, Executor, WorkGuard};

pub mod native;

pub mod platform;

pub mod transfer;
pub use transfer::{
    BulkIn, BulkOut, BulkStreamIn, BulkStreamOut, Completion, CompletionToken, ControlIn,
    ControlOut, InterruptIn, InterruptOut, IsoIn, IsoOut, Transfer, TransferFuture, UseFuture,
};

mod maybe_future;
pub use maybe_future::MaybeFuture;
