use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use log::{debug, error};

use crate::{
    executor::{Executor, WorkGuard},
    native::{Backend, RawTransfer},
    Error, ErrorKind, TransferError,
};

use super::{TransferKind, TransferState};

/// Continuation stored for the duration of one submission.
pub(crate) type Handler<R> = Box<dyn FnOnce(Result<(), TransferError>, R) + Send>;

/// State shared between the `TransferHandle` and the native completion callback.
pub(crate) struct CompletionContext<K: TransferKind, E: Executor> {
    /// Where the continuation runs.
    executor: E,

    /// Held from submission until the continuation is posted.
    work_guard: Option<WorkGuard<E>>,

    /// Pre-sized storage the result is built in.
    storage: K::Storage,

    handler: Option<Handler<K::Output>>,
}

impl<K: TransferKind, E: Executor> CompletionContext<K, E> {
    /// Post the stored continuation with the outcome, then release the guard.
    fn complete(&mut self, status: Result<(), TransferError>, result: K::Output) {
        match self.handler.take() {
            Some(handler) => self.executor.post(move || handler(status, result)),
            None => error!("Transfer completed with no continuation"),
        }
        self.work_guard = None;
    }
}

struct TransferInner<K: TransferKind, B: Backend, E: Executor> {
    /// Native transfer, owned.
    raw: NonNull<RawTransfer>,

    /// One of the `STATE_*` constants below, used to synchronize
    /// the state.
    state: AtomicU8,

    /// In an `UnsafeCell` because we provide `&mut` when the
    /// state guarantees us exclusive access
    context: UnsafeCell<CompletionContext<K, E>>,

    backend: Arc<B>,
}

impl<K: TransferKind, B: Backend, E: Executor> Drop for TransferInner<K, B, E> {
    fn drop(&mut self) {
        // SAFETY: only dropped when the transfer is not in flight
        unsafe { self.backend.free_transfer(self.raw) }
    }
}

/// The transfer has not been submitted. The native fields may be written.
const STATE_IDLE: u8 = 0;

/// The transfer has been or is about to be submitted to the native layer and
/// the completion callback has not yet run. The callback owns the
/// `CompletionContext`.
const STATE_PENDING: u8 = 1;

/// Like PENDING, but the `TransferHandle` was dropped. The completion
/// callback will drop the `TransferInner`.
const STATE_ABANDONED: u8 = 2;

/// The continuation has been posted or the submission failed. The transfer
/// cannot be submitted again.
const STATE_COMPLETED: u8 = 3;

/// Exclusive owner of a native transfer and its `CompletionContext`.
///
/// Both live in one heap allocation whose address is lent to the native
/// layer as the transfer's `user_data` while a submission is pending.
pub(crate) struct TransferHandle<K: TransferKind, B: Backend, E: Executor> {
    ptr: NonNull<TransferInner<K, B, E>>,
}

unsafe impl<K: TransferKind, B: Backend, E: Executor> Send for TransferHandle<K, B, E> {}
unsafe impl<K: TransferKind, B: Backend, E: Executor> Sync for TransferHandle<K, B, E> {}

impl<K: TransferKind, B: Backend, E: Executor> TransferHandle<K, B, E> {
    /// Allocate a native transfer and fill it with `fill`.
    ///
    /// `fill` receives the completion callback and user data to store in the
    /// transfer.
    pub(crate) fn new(
        executor: E,
        backend: &Arc<B>,
        iso_packets: usize,
        storage: K::Storage,
        fill: impl FnOnce(&mut RawTransfer, unsafe fn(*mut RawTransfer), *mut c_void),
    ) -> Result<Self, Error> {
        let raw = backend.alloc_transfer(iso_packets).ok_or_else(|| {
            Error::new(ErrorKind::OutOfMemory, "failed to allocate transfer").log_error()
        })?;

        let inner = Box::new(TransferInner {
            raw,
            state: AtomicU8::new(STATE_IDLE),
            context: UnsafeCell::new(CompletionContext {
                executor,
                work_guard: None,
                storage,
                handler: None,
            }),
            backend: backend.clone(),
        });
        let ptr = NonNull::from(Box::leak(inner));

        // SAFETY: freshly allocated, nothing else references it
        unsafe {
            fill(
                &mut *raw.as_ptr(),
                completion_callback::<K, B, E>,
                ptr.as_ptr().cast(),
            );
        }

        Ok(TransferHandle { ptr })
    }

    fn inner(&self) -> &TransferInner<K, B, E> {
        // SAFETY: while `TransferHandle` is alive, its `TransferInner` is alive
        // (it may be shared by the completion callback, so can't be &mut)
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn state(&self) -> TransferState {
        match self.inner().state.load(Ordering::Acquire) {
            STATE_IDLE => TransferState::Idle,
            STATE_PENDING => TransferState::Submitted,
            _ => TransferState::Completed,
        }
    }

    /// Submit the transfer. `prepare` sets the buffer fields of the native
    /// transfer before submission.
    ///
    /// If the native layer rejects the submission, the handler is posted
    /// with the error and a default result.
    ///
    /// ### Panics
    /// * If the transfer is not idle.
    pub(crate) fn submit(
        &mut self,
        prepare: impl FnOnce(&mut RawTransfer),
        handler: Handler<K::Output>,
    ) {
        let inner = self.inner();
        assert_eq!(
            inner.state.load(Ordering::Acquire),
            STATE_IDLE,
            "Transfer should be idle when submitted"
        );

        // SAFETY: idle, so neither the native layer nor the callback
        // reference the transfer or context.
        unsafe {
            prepare(&mut *inner.raw.as_ptr());
            let context = &mut *inner.context.get();
            context.handler = Some(handler);
            context.work_guard = Some(WorkGuard::new(context.executor.clone()));
        }

        // The callback may run before `submit_transfer` returns.
        inner.state.store(STATE_PENDING, Ordering::Release);

        // SAFETY: the transfer is owned and idle, and the buffer set by `prepare`
        // is owned by the handler, which lives until the callback runs.
        match unsafe { inner.backend.submit_transfer(inner.raw) } {
            Ok(()) => {
                debug!("Submitted transfer {:?}", inner.raw);
            }
            Err(e) => {
                debug!("Failed to submit transfer {:?}: {e}", inner.raw);

                // SAFETY: no callback will run for a failed submission, so
                // the context is still exclusively ours.
                unsafe {
                    (*inner.context.get()).complete(Err(e.into()), K::Output::default());
                }
                inner.state.store(STATE_COMPLETED, Ordering::Release);
            }
        }
    }

    /// Request cancellation of the in-flight submission.
    pub(crate) fn cancel(&self) -> Result<(), Error> {
        let inner = self.inner();
        // SAFETY: `raw` stays allocated while the handle is alive
        unsafe { inner.backend.cancel_transfer(inner.raw) }.map_err(|e| e.log_debug())
    }
}

impl<K: TransferKind, B: Backend, E: Executor> Drop for TransferHandle<K, B, E> {
    fn drop(&mut self) {
        // Cancel before giving up ownership, as the callback frees the transfer
        // once it sees `STATE_ABANDONED`.
        if self.inner().state.load(Ordering::Acquire) == STATE_PENDING {
            self.cancel().ok();
        }

        match self.inner().state.swap(STATE_ABANDONED, Ordering::AcqRel) {
            STATE_PENDING => {
                debug!("Transfer dropped while pending; completion will free it");
                /* callback responsible for dropping */
            }
            STATE_IDLE | STATE_COMPLETED => {
                // SAFETY: state means there is no concurrent access
                unsafe { drop(Box::from_raw(self.ptr.as_ptr())) }
            }
            s => panic!("Dropping transfer in unexpected state {s}"),
        }
    }
}

/// Native completion callback.
///
/// Classifies the result and posts the continuation to the executor. It never
/// runs the continuation itself, as this may be called on a thread owned by
/// the native layer.
///
/// SAFETY: `transfer` was submitted by `TransferHandle::submit` and its
/// `user_data` is the `TransferInner` that owns it.
unsafe fn completion_callback<K: TransferKind, B: Backend, E: Executor>(
    transfer: *mut RawTransfer,
) {
    unsafe {
        let inner = (*transfer).user_data as *mut TransferInner<K, B, E>;
        let raw = &*transfer;

        debug!(
            "Transfer {:?} on ep {:02x} completed: {:?}, {} bytes",
            transfer, raw.endpoint, raw.status, raw.actual_length
        );

        // SAFETY: the state is PENDING or ABANDONED, so only this callback
        // accesses the context.
        let context = &mut *(*inner).context.get();
        let result = K::collect(raw, &mut context.storage);
        context.complete(raw.status.into_result(), result);

        match (*inner).state.swap(STATE_COMPLETED, Ordering::AcqRel) {
            STATE_PENDING => {}
            STATE_ABANDONED => drop(Box::from_raw(inner)),
            s => panic!("Completing transfer in unexpected state {s}"),
        }
    }
}
