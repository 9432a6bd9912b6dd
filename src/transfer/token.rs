use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Wake, Waker},
    thread::{self, Thread},
};

use atomic_waker::AtomicWaker;
use futures_core::FusedFuture;

use crate::MaybeFuture;

/// Selects how the completion of a transfer is delivered.
///
/// * Any `FnOnce(T) + Send + 'static` closure is called with the completion,
///   and the submit method returns `()`.
/// * [`UseFuture`] makes the submit method return a [`TransferFuture`].
///
/// Either way, the completion is delivered by work posted to the transfer's
/// executor.
pub trait CompletionToken<T>: Sized {
    /// Returned by the submit method.
    type Output;

    /// Receives the completion.
    type Handler: FnOnce(T) + Send + 'static;

    /// Split into the handler and the value returned to the caller.
    fn into_handler(self) -> (Self::Handler, Self::Output);
}

impl<T, F> CompletionToken<T> for F
where
    F: FnOnce(T) + Send + 'static,
{
    type Output = ();
    type Handler = F;

    fn into_handler(self) -> (F, ()) {
        (self, ())
    }
}

/// Completion token that returns a [`TransferFuture`].
///
/// ```no_run
/// use usb_async::{native::Backend, BulkIn, Executor, UseFuture};
///
/// async fn read<B: Backend, E: Executor>(transfer: &mut BulkIn<B, E>) {
///     let completion = transfer.async_read_some(vec![0; 512], UseFuture).await;
///     println!("{:?}: {} bytes", completion.status, completion.result);
/// }
/// ```
#[derive(Debug, Copy, Clone, Default)]
pub struct UseFuture;

impl<T: Send + 'static> CompletionToken<T> for UseFuture {
    type Output = TransferFuture<T>;
    type Handler = Box<dyn FnOnce(T) + Send>;

    fn into_handler(self) -> (Self::Handler, TransferFuture<T>) {
        let shared = Arc::new(Shared {
            value: Mutex::new(None),
            waker: AtomicWaker::new(),
        });
        let handler: Box<dyn FnOnce(T) + Send> = {
            let shared = shared.clone();
            Box::new(move |value: T| {
                *shared.value.lock().unwrap() = Some(value);
                shared.waker.wake();
            })
        };
        (handler, TransferFuture { shared, done: false })
    }
}

struct Shared<T> {
    value: Mutex<Option<T>>,
    waker: AtomicWaker,
}

/// [`Future`] resolving to a transfer's completion.
///
/// The future resolves when the completion handler runs on the transfer's
/// executor, so the executor must be running for it to make progress.
/// Dropping the future does not cancel the transfer.
pub struct TransferFuture<T> {
    shared: Arc<Shared<T>>,
    done: bool,
}

impl<T> TransferFuture<T> {
    fn take(&mut self) -> Option<T> {
        let value = self.shared.value.lock().unwrap().take();
        self.done |= value.is_some();
        value
    }
}

impl<T> Future for TransferFuture<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        assert!(!self.done, "TransferFuture polled after completion");
        self.shared.waker.register(cx.waker());
        self.take().map_or(Poll::Pending, Poll::Ready)
    }
}

impl<T> FusedFuture for TransferFuture<T> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

impl<T: Send> MaybeFuture for TransferFuture<T> {
    fn wait(mut self) -> T {
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        self.shared.waker.register(&waker);
        loop {
            if let Some(value) = self.take() {
                return value;
            }
            thread::park();
        }
    }
}
