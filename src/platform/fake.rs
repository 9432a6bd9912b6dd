//! In-memory backend driving transfers by hand in tests.

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use crate::{
    native::{Backend, RawTransfer, TransferStatus},
    Error, ErrorKind,
};

struct InFlight {
    transfer: NonNull<RawTransfer>,
    cancelled: bool,
}

unsafe impl Send for InFlight {}

/// Backend whose transfers complete only when a test says so.
#[derive(Default)]
pub(crate) struct FakeBackend {
    in_flight: Mutex<Vec<InFlight>>,
    fail_submit: Mutex<Option<Error>>,
    pub(crate) fail_alloc: AtomicBool,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl FakeBackend {
    /// Reject the next submission with `err`.
    pub(crate) fn fail_next_submit(&self, err: Error) {
        *self.fail_submit.lock().unwrap() = Some(err);
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub(crate) fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Whether the oldest in-flight transfer had cancellation requested.
    pub(crate) fn next_cancelled(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap()
            .first()
            .is_some_and(|t| t.cancelled)
    }

    /// Inspect the oldest in-flight transfer.
    pub(crate) fn inspect_next<R>(&self, f: impl FnOnce(&RawTransfer) -> R) -> R {
        let in_flight = self.in_flight.lock().unwrap();
        let t = in_flight.first().expect("no transfer in flight");
        f(unsafe { t.transfer.as_ref() })
    }

    /// Remove the oldest in-flight transfer, let `f` write its outcome, and
    /// call its completion callback on the current thread.
    pub(crate) fn complete_next_with(&self, f: impl FnOnce(&mut RawTransfer)) {
        let t = self.in_flight.lock().unwrap().remove(0);
        unsafe {
            let raw = &mut *t.transfer.as_ptr();
            f(raw);
            let callback = raw.callback.expect("transfer has no callback");
            callback(t.transfer.as_ptr());
        }
    }

    /// Complete the oldest in-flight transfer with `status` and
    /// `actual_length` bytes. A transfer with cancellation requested
    /// completes as cancelled.
    pub(crate) fn complete_next(&self, status: TransferStatus, actual_length: usize) {
        let cancelled = self.next_cancelled();
        self.complete_next_with(|raw| {
            raw.status = if cancelled {
                TransferStatus::Cancelled
            } else {
                status
            };
            raw.actual_length = actual_length;
        });
    }
}

unsafe impl Backend for FakeBackend {
    fn alloc_transfer(&self, iso_packets: usize) -> Option<NonNull<RawTransfer>> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return None;
        }
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Some(NonNull::from(Box::leak(Box::new(RawTransfer::new(
            iso_packets,
        )))))
    }

    unsafe fn free_transfer(&self, transfer: NonNull<RawTransfer>) {
        assert!(
            !self
                .in_flight
                .lock()
                .unwrap()
                .iter()
                .any(|t| t.transfer == transfer),
            "freed a transfer in flight"
        );
        self.freed.fetch_add(1, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(transfer.as_ptr()) });
    }

    unsafe fn submit_transfer(&self, transfer: NonNull<RawTransfer>) -> Result<(), Error> {
        if let Some(err) = self.fail_submit.lock().unwrap().take() {
            return Err(err);
        }
        self.in_flight.lock().unwrap().push(InFlight {
            transfer,
            cancelled: false,
        });
        Ok(())
    }

    unsafe fn cancel_transfer(&self, transfer: NonNull<RawTransfer>) -> Result<(), Error> {
        let mut in_flight = self.in_flight.lock().unwrap();
        match in_flight.iter_mut().find(|t| t.transfer == transfer) {
            Some(t) => {
                t.cancelled = true;
                Ok(())
            }
            None => Err(Error::new(ErrorKind::NotFound, "transfer not in flight")),
        }
    }
}
