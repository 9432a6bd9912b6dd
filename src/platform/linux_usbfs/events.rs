/// Epoll based event loop for Linux.
///
/// Launches a thread when opening the first device that polls for events on
/// usbfs devices, reaps completed URBs and calls their completion callbacks.
/// The same thread enforces transfer timeouts by discarding URBs whose
/// deadline passed.
use once_cell::sync::OnceCell;
use rustix::{
    buffer::spare_capacity,
    event::{
        epoll::{self, EventData, EventFlags},
        eventfd, EventfdFlags,
    },
    fd::{BorrowedFd, OwnedFd},
    io::retry_on_intr,
    time::Timespec,
};
use slab::Slab;
use std::{
    sync::{Mutex, Weak},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::Error;

use super::{errno_to_error, usbfs::Urb, LinuxDevice};

struct EventLoop {
    epoll: OwnedFd,

    /// Written to when a deadline is added, to recompute the wait timeout.
    wake: OwnedFd,
}

static EVENT_LOOP: OnceCell<EventLoop> = OnceCell::new();
static DEVICES: Mutex<Slab<Weak<LinuxDevice>>> = Mutex::new(Slab::new());
static DEADLINES: Mutex<Slab<Deadline>> = Mutex::new(Slab::new());

/// Epoll key of the wake eventfd; device keys are slab indexes.
const WAKE_KEY: u64 = u64::MAX;

struct Deadline {
    at: Instant,
    device: Weak<LinuxDevice>,
    urb: *mut Urb,

    /// The URB was discarded because the deadline passed.
    expired: bool,
}

// The URB pointer is only dereferenced by the kernel, on the event thread.
unsafe impl Send for Deadline {}

fn event_loop_fd() -> Result<&'static EventLoop, Error> {
    let mut start_thread = false;
    let lp = EVENT_LOOP.get_or_try_init(|| {
        let epoll = epoll::create(epoll::CreateFlags::CLOEXEC)
            .map_err(|e| errno_to_error(e, "failed to create epoll instance"))?;
        let wake = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
            .map_err(|e| errno_to_error(e, "failed to create eventfd"))?;
        epoll::add(&epoll, &wake, EventData::new_u64(WAKE_KEY), EventFlags::IN)
            .map_err(|e| errno_to_error(e, "failed to watch eventfd"))?;
        start_thread = true;
        Ok::<_, Error>(EventLoop { epoll, wake })
    })?;

    if start_thread {
        thread::Builder::new()
            .name("usb-async events".into())
            .spawn(event_loop)
            .map_err(|_| Error::new(crate::ErrorKind::Other, "failed to spawn event thread"))?;
    }

    Ok(lp)
}

pub(super) fn register(fd: BorrowedFd, device: Weak<LinuxDevice>) -> Result<usize, Error> {
    let event_loop = event_loop_fd()?;
    let id = DEVICES.lock().unwrap().insert(device);

    let data = EventData::new_u64(id as u64);
    if let Err(e) = epoll::add(&event_loop.epoll, fd, data, EventFlags::OUT) {
        DEVICES.lock().unwrap().remove(id);
        return Err(errno_to_error(e, "failed to watch device"));
    }
    Ok(id)
}

/// Stop watching `fd` but keep its key reserved.
pub(super) fn unregister_fd(fd: BorrowedFd) {
    if let Some(event_loop) = EVENT_LOOP.get() {
        epoll::delete(&event_loop.epoll, fd).ok();
    }
}

pub(super) fn unregister(fd: BorrowedFd, events_id: usize) {
    unregister_fd(fd);
    DEVICES.lock().unwrap().try_remove(events_id);
}

/// The device registered under `events_id`, or a dangling reference if it
/// was unregistered.
pub(super) fn device_weak(events_id: usize) -> Weak<LinuxDevice> {
    DEVICES
        .lock()
        .unwrap()
        .get(events_id)
        .cloned()
        .unwrap_or_default()
}

/// Arrange for `urb` to be discarded if it is still in flight at `at`.
pub(super) fn add_deadline(at: Instant, device: Weak<LinuxDevice>, urb: *mut Urb) -> usize {
    let key = DEADLINES.lock().unwrap().insert(Deadline {
        at,
        device,
        urb,
        expired: false,
    });
    if let Some(event_loop) = EVENT_LOOP.get() {
        rustix::io::write(&event_loop.wake, &1u64.to_ne_bytes()).ok();
    }
    key
}

/// Remove a deadline, returning whether it expired.
pub(super) fn remove_deadline(key: usize) -> bool {
    DEADLINES
        .lock()
        .unwrap()
        .try_remove(key)
        .is_some_and(|d| d.expired)
}

/// Time until the nearest pending deadline.
fn next_timeout(now: Instant) -> Option<Duration> {
    DEADLINES
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, d)| !d.expired)
        .map(|(_, d)| d.at.saturating_duration_since(now))
        .min()
}

/// Discard the URBs whose deadline passed at `now`.
pub(super) fn expire_deadlines(now: Instant) {
    let expired: Vec<_> = DEADLINES
        .lock()
        .unwrap()
        .iter_mut()
        .filter(|(_, d)| !d.expired && d.at <= now)
        .map(|(_, d)| {
            d.expired = true;
            (d.device.clone(), d.urb)
        })
        .collect();

    for (device, urb) in expired {
        let Some(device) = device.upgrade() else {
            continue;
        };
        debug!("URB {urb:?} timed out, discarding");
        // Completion is reaped on this thread, so the URB is still allocated.
        if let Err(e) = unsafe { device.discard_urb(urb) } {
            // Completed but not yet reaped
            debug!("Discarding timed out URB {urb:?} failed: {e}");
        }
    }
}

fn event_loop() {
    let Some(event_loop) = EVENT_LOOP.get() else {
        return;
    };
    let mut events = Vec::with_capacity(8);
    loop {
        let timeout = next_timeout(Instant::now()).map(|d| Timespec {
            tv_sec: d.as_secs().try_into().unwrap_or(i64::MAX),
            tv_nsec: d.subsec_nanos() as _,
        });

        events.clear();
        if let Err(e) = retry_on_intr(|| {
            epoll::wait(
                &event_loop.epoll,
                spare_capacity(&mut events),
                timeout.as_ref(),
            )
        }) {
            error!("epoll_wait failed: {e}");
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        for event in events.drain(..) {
            let key = event.data.u64();
            if key == WAKE_KEY {
                let mut buf = [0u8; 8];
                rustix::io::read(&event_loop.wake, &mut buf[..]).ok();
                continue;
            }

            let device = DEVICES
                .lock()
                .unwrap()
                .get(key as usize)
                .and_then(Weak::upgrade);
            match device {
                // `device` gets dropped here. If it was the last reference,
                // the LinuxDevice will unregister its fd, so DEVICES must not
                // be locked.
                Some(device) => device.handle_events(),
                None => warn!("Event for unknown device {key}"),
            }
        }

        expire_deadlines(Instant::now());
    }
}
