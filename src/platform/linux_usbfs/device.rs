use std::{
    alloc::{self, Layout},
    ffi::c_int,
    path::PathBuf,
    ptr::{self, NonNull},
    slice,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error};
use rustix::{
    fd::{AsFd, OwnedFd},
    fs::{Mode, OFlags},
    io::Errno,
};

use super::{
    errno_to_error, events,
    usbfs::{
        self, IsoPacketDesc, Urb, USBDEVFS_URB_ISO_ASAP, USBDEVFS_URB_TYPE_BULK,
        USBDEVFS_URB_TYPE_CONTROL, USBDEVFS_URB_TYPE_INTERRUPT, USBDEVFS_URB_TYPE_ISO,
    },
};
use crate::{
    native::{Backend, RawTransfer, TransferStatus, TransferType},
    Error, ErrorKind,
};

/// An opened usbfs device node.
///
/// Transfers are submitted as URBs on the device's file descriptor and reaped
/// by a shared event thread, which calls their completion callbacks.
pub struct LinuxDevice {
    fd: OwnedFd,
    events_id: usize,
}

impl LinuxDevice {
    /// Open `/dev/bus/usb/BBB/DDD`.
    pub fn open(busnum: u8, devnum: u8) -> Result<Arc<LinuxDevice>, Error> {
        let path = PathBuf::from(format!("/dev/bus/usb/{busnum:03}/{devnum:03}"));
        debug!("Opening usbfs device {}", path.display());
        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| errno_to_error(e, "failed to open device").log_error())?;
        Self::from_fd(fd)
    }

    /// Wrap an already opened usbfs file descriptor, e.g. one received from
    /// a privileged helper.
    pub fn from_fd(fd: OwnedFd) -> Result<Arc<LinuxDevice>, Error> {
        // because there's no Arc::try_new_cyclic
        let mut events_err = None;
        let arc = Arc::new_cyclic(|weak| {
            let res = events::register(fd.as_fd(), weak.clone());
            let events_id = *res.as_ref().unwrap_or(&usize::MAX);
            events_err = res.err();
            LinuxDevice { fd, events_id }
        });

        if let Some(err) = events_err {
            error!("Failed to initialize event loop: {err}");
            Err(err)
        } else {
            debug!("Opened device with events id {}", arc.events_id);
            Ok(arc)
        }
    }

    /// Claim an interface so transfers can be submitted to its endpoints.
    pub fn claim_interface(&self, interface: u8) -> Result<(), Error> {
        usbfs::claim_interface(&self.fd, interface).map_err(|e| {
            errno_to_error(e, "failed to claim interface").log_error()
        })?;
        debug!("Claimed interface {interface} on device {}", self.events_id);
        Ok(())
    }

    /// Release a claimed interface.
    pub fn release_interface(&self, interface: u8) -> Result<(), Error> {
        usbfs::release_interface(&self.fd, interface)
            .map_err(|e| errno_to_error(e, "failed to release interface").log_error())?;
        debug!("Released interface {interface} on device {}", self.events_id);
        Ok(())
    }

    pub(super) unsafe fn discard_urb(&self, urb: *mut Urb) -> Result<(), Errno> {
        unsafe { usbfs::discard_urb(&self.fd, urb) }
    }

    pub(super) fn handle_events(&self) {
        debug!("Handling events for device {}", self.events_id);
        loop {
            match usbfs::reap_urb_ndelay(&self.fd) {
                // SAFETY: the kernel hands back URBs we submitted, once
                Ok(urb) => unsafe { complete_urb(urb) },
                Err(Errno::AGAIN) => return,
                Err(Errno::NODEV) => {
                    debug!("Device {} disconnected", self.events_id);

                    // epoll returns events continuously on a disconnected device, and REAPURB
                    // only returns ENODEV after all events are received, so unregister to
                    // keep the event thread from spinning because we won't receive further events.
                    // The drop impl will try to unregister again, but that's ok.
                    events::unregister_fd(self.fd.as_fd());
                    return;
                }
                Err(e) => {
                    error!("Unexpected error {e} from REAPURBNDELAY");
                    return;
                }
            }
        }
    }
}

impl Drop for LinuxDevice {
    fn drop(&mut self) {
        debug!("Closing device {}", self.events_id);
        events::unregister(self.fd.as_fd(), self.events_id)
    }
}

/// Native transfer with the URB it is submitted as.
#[repr(C)]
struct UsbfsTransfer {
    /// Must be first: the `RawTransfer` pointer is cast to this type.
    raw: RawTransfer,

    /// `Urb` followed by the isochronous packet descriptors.
    urb: NonNull<Urb>,
    urb_layout: Layout,

    /// Key of the timeout registered with the event loop.
    deadline: Option<usize>,
}

impl UsbfsTransfer {
    fn new(iso_packets: usize) -> Option<Box<UsbfsTransfer>> {
        let urb_layout = urb_layout(iso_packets)?;
        // SAFETY: layout has non-zero size as it includes the `Urb`
        let urb = NonNull::new(unsafe { alloc::alloc_zeroed(urb_layout) })?.cast::<Urb>();

        Some(Box::new(UsbfsTransfer {
            raw: RawTransfer::new(iso_packets),
            urb,
            urb_layout,
            deadline: None,
        }))
    }

    fn iso_descs(&mut self) -> &mut [IsoPacketDesc] {
        // SAFETY: allocated with room for one descriptor per packet, right
        // after the `Urb`
        unsafe {
            let descs = self
                .urb
                .as_ptr()
                .cast::<u8>()
                .add(size_of::<Urb>())
                .cast::<IsoPacketDesc>();
            slice::from_raw_parts_mut(descs, self.raw.num_iso_packets())
        }
    }
}

impl Drop for UsbfsTransfer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.urb.as_ptr().cast(), self.urb_layout) }
    }
}

fn urb_layout(iso_packets: usize) -> Option<Layout> {
    let descs = Layout::array::<IsoPacketDesc>(iso_packets).ok()?;
    let (layout, offset) = Layout::new::<Urb>().extend(descs).ok()?;
    debug_assert_eq!(offset, size_of::<Urb>());
    Some(layout.pad_to_align())
}

fn urb_status(status: c_int, timed_out: bool) -> TransferStatus {
    if status == 0 {
        return TransferStatus::Completed;
    }
    let errno = match status.checked_neg() {
        Some(e @ 1..=4095) => Errno::from_raw_os_error(e),
        _ => return TransferStatus::Error,
    };
    match errno {
        Errno::NOENT | Errno::CONNRESET if timed_out => TransferStatus::TimedOut,
        Errno::NOENT | Errno::CONNRESET => TransferStatus::Cancelled,
        Errno::PIPE => TransferStatus::Stall,
        Errno::NODEV | Errno::SHUTDOWN => TransferStatus::NoDevice,
        Errno::OVERFLOW => TransferStatus::Overflow,
        Errno::TIMEDOUT => TransferStatus::TimedOut,
        // Short packet, only reported with URB_SHORT_NOT_OK
        Errno::REMOTEIO => TransferStatus::Completed,
        _ => TransferStatus::Error,
    }
}

/// Copy the URB's outcome into its transfer and call the completion callback.
///
/// SAFETY: `urb` was reaped from the kernel, and its `usercontext` is the
/// `UsbfsTransfer` that owns it.
unsafe fn complete_urb(urb: *mut Urb) {
    unsafe {
        let transfer = (*urb).usercontext.cast::<UsbfsTransfer>();
        let t = &mut *transfer;
        let urb = &*urb;
        debug!(
            "URB {:?} for ep {:02x} completed, status={} actual_length={}",
            t.urb, urb.endpoint, urb.status, urb.actual_length
        );

        let timed_out = t.deadline.take().is_some_and(events::remove_deadline);

        t.raw.status = urb_status(urb.status, timed_out);
        t.raw.actual_length = urb.actual_length.max(0) as usize;

        if t.raw.transfer_type == TransferType::Isochronous {
            let results: Vec<_> = t.iso_descs().to_vec();
            for (desc, result) in t.raw.iso_packet_desc.iter_mut().zip(results) {
                desc.actual_length = result.actual_length;
                desc.status = urb_status(result.status as c_int, false);
            }
        }

        match t.raw.callback {
            // The callback may free the transfer
            Some(callback) => callback(transfer.cast()),
            None => error!("Completed transfer has no callback"),
        }
    }
}

unsafe impl Backend for LinuxDevice {
    fn alloc_transfer(&self, iso_packets: usize) -> Option<NonNull<RawTransfer>> {
        let transfer = UsbfsTransfer::new(iso_packets)?;
        Some(NonNull::from(Box::leak(transfer)).cast())
    }

    unsafe fn free_transfer(&self, transfer: NonNull<RawTransfer>) {
        drop(unsafe { Box::from_raw(transfer.cast::<UsbfsTransfer>().as_ptr()) })
    }

    unsafe fn submit_transfer(&self, transfer: NonNull<RawTransfer>) -> Result<(), Error> {
        let t = unsafe { &mut *transfer.cast::<UsbfsTransfer>().as_ptr() };
        let raw = &t.raw;

        let buffer_length = c_int::try_from(raw.length).map_err(|_| {
            Error::new(ErrorKind::InvalidArgument, "transfer buffer too large").log_error()
        })?;

        let (ep_type, flags, packets_or_stream) = match raw.transfer_type {
            TransferType::Control => (USBDEVFS_URB_TYPE_CONTROL, 0, 0),
            TransferType::Bulk => (USBDEVFS_URB_TYPE_BULK, 0, 0),
            TransferType::BulkStream => (USBDEVFS_URB_TYPE_BULK, 0, raw.stream_id),
            TransferType::Interrupt => (USBDEVFS_URB_TYPE_INTERRUPT, 0, 0),
            TransferType::Isochronous => (
                USBDEVFS_URB_TYPE_ISO,
                USBDEVFS_URB_ISO_ASAP,
                raw.num_iso_packets() as u32,
            ),
        };

        let urb = Urb {
            ep_type,
            endpoint: raw.endpoint,
            status: 0,
            flags,
            buffer: raw.buffer,
            buffer_length,
            actual_length: 0,
            start_frame: 0,
            number_of_packets_or_stream_id: packets_or_stream,
            error_count: 0,
            signr: 0,
            usercontext: transfer.as_ptr().cast(),
        };
        let lengths: Vec<u32> = raw.iso_packet_desc.iter().map(|d| d.length).collect();
        let timeout = raw.timeout;

        unsafe { ptr::write(t.urb.as_ptr(), urb) };
        for (desc, length) in t.iso_descs().iter_mut().zip(lengths) {
            *desc = IsoPacketDesc {
                length,
                actual_length: 0,
                status: 0,
            };
        }

        // Registered before submitting, as the URB may complete right away.
        // The device is alive while it has transfers, so the weak reference
        // upgrades until the URB is reaped.
        if timeout > 0 {
            let at = Instant::now() + Duration::from_millis(timeout.into());
            let device = events::device_weak(self.events_id);
            t.deadline = Some(events::add_deadline(at, device, t.urb.as_ptr()));
        }

        match unsafe { usbfs::submit_urb(&self.fd, t.urb.as_ptr()) } {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(key) = t.deadline.take() {
                    events::remove_deadline(key);
                }
                // On ENODEV the event thread still reaps the URBs already
                // completed, and unregisters when REAPURB reports ENODEV.
                Err(errno_to_error(e, "failed to submit URB").log_debug())
            }
        }
    }

    unsafe fn cancel_transfer(&self, transfer: NonNull<RawTransfer>) -> Result<(), Error> {
        let t = unsafe { transfer.cast::<UsbfsTransfer>().as_ref() };
        match unsafe { self.discard_urb(t.urb.as_ptr()) } {
            Ok(()) => Ok(()),
            Err(Errno::INVAL) => Err(Error::new(ErrorKind::NotFound, "transfer not in flight")),
            Err(e) => Err(errno_to_error(e, "failed to discard URB")),
        }
    }
}
