//! Interface to the native USB driver layer.
//!
//! A [`Backend`] allocates, submits and cancels [`RawTransfer`]s and calls
//! the transfer's callback when it completes. This crate fills in the
//! transfer fields and bridges the callback to an [`Executor`][crate::Executor].

use std::{ffi::c_void, ptr::NonNull};

use crate::{transfer::SETUP_PACKET_SIZE, Error, TransferError};

/// Function called by the native layer when a transfer completes.
///
/// SAFETY(backend): called at most once per successful submission with the
/// pointer that was submitted. The transfer must not be accessed by the
/// backend after the call, as the callback may free it.
pub type TransferCallback = unsafe fn(transfer: *mut RawTransfer);

/// Native transfer type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    /// Control transfer on endpoint zero.
    Control = 0,

    /// Isochronous transfer.
    Isochronous = 1,

    /// Bulk transfer.
    Bulk = 2,

    /// Interrupt transfer.
    Interrupt = 3,

    /// Bulk transfer on a USB 3 stream.
    BulkStream = 4,
}

/// Status written by the native layer before invoking the callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Transfer completed without error. Fewer bytes than requested may
    /// have been transferred.
    #[default]
    Completed,

    /// Transfer failed.
    Error,

    /// Transfer timed out.
    TimedOut,

    /// Transfer was cancelled.
    Cancelled,

    /// Endpoint stalled, or a control request was not supported.
    Stall,

    /// Device was disconnected.
    NoDevice,

    /// Device sent more data than requested.
    Overflow,
}

impl TransferStatus {
    /// Classify the native status.
    pub fn into_result(self) -> Result<(), TransferError> {
        match self {
            TransferStatus::Completed => Ok(()),
            TransferStatus::Error => Err(TransferError::Fault),
            TransferStatus::TimedOut => Err(TransferError::Timeout),
            TransferStatus::Cancelled => Err(TransferError::Cancelled),
            TransferStatus::Stall => Err(TransferError::Stall),
            TransferStatus::NoDevice => Err(TransferError::Disconnected),
            TransferStatus::Overflow => Err(TransferError::Overflow),
        }
    }
}

/// Per-packet slot of an isochronous transfer.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    /// Requested length of the packet.
    pub length: u32,

    /// Bytes actually transferred, written on completion.
    pub actual_length: u32,

    /// Packet status, written on completion.
    pub status: TransferStatus,
}

/// Native transfer descriptor.
///
/// Backends may embed this as the first field of a `#[repr(C)]` struct to
/// keep platform-specific state next to it.
#[repr(C)]
#[derive(Debug)]
pub struct RawTransfer {
    /// Endpoint address, including the direction bit.
    pub endpoint: u8,

    /// Type of the transfer.
    pub transfer_type: TransferType,

    /// Timeout in milliseconds, `0` for none.
    pub timeout: u32,

    /// Completion status, valid in the callback.
    pub status: TransferStatus,

    /// Length of `buffer`. For control transfers this includes the setup packet.
    pub length: usize,

    /// Bytes transferred, valid in the callback. For control transfers this
    /// excludes the setup packet.
    pub actual_length: usize,

    /// Completion callback.
    pub callback: Option<TransferCallback>,

    /// Opaque pointer for use by the callback.
    pub user_data: *mut c_void,

    /// Data buffer. For control transfers the setup packet comes first.
    pub buffer: *mut u8,

    /// Stream ID for bulk stream transfers.
    pub stream_id: u32,

    /// Isochronous packet descriptors; empty for other transfer types.
    pub iso_packet_desc: Box<[IsoPacketDescriptor]>,
}

impl RawTransfer {
    /// Create an idle transfer with room for `iso_packets` packet descriptors.
    pub fn new(iso_packets: usize) -> RawTransfer {
        RawTransfer {
            endpoint: 0,
            transfer_type: TransferType::Control,
            timeout: 0,
            status: TransferStatus::Completed,
            length: 0,
            actual_length: 0,
            callback: None,
            user_data: std::ptr::null_mut(),
            buffer: std::ptr::null_mut(),
            stream_id: 0,
            iso_packet_desc: vec![IsoPacketDescriptor::default(); iso_packets].into_boxed_slice(),
        }
    }

    /// Number of isochronous packets.
    pub fn num_iso_packets(&self) -> usize {
        self.iso_packet_desc.len()
    }

    #[allow(clippy::too_many_arguments)]
    fn fill(
        &mut self,
        transfer_type: TransferType,
        endpoint: u8,
        buffer: *mut u8,
        length: usize,
        callback: TransferCallback,
        user_data: *mut c_void,
        timeout: u32,
    ) {
        self.transfer_type = transfer_type;
        self.endpoint = endpoint;
        self.buffer = buffer;
        self.length = length;
        self.callback = Some(callback);
        self.user_data = user_data;
        self.timeout = timeout;
    }

    /// Fill in a control transfer on endpoint zero.
    ///
    /// If `buffer` is non-null it must begin with a setup packet, and the
    /// length is taken from its `wLength` field.
    ///
    /// SAFETY: `buffer` is null or valid for reads of [`SETUP_PACKET_SIZE`] bytes.
    pub unsafe fn fill_control_transfer(
        &mut self,
        buffer: *mut u8,
        callback: TransferCallback,
        user_data: *mut c_void,
        timeout: u32,
    ) {
        let length = if buffer.is_null() {
            0
        } else {
            let w_length = unsafe { u16::from_le_bytes([*buffer.add(6), *buffer.add(7)]) };
            SETUP_PACKET_SIZE + usize::from(w_length)
        };
        self.fill(
            TransferType::Control,
            0,
            buffer,
            length,
            callback,
            user_data,
            timeout,
        );
    }

    /// Fill in a bulk transfer.
    pub fn fill_bulk_transfer(
        &mut self,
        endpoint: u8,
        buffer: *mut u8,
        length: usize,
        callback: TransferCallback,
        user_data: *mut c_void,
        timeout: u32,
    ) {
        self.fill(
            TransferType::Bulk,
            endpoint,
            buffer,
            length,
            callback,
            user_data,
            timeout,
        );
    }

    /// Fill in a bulk transfer on a stream.
    #[allow(clippy::too_many_arguments)]
    pub fn fill_bulk_stream_transfer(
        &mut self,
        endpoint: u8,
        stream_id: u32,
        buffer: *mut u8,
        length: usize,
        callback: TransferCallback,
        user_data: *mut c_void,
        timeout: u32,
    ) {
        self.fill(
            TransferType::BulkStream,
            endpoint,
            buffer,
            length,
            callback,
            user_data,
            timeout,
        );
        self.stream_id = stream_id;
    }

    /// Fill in an interrupt transfer.
    pub fn fill_interrupt_transfer(
        &mut self,
        endpoint: u8,
        buffer: *mut u8,
        length: usize,
        callback: TransferCallback,
        user_data: *mut c_void,
        timeout: u32,
    ) {
        self.fill(
            TransferType::Interrupt,
            endpoint,
            buffer,
            length,
            callback,
            user_data,
            timeout,
        );
    }

    /// Fill in an isochronous transfer. Packet lengths are set separately
    /// with [`set_iso_packet_lengths`][Self::set_iso_packet_lengths].
    pub fn fill_iso_transfer(
        &mut self,
        endpoint: u8,
        buffer: *mut u8,
        length: usize,
        callback: TransferCallback,
        user_data: *mut c_void,
        timeout: u32,
    ) {
        self.fill(
            TransferType::Isochronous,
            endpoint,
            buffer,
            length,
            callback,
            user_data,
            timeout,
        );
    }

    /// Set the requested length of each isochronous packet, in order.
    ///
    /// Extra lengths beyond the allocated packet count are ignored.
    pub fn set_iso_packet_lengths(&mut self, lengths: impl IntoIterator<Item = u32>) {
        for (desc, length) in self.iso_packet_desc.iter_mut().zip(lengths) {
            desc.length = length;
        }
    }
}

/// Write a control setup packet into the first [`SETUP_PACKET_SIZE`] bytes
/// of `buffer`. Multi-byte fields are little-endian.
///
/// ### Panics
/// * If `buffer` is shorter than [`SETUP_PACKET_SIZE`].
pub fn fill_control_setup(
    buffer: &mut [u8],
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) {
    let [value_lo, value_hi] = value.to_le_bytes();
    let [index_lo, index_hi] = index.to_le_bytes();
    let [length_lo, length_hi] = length.to_le_bytes();
    buffer[..SETUP_PACKET_SIZE].copy_from_slice(&[
        request_type,
        request,
        value_lo,
        value_hi,
        index_lo,
        index_hi,
        length_lo,
        length_hi,
    ]);
}

/// Native transfer primitives of an opened device.
///
/// # Safety
///
/// Implementations must uphold the completion contract:
///
/// * After `submit_transfer` returns `Ok`, the transfer's callback is called
///   exactly once, from any thread, after the status, actual length and
///   isochronous packet results have been written.
/// * After `submit_transfer` returns `Err`, the callback is never called.
/// * The backend does not access the transfer or its buffer after calling the
///   callback. The callback may free the transfer.
/// * Writes made to the transfer before submission are visible to the callback.
pub unsafe trait Backend: Send + Sync + 'static {
    /// Allocate a transfer with room for `iso_packets` isochronous packet
    /// descriptors. Returns `None` if allocation failed.
    fn alloc_transfer(&self, iso_packets: usize) -> Option<NonNull<RawTransfer>>;

    /// Free a transfer.
    ///
    /// SAFETY(caller): `transfer` came from `alloc_transfer` on this backend
    /// and is not in flight.
    unsafe fn free_transfer(&self, transfer: NonNull<RawTransfer>);

    /// Submit a filled transfer.
    ///
    /// SAFETY(caller): `transfer` came from `alloc_transfer` on this backend,
    /// is not in flight, and its buffer remains valid until the callback is called.
    unsafe fn submit_transfer(&self, transfer: NonNull<RawTransfer>) -> Result<(), Error>;

    /// Request cancellation of a transfer. It completes through its callback
    /// with [`TransferStatus::Cancelled`] unless it had already finished.
    /// Returns an error of kind [`NotFound`][crate::ErrorKind::NotFound] if the
    /// transfer is not in flight.
    ///
    /// SAFETY(caller): `transfer` came from `alloc_transfer` on this backend
    /// and has not been freed.
    unsafe fn cancel_transfer(&self, transfer: NonNull<RawTransfer>) -> Result<(), Error>;
}
