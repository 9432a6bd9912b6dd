//! Transfer-related types.
//!
//! A [`Transfer`] owns one native transfer. Its type parameters select the
//! transfer kind ([`Control`], [`Bulk`], [`Interrupt`], [`Isochronous`],
//! [`BulkStream`]) and direction ([`In`], [`Out`]), which determine the
//! constructor, the submit method, and the result type.

use std::{ffi::c_void, fmt::Debug, marker::PhantomData, sync::Arc, time::Duration};

use log::warn;

use crate::{
    executor::Executor,
    native::{fill_control_setup, Backend, RawTransfer, TransferCallback, TransferType},
    Error, TransferError,
};

mod buffer;
pub use buffer::{
    default_allocator, Buffer, BufferAllocator, ControlBuffer, IoBuf, IoBufMut, SystemAllocator,
};

mod control;
pub use control::{ControlType, Direction, Recipient, SETUP_PACKET_SIZE};

mod internal;
use internal::TransferHandle;

mod token;
pub use token::{CompletionToken, TransferFuture, UseFuture};

#[cfg(test)]
mod tests;

mod sealed {
    pub trait Sealed {}
}

/// Kind of transfer, as a type parameter of [`Transfer`].
pub trait TransferKind: sealed::Sealed + Send + 'static {
    /// Native transfer type.
    const TRANSFER_TYPE: TransferType;

    /// Result reported in the [`Completion`].
    type Output: Default + Send + 'static;

    #[doc(hidden)]
    type Storage: Send + 'static;

    /// Build the result from a completed native transfer.
    #[doc(hidden)]
    fn collect(transfer: &RawTransfer, storage: &mut Self::Storage) -> Self::Output;
}

/// Transfer kinds that move data on a non-control endpoint.
pub trait DataKind: TransferKind {}

macro_rules! simple_kind {
    ($(#[$attr:meta])* $name:ident => $ty:expr) => {
        $(#[$attr])*
        #[derive(Debug, Copy, Clone)]
        pub enum $name {}

        impl sealed::Sealed for $name {}

        impl TransferKind for $name {
            const TRANSFER_TYPE: TransferType = $ty;
            type Output = usize;
            type Storage = ();

            fn collect(transfer: &RawTransfer, _: &mut ()) -> usize {
                transfer.actual_length
            }
        }
    };
}

simple_kind!(
    /// Control transfer on endpoint zero. Completes with the number of
    /// payload bytes transferred.
    Control => TransferType::Control
);

simple_kind!(
    /// Bulk transfer. Completes with the number of bytes transferred.
    Bulk => TransferType::Bulk
);

simple_kind!(
    /// Interrupt transfer. Completes with the number of bytes transferred.
    Interrupt => TransferType::Interrupt
);

simple_kind!(
    /// Bulk transfer on a USB 3 stream. Completes with the number of bytes
    /// transferred.
    BulkStream => TransferType::BulkStream
);

impl DataKind for Bulk {}
impl DataKind for Interrupt {}
impl DataKind for BulkStream {}

/// Isochronous transfer. Completes with one [`IsoPacketResult`] per packet.
#[derive(Debug, Copy, Clone)]
pub enum Isochronous {}

impl sealed::Sealed for Isochronous {}

impl TransferKind for Isochronous {
    const TRANSFER_TYPE: TransferType = TransferType::Isochronous;
    type Output = Vec<IsoPacketResult>;
    type Storage = Vec<IsoPacketResult>;

    fn collect(transfer: &RawTransfer, storage: &mut Vec<IsoPacketResult>) -> Vec<IsoPacketResult> {
        for (slot, desc) in storage.iter_mut().zip(transfer.iso_packet_desc.iter()) {
            *slot = IsoPacketResult {
                transferred: desc.actual_length as usize,
                status: desc.status.into_result(),
            };
        }
        std::mem::take(storage)
    }
}

impl DataKind for Isochronous {}

/// Direction of a transfer, as a type parameter of [`Transfer`].
pub trait EndpointDirection: sealed::Sealed + Send + 'static {
    /// The direction.
    const DIRECTION: Direction;
}

/// Device to host.
#[derive(Debug, Copy, Clone)]
pub enum In {}

/// Host to device.
#[derive(Debug, Copy, Clone)]
pub enum Out {}

impl sealed::Sealed for In {}
impl sealed::Sealed for Out {}

impl EndpointDirection for In {
    const DIRECTION: Direction = Direction::In;
}

impl EndpointDirection for Out {
    const DIRECTION: Direction = Direction::Out;
}

/// Outcome of one packet of an isochronous transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IsoPacketResult {
    /// Bytes transferred in this packet.
    pub transferred: usize,

    /// Packet status.
    pub status: Result<(), TransferError>,
}

impl Default for IsoPacketResult {
    fn default() -> Self {
        IsoPacketResult {
            transferred: 0,
            status: Ok(()),
        }
    }
}

/// Status, result and buffer returned on transfer completion.
///
/// A transfer can move data even in the case of failure or cancellation, thus
/// this is a struct containing both rather than a `Result`. A short transfer
/// (fewer bytes than requested) completes with `Ok(())`.
#[derive(Debug, Clone)]
pub struct Completion<R, B> {
    /// The buffer passed to the submit method.
    pub buffer: B,

    /// Bytes transferred, or per-packet results for isochronous transfers.
    /// Default-valued if the submission was rejected.
    pub result: R,

    /// Indicates successful completion or error.
    pub status: Result<(), TransferError>,
}

/// Lifecycle of a [`Transfer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Not yet submitted.
    Idle,

    /// Submitted, completion pending.
    Submitted,

    /// Completion delivered or submission rejected. The transfer cannot be
    /// submitted again.
    Completed,
}

/// Options for creating a [`Transfer`].
#[derive(Clone)]
pub struct TransferOptions {
    timeout: Duration,
    allocator: Arc<dyn BufferAllocator>,
}

impl TransferOptions {
    /// No timeout, buffers from the global allocator.
    pub fn new() -> TransferOptions {
        TransferOptions {
            timeout: Duration::ZERO,
            allocator: default_allocator(),
        }
    }

    /// Fail the transfer with [`TransferError::Timeout`] if it does not
    /// complete within `timeout`. Zero means no timeout. Rounded up to whole
    /// milliseconds.
    pub fn timeout(mut self, timeout: Duration) -> TransferOptions {
        self.timeout = timeout;
        self
    }

    /// Allocator for buffers obtained from the transfer.
    pub fn allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> TransferOptions {
        self.allocator = allocator;
        self
    }

    fn timeout_ms(&self) -> u32 {
        self.timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .try_into()
            .unwrap_or(u32::MAX)
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A USB transfer that can be submitted once.
///
/// * `K` is the [`TransferKind`] and `D` the [`EndpointDirection`].
/// * `B` is the native [`Backend`] of the device.
/// * `E` is the [`Executor`] that completions are posted to.
///
/// Use the type aliases like [`BulkIn`] or [`ControlOut`] to name a transfer.
///
/// A transfer goes from [`Idle`][TransferState::Idle] to
/// [`Submitted`][TransferState::Submitted] when submitted and to
/// [`Completed`][TransferState::Completed] when its completion is posted. Each
/// submission is completed exactly once, including when the native layer
/// rejects it. Create a new transfer to transfer again.
///
/// Dropping a submitted transfer requests cancellation; its completion is
/// still posted to the executor.
pub struct Transfer<K: TransferKind, D: EndpointDirection, B: Backend, E: Executor> {
    handle: TransferHandle<K, B, E>,
    endpoint: u8,
    allocator: Arc<dyn BufferAllocator>,
    _direction: PhantomData<fn() -> D>,
}

/// Control transfer from device to host.
pub type ControlIn<B, E> = Transfer<Control, In, B, E>;
/// Control transfer from host to device.
pub type ControlOut<B, E> = Transfer<Control, Out, B, E>;
/// Bulk IN transfer.
pub type BulkIn<B, E> = Transfer<Bulk, In, B, E>;
/// Bulk OUT transfer.
pub type BulkOut<B, E> = Transfer<Bulk, Out, B, E>;
/// Interrupt IN transfer.
pub type InterruptIn<B, E> = Transfer<Interrupt, In, B, E>;
/// Interrupt OUT transfer.
pub type InterruptOut<B, E> = Transfer<Interrupt, Out, B, E>;
/// Isochronous IN transfer.
pub type IsoIn<B, E> = Transfer<Isochronous, In, B, E>;
/// Isochronous OUT transfer.
pub type IsoOut<B, E> = Transfer<Isochronous, Out, B, E>;
/// Bulk stream IN transfer.
pub type BulkStreamIn<B, E> = Transfer<BulkStream, In, B, E>;
/// Bulk stream OUT transfer.
pub type BulkStreamOut<B, E> = Transfer<BulkStream, Out, B, E>;

impl<K, D, B, E> Transfer<K, D, B, E>
where
    K: TransferKind,
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    fn with_handle(
        executor: &E,
        device: &Arc<B>,
        endpoint: u8,
        iso_packets: usize,
        storage: K::Storage,
        options: TransferOptions,
        fill: impl FnOnce(&mut RawTransfer, TransferCallback, *mut c_void, u32),
    ) -> Result<Self, Error> {
        let timeout = options.timeout_ms();
        let handle = TransferHandle::new(
            executor.clone(),
            device,
            iso_packets,
            storage,
            |raw, callback, user_data| fill(raw, callback, user_data, timeout),
        )?;
        Ok(Transfer {
            handle,
            endpoint,
            allocator: options.allocator,
            _direction: PhantomData,
        })
    }

    /// Endpoint address, including the direction bit. Zero for control
    /// transfers.
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Current lifecycle state.
    ///
    /// The state changes to `Completed` right after the completion is
    /// posted, so a completion handler or a resolved [`TransferFuture`] may
    /// briefly still observe `Submitted`.
    pub fn state(&self) -> TransferState {
        self.handle.state()
    }

    /// Request cancellation of the submitted transfer.
    ///
    /// This only reports whether the request was accepted. If it was, the
    /// transfer still completes through its completion handler, usually with
    /// [`TransferError::Cancelled`], but it may also have finished normally.
    /// Fails with [`ErrorKind::NotFound`][crate::ErrorKind::NotFound] if the
    /// transfer is not in flight, e.g. because it already completed.
    pub fn cancel(&self) -> Result<(), Error> {
        self.handle.cancel()
    }

    fn submit<Buf, T>(
        &mut self,
        buffer: Buf,
        token: T,
        prepare: impl FnOnce(&mut RawTransfer),
    ) -> T::Output
    where
        Buf: Send + 'static,
        T: CompletionToken<Completion<K::Output, Buf>>,
    {
        let (handler, output) = token.into_handler();
        self.handle.submit(
            prepare,
            Box::new(move |status, result| {
                handler(Completion {
                    buffer,
                    result,
                    status,
                })
            }),
        );
        output
    }
}

impl<D, B, E> Transfer<Control, D, B, E>
where
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    /// Create a control transfer on endpoint zero of `device`.
    ///
    /// Fails with [`ErrorKind::OutOfMemory`][crate::ErrorKind::OutOfMemory]
    /// if the native transfer could not be allocated.
    pub fn new(executor: &E, device: &Arc<B>, options: TransferOptions) -> Result<Self, Error> {
        Self::with_handle(
            executor,
            device,
            0,
            0,
            (),
            options,
            |raw, callback, user_data, timeout| unsafe {
                raw.fill_control_transfer(std::ptr::null_mut(), callback, user_data, timeout)
            },
        )
    }

    /// Allocate a [`ControlBuffer`] from the transfer's allocator.
    pub fn allocate_control_buffer(&self, size: u16) -> Result<ControlBuffer, Error> {
        ControlBuffer::new_in(size, self.allocator.clone())
    }

    /// Submit a control request.
    ///
    /// The setup packet is written into the 8 bytes preceding the payload of
    /// `buffer`, with the direction taken from `D` and `wLength` set to the
    /// payload size. The completion reports the number of payload bytes
    /// transferred and returns the buffer; for IN requests the received data
    /// is at the start of its payload.
    ///
    /// ### Panics
    /// * If the transfer was already submitted.
    #[allow(clippy::too_many_arguments)]
    pub fn async_control<T>(
        &mut self,
        recipient: Recipient,
        control_type: ControlType,
        request: u8,
        value: u16,
        index: u16,
        mut buffer: ControlBuffer,
        token: T,
    ) -> T::Output
    where
        T: CompletionToken<Completion<usize, ControlBuffer>>,
    {
        // Payload size is a u16 by construction
        let length = buffer.size() as u16;
        let frame = buffer.frame_mut();
        fill_control_setup(
            frame,
            control::request_type(D::DIRECTION, control_type, recipient),
            request,
            value,
            index,
            length,
        );
        let (ptr, len) = (frame.as_mut_ptr(), frame.len());

        self.submit(buffer, token, move |raw| {
            raw.buffer = ptr;
            raw.length = len;
        })
    }
}

impl<K, D, B, E> Transfer<K, D, B, E>
where
    K: DataKind,
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    /// Allocate a [`Buffer`] of `len` bytes from the transfer's allocator.
    pub fn allocate_buffer(&self, len: usize) -> Result<Buffer, Error> {
        Buffer::new_in(len, self.allocator.clone())
    }
}

/// `endpoint` with its direction bit set to match `D`.
fn data_endpoint<D: EndpointDirection>(endpoint: u8) -> u8 {
    let address = D::DIRECTION.endpoint_address(endpoint);
    if Direction::from_address(endpoint) != D::DIRECTION {
        warn!("Endpoint {endpoint:02x} does not match the transfer direction, using {address:02x}");
    }
    address
}

impl<D, B, E> Transfer<Bulk, D, B, E>
where
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    /// Create a bulk transfer on `endpoint` of `device`.
    ///
    /// Fails with [`ErrorKind::OutOfMemory`][crate::ErrorKind::OutOfMemory]
    /// if the native transfer could not be allocated.
    pub fn new(
        executor: &E,
        device: &Arc<B>,
        endpoint: u8,
        options: TransferOptions,
    ) -> Result<Self, Error> {
        let endpoint = data_endpoint::<D>(endpoint);
        Self::with_handle(
            executor,
            device,
            endpoint,
            0,
            (),
            options,
            |raw, callback, user_data, timeout| {
                raw.fill_bulk_transfer(
                    endpoint,
                    std::ptr::null_mut(),
                    0,
                    callback,
                    user_data,
                    timeout,
                )
            },
        )
    }
}

impl<D, B, E> Transfer<Interrupt, D, B, E>
where
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    /// Create an interrupt transfer on `endpoint` of `device`.
    ///
    /// Fails with [`ErrorKind::OutOfMemory`][crate::ErrorKind::OutOfMemory]
    /// if the native transfer could not be allocated.
    pub fn new(
        executor: &E,
        device: &Arc<B>,
        endpoint: u8,
        options: TransferOptions,
    ) -> Result<Self, Error> {
        let endpoint = data_endpoint::<D>(endpoint);
        Self::with_handle(
            executor,
            device,
            endpoint,
            0,
            (),
            options,
            |raw, callback, user_data, timeout| {
                raw.fill_interrupt_transfer(
                    endpoint,
                    std::ptr::null_mut(),
                    0,
                    callback,
                    user_data,
                    timeout,
                )
            },
        )
    }
}

impl<D, B, E> Transfer<BulkStream, D, B, E>
where
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    /// Create a bulk transfer on stream `stream_id` of `endpoint`.
    ///
    /// Fails with [`ErrorKind::OutOfMemory`][crate::ErrorKind::OutOfMemory]
    /// if the native transfer could not be allocated.
    pub fn new(
        executor: &E,
        device: &Arc<B>,
        endpoint: u8,
        stream_id: u32,
        options: TransferOptions,
    ) -> Result<Self, Error> {
        let endpoint = data_endpoint::<D>(endpoint);
        Self::with_handle(
            executor,
            device,
            endpoint,
            0,
            (),
            options,
            |raw, callback, user_data, timeout| {
                raw.fill_bulk_stream_transfer(
                    endpoint,
                    stream_id,
                    std::ptr::null_mut(),
                    0,
                    callback,
                    user_data,
                    timeout,
                )
            },
        )
    }
}

impl<D, B, E> Transfer<Isochronous, D, B, E>
where
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    /// Create an isochronous transfer on `endpoint` of `device`, with one
    /// packet per entry of `packet_sizes`.
    ///
    /// The completion reports one [`IsoPacketResult`] per packet, in the same
    /// order.
    ///
    /// Fails with [`ErrorKind::OutOfMemory`][crate::ErrorKind::OutOfMemory]
    /// if the native transfer could not be allocated.
    pub fn new<I>(
        executor: &E,
        device: &Arc<B>,
        endpoint: u8,
        packet_sizes: I,
        options: TransferOptions,
    ) -> Result<Self, Error>
    where
        I: IntoIterator,
        I::Item: Into<u32>,
    {
        let lengths: Vec<u32> = packet_sizes.into_iter().map(Into::into).collect();
        let storage = vec![IsoPacketResult::default(); lengths.len()];
        let endpoint = data_endpoint::<D>(endpoint);
        Self::with_handle(
            executor,
            device,
            endpoint,
            lengths.len(),
            storage,
            options,
            |raw, callback, user_data, timeout| {
                raw.fill_iso_transfer(
                    endpoint,
                    std::ptr::null_mut(),
                    0,
                    callback,
                    user_data,
                    timeout,
                );
                raw.set_iso_packet_lengths(lengths);
            },
        )
    }
}

impl<K, B, E> Transfer<K, In, B, E>
where
    K: DataKind,
    B: Backend,
    E: Executor,
{
    /// Submit the transfer to read up to `buffer.len()` bytes into `buffer`.
    ///
    /// The completion returns the buffer along with the number of bytes
    /// received, or the per-packet results for isochronous transfers.
    ///
    /// ### Panics
    /// * If the transfer was already submitted.
    pub fn async_read_some<Buf, T>(&mut self, mut buffer: Buf, token: T) -> T::Output
    where
        Buf: IoBufMut,
        T: CompletionToken<Completion<K::Output, Buf>>,
    {
        let (ptr, len) = (buffer.as_mut_ptr(), buffer.len());
        self.submit(buffer, token, move |raw| {
            raw.buffer = ptr;
            raw.length = len;
        })
    }
}

impl<K, B, E> Transfer<K, Out, B, E>
where
    K: DataKind,
    B: Backend,
    E: Executor,
{
    /// Submit the transfer to write the contents of `buffer`.
    ///
    /// The completion returns the buffer along with the number of bytes
    /// sent, or the per-packet results for isochronous transfers.
    ///
    /// ### Panics
    /// * If the transfer was already submitted.
    pub fn async_write_some<Buf, T>(&mut self, buffer: Buf, token: T) -> T::Output
    where
        Buf: IoBuf,
        T: CompletionToken<Completion<K::Output, Buf>>,
    {
        // The native layer takes a mutable pointer but does not write to an
        // OUT buffer.
        let (ptr, len) = (buffer.as_ptr().cast_mut(), buffer.len());
        self.submit(buffer, token, move |raw| {
            raw.buffer = ptr;
            raw.length = len;
        })
    }
}

impl<K, D, B, E> Debug for Transfer<K, D, B, E>
where
    K: TransferKind,
    D: EndpointDirection,
    B: Backend,
    E: Executor,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("type", &K::TRANSFER_TYPE)
            .field("direction", &D::DIRECTION)
            .field("endpoint", &format_args!("{:02x}", self.endpoint))
            .field("state", &self.state())
            .finish()
    }
}
