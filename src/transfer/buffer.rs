use std::{
    alloc::Layout,
    fmt::Debug,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::Arc,
};

use once_cell::sync::Lazy;

use crate::{Error, ErrorKind};

use super::SETUP_PACKET_SIZE;

/// Source of memory for transfer buffers.
///
/// Pass an implementation to [`Buffer::new_in`], [`ControlBuffer::new_in`] or
/// [`TransferOptions::allocator`][super::TransferOptions::allocator] to
/// allocate buffers from a pool or to instrument allocations.
///
/// # Safety
///
/// `allocate` must return memory valid for reads and writes of
/// `layout.size()` bytes, aligned to `layout.align()`, that stays valid until
/// passed to `deallocate` with the same layout.
pub unsafe trait BufferAllocator: Send + Sync {
    /// Allocate memory for `layout`, which always has a non-zero size.
    /// Returns `None` if out of memory.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return memory obtained from `allocate`.
    ///
    /// SAFETY(caller): `ptr` was returned by `allocate` on this allocator with `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Allocates from the global allocator.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemAllocator;

unsafe impl BufferAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: callers never pass a zero-size layout
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// The shared [`SystemAllocator`] used when no allocator is given.
pub fn default_allocator() -> Arc<dyn BufferAllocator> {
    static DEFAULT: Lazy<Arc<dyn BufferAllocator>> = Lazy::new(|| Arc::new(SystemAllocator));
    DEFAULT.clone()
}

/// Fixed-size, zero-initialized byte buffer from a [`BufferAllocator`].
///
/// Its address does not change when the `Buffer` is moved, so it can be
/// handed to a transfer and returned in the completion.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    allocator: Arc<dyn BufferAllocator>,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate a buffer of `len` bytes from the global allocator.
    pub fn new(len: usize) -> Result<Buffer, Error> {
        Buffer::new_in(len, default_allocator())
    }

    /// Allocate a buffer of `len` bytes from `allocator`.
    pub fn new_in(len: usize, allocator: Arc<dyn BufferAllocator>) -> Result<Buffer, Error> {
        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            let layout = Layout::array::<u8>(len)
                .map_err(|_| Error::new(ErrorKind::OutOfMemory, "buffer size overflow"))?;
            let ptr = allocator
                .allocate(layout)
                .ok_or_else(|| Error::new(ErrorKind::OutOfMemory, "failed to allocate buffer"))?;
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };
            ptr
        };
        Ok(Buffer {
            ptr,
            len,
            allocator,
        })
    }

    /// Number of bytes in the buffer.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("data", &format_args!("{:02x?}", &self[..]))
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.len != 0 {
            // Layout was valid when allocated
            let layout = Layout::array::<u8>(self.len).unwrap();
            unsafe { self.allocator.deallocate(self.ptr, layout) }
        }
    }
}

/// Buffer for control transfers.
///
/// A single allocation holds the 8-byte setup packet followed by the data
/// stage. Only the data stage (the payload) is exposed; the setup packet is
/// written when the buffer is submitted with
/// [`Transfer::async_control`][super::Transfer::async_control].
///
/// * For OUT requests, fill the payload with the data to send.
/// * For IN requests, the payload size is the number of bytes requested, and
///   the completion reports how many were received.
pub struct ControlBuffer {
    frame: Buffer,
}

impl ControlBuffer {
    /// Allocate a control buffer with a payload of `size` bytes.
    pub fn new(size: u16) -> Result<ControlBuffer, Error> {
        ControlBuffer::new_in(size, default_allocator())
    }

    /// Allocate a control buffer with a payload of `size` bytes from `allocator`.
    pub fn new_in(size: u16, allocator: Arc<dyn BufferAllocator>) -> Result<ControlBuffer, Error> {
        Ok(ControlBuffer {
            frame: Buffer::new_in(SETUP_PACKET_SIZE + usize::from(size), allocator)?,
        })
    }

    /// Size of the payload.
    #[inline]
    pub fn size(&self) -> usize {
        self.frame.len() - SETUP_PACKET_SIZE
    }

    /// The payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.frame[SETUP_PACKET_SIZE..]
    }

    /// The payload, mutably.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.frame[SETUP_PACKET_SIZE..]
    }

    /// Pointer to the start of the payload. The setup packet occupies the
    /// [`SETUP_PACKET_SIZE`] bytes before it.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.payload().as_ptr()
    }

    /// The setup packet.
    pub(crate) fn setup(&self) -> &[u8] {
        &self.frame[..SETUP_PACKET_SIZE]
    }

    /// Setup packet and payload as one slice.
    pub(crate) fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.frame
    }
}

impl Deref for ControlBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl DerefMut for ControlBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.payload_mut()
    }
}

impl Debug for ControlBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBuffer")
            .field("setup", &format_args!("{:02x?}", self.setup()))
            .field("payload", &format_args!("{:02x?}", self.payload()))
            .finish()
    }
}

/// Buffer that can be the source of an OUT transfer.
///
/// # Safety
///
/// The memory at `as_ptr()..as_ptr() + len()` must stay valid and unchanged
/// while the value is moved and until it is dropped or mutably accessed.
pub unsafe trait IoBuf: Send + 'static {
    /// Pointer to the data.
    fn as_ptr(&self) -> *const u8;

    /// Number of bytes to send.
    fn len(&self) -> usize;

    /// Whether the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffer that can be the destination of an IN transfer. Its length is the
/// number of bytes requested.
///
/// # Safety
///
/// As for [`IoBuf`], and the memory must be valid for writes.
pub unsafe trait IoBufMut: IoBuf {
    /// Pointer to the data.
    fn as_mut_ptr(&mut self) -> *mut u8;
}

unsafe impl IoBuf for Vec<u8> {
    fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

unsafe impl IoBufMut for Vec<u8> {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }
}

unsafe impl IoBuf for Box<[u8]> {
    fn as_ptr(&self) -> *const u8 {
        (**self).as_ptr()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

unsafe impl IoBufMut for Box<[u8]> {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        (**self).as_mut_ptr()
    }
}

unsafe impl IoBuf for Buffer {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

unsafe impl IoBufMut for Buffer {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

unsafe impl IoBuf for &'static [u8] {
    fn as_ptr(&self) -> *const u8 {
        (**self).as_ptr()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}
