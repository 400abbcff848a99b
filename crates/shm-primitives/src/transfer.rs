//! Single-slot chunked text transfer over a shared buffer.
//!
//! A cooperative producer (an async task) hands a UTF-8 string to a blocking
//! consumer (an OS thread that may not yield to its event loop) one chunk at
//! a time through a fixed-size region. The region starts with a
//! [`TransferHeader`] followed immediately by the data area:
//!
//! ```text
//! offset  size  field
//!      0     8  length cell (i64): len = more follows, !len = last chunk
//!      8     4  mutex word
//!     12     4  "not full" condition sequence
//!     16     4  "not empty" condition sequence
//!     20     1  generation (wrapping u8)
//!     21     1  used chunks (0 or 1)
//!     22     n  data, n >= MIN_DATA_LEN
//! ```
//!
//! Every access to the length cell, generation, used counter or data area
//! happens with the embedded mutex held.
//!
//! Cancellation without interruption: each consumer bumps the generation
//! before reading. A producer captures the generation on its first lock
//! acquisition and re-checks it on every later one; if it moved, a newer
//! transfer owns the buffer and the producer exits without writing.
//!
//! The generation is a single byte. A producer that stays suspended for
//! exactly a multiple of 256 newer transfers would wrongly resume.

use core::fmt;
use core::mem::{align_of, offset_of, size_of};

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use crate::lock::{Cond, Lock};
use crate::region::Region;
use crate::sync::{AtomicI64, AtomicU8, Ordering};

/// Field layout of the shared header. Never referenced as a whole: its
/// trailing padding would overlap the data area.
#[repr(C)]
#[allow(dead_code)]
struct HeaderLayout {
    len: AtomicI64,
    lock: Lock,
    not_full: Cond,
    not_empty: Cond,
    generation: AtomicU8,
    used: AtomicU8,
}

/// Bytes in front of the data area.
pub const TRANSFER_OVERHEAD: usize = offset_of!(HeaderLayout, used) + size_of::<AtomicU8>();

/// Smallest data area: one chunk must be able to hold any UTF-8 character.
pub const MIN_DATA_LEN: usize = 4;

pub const MIN_TRANSFER_BUFFER_LEN: usize = TRANSFER_OVERHEAD + MIN_DATA_LEN;

pub const DEFAULT_TRANSFER_BUFFER_LEN: usize = 4096;

/// Only one chunk may be pending at a time.
const CAPACITY: u8 = 1;

#[cfg(not(feature = "loom"))]
const _: () = {
    assert!(offset_of!(HeaderLayout, len) == 0);
    assert!(offset_of!(HeaderLayout, lock) == 8);
    assert!(offset_of!(HeaderLayout, not_full) == 12);
    assert!(offset_of!(HeaderLayout, not_empty) == 16);
    assert!(offset_of!(HeaderLayout, generation) == 20);
    assert!(TRANSFER_OVERHEAD == 22);
    assert!(MIN_TRANSFER_BUFFER_LEN == 26);
    assert!(align_of::<HeaderLayout>() == 8);
};

/// The shared header at the start of a transfer buffer, one reference per
/// field.
#[derive(Clone, Copy)]
pub struct TransferHeader<'a> {
    /// Length of the pending chunk; negative (`!len`) when it is the last.
    pub len: &'a AtomicI64,
    pub lock: &'a Lock,
    pub not_full: &'a Cond,
    pub not_empty: &'a Cond,
    pub generation: &'a AtomicU8,
    pub used: &'a AtomicU8,
}

/// Errors from the transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The region cannot hold the header plus [`MIN_DATA_LEN`] bytes.
    RegionTooSmall { len: usize, min: usize },
    /// The region base is not aligned for the header.
    Misaligned { addr: usize, align: usize },
    /// A newer transfer started; this side no longer owns the buffer.
    Superseded { expected: u8, found: u8 },
    /// The transfer already delivered its last chunk (or was superseded).
    Finished,
    /// The length cell does not describe a chunk that fits the data area.
    CorruptLength { cell: i64, capacity: usize },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegionTooSmall { len, min } => {
                write!(f, "transfer buffer of {len} bytes is smaller than {min}")
            }
            Self::Misaligned { addr, align } => {
                write!(f, "transfer buffer at {addr:#x} is not {align}-byte aligned")
            }
            Self::Superseded { expected, found } => write!(
                f,
                "transfer superseded: generation {expected} replaced by {found}"
            ),
            Self::Finished => write!(f, "transfer already finished"),
            Self::CorruptLength { cell, capacity } => write!(
                f,
                "corrupt chunk length cell {cell} for data area of {capacity} bytes"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransferError {}

/// Whether a chunk was the final one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    More,
    Last,
}

impl Chunk {
    pub fn is_last(self) -> bool {
        self == Chunk::Last
    }
}

fn encode_len(len: usize, chunk: Chunk) -> i64 {
    let len = len as i64;
    match chunk {
        Chunk::More => len,
        Chunk::Last => !len,
    }
}

fn decode_len(cell: i64) -> (usize, Chunk) {
    if cell < 0 {
        ((!cell) as usize, Chunk::Last)
    } else {
        (cell as usize, Chunk::More)
    }
}

/// End index of the longest prefix of `text[start..]` that fits in
/// `capacity` bytes and ends on a character boundary.
fn chunk_end(text: &str, start: usize, capacity: usize) -> usize {
    let mut end = text.len().min(start + capacity);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// # Safety
///
/// `offset` must be in bounds and aligned for `T`.
unsafe fn write_field<T>(region: &Region, offset: usize, value: T) {
    // SAFETY: upheld by the caller.
    unsafe { core::ptr::write(region.offset(offset) as *mut T, value) }
}

/// Handle to a transfer buffer living in a [`Region`].
///
/// This is a plain view: it is `Copy` and does not keep the memory alive.
/// See [`SharedTransferBuffer`] for an owning variant.
#[derive(Debug, Clone, Copy)]
pub struct TransferBuffer {
    region: Region,
}

impl TransferBuffer {
    fn check(region: &Region) -> Result<(), TransferError> {
        let min = MIN_TRANSFER_BUFFER_LEN;
        if region.len() < min {
            return Err(TransferError::RegionTooSmall {
                len: region.len(),
                min,
            });
        }
        let addr = region.as_ptr() as usize;
        let align = align_of::<HeaderLayout>();
        if !addr.is_multiple_of(align) {
            return Err(TransferError::Misaligned { addr, align });
        }
        Ok(())
    }

    /// Initialize a fresh transfer buffer in `region`.
    ///
    /// # Safety
    ///
    /// The region must be writable, exclusively owned during initialization,
    /// and outlive every handle attached to it.
    pub unsafe fn init(region: Region) -> Result<Self, TransferError> {
        Self::check(&region)?;
        // SAFETY: size and alignment checked above. Only the header fields
        // are written, never the data area.
        unsafe {
            write_field(&region, offset_of!(HeaderLayout, len), AtomicI64::new(0));
            write_field(&region, offset_of!(HeaderLayout, lock), Lock::new());
            write_field(&region, offset_of!(HeaderLayout, not_full), Cond::new());
            write_field(&region, offset_of!(HeaderLayout, not_empty), Cond::new());
            write_field(&region, offset_of!(HeaderLayout, generation), AtomicU8::new(0));
            write_field(&region, offset_of!(HeaderLayout, used), AtomicU8::new(0));
        }
        Ok(Self { region })
    }

    /// Attach to a transfer buffer another party already initialized.
    ///
    /// # Safety
    ///
    /// The region must hold an initialized header and outlive the handle.
    pub unsafe fn attach(region: Region) -> Result<Self, TransferError> {
        Self::check(&region)?;
        Ok(Self { region })
    }

    #[inline]
    pub fn header(&self) -> TransferHeader<'_> {
        let region = &self.region;
        // SAFETY: size and alignment checked at construction; every field
        // was written by `init`.
        unsafe {
            TransferHeader {
                len: region.get(offset_of!(HeaderLayout, len)),
                lock: region.get(offset_of!(HeaderLayout, lock)),
                not_full: region.get(offset_of!(HeaderLayout, not_full)),
                not_empty: region.get(offset_of!(HeaderLayout, not_empty)),
                generation: region.get(offset_of!(HeaderLayout, generation)),
                used: region.get(offset_of!(HeaderLayout, used)),
            }
        }
    }

    /// Bytes available for one chunk.
    #[inline]
    pub fn data_capacity(&self) -> usize {
        self.region.len() - TRANSFER_OVERHEAD
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: TRANSFER_OVERHEAD < len, checked at construction.
        unsafe { self.region.offset(TRANSFER_OVERHEAD) }
    }

    pub fn generation(&self) -> u8 {
        let header = self.header();
        let _guard = header.lock.lock();
        header.generation.load(Ordering::Relaxed)
    }

    /// Start a new transfer on the consumer side.
    ///
    /// Bumps the generation, discards any stale pending chunk and wakes every
    /// producer parked on "not full" so that stale ones observe the change
    /// and exit.
    pub fn begin_transfer(&self) -> Consumer {
        let header = self.header();
        let guard = header.lock.lock();
        let generation = header.generation.load(Ordering::Relaxed).wrapping_add(1);
        header.generation.store(generation, Ordering::Relaxed);
        header.used.store(0, Ordering::Relaxed);
        header.not_full.notify_all(&guard);
        drop(guard);
        Consumer {
            buffer: *self,
            generation,
            finished: false,
        }
    }

    /// Create the producer for `text`. It binds to whatever generation is
    /// current when it first acquires the lock.
    #[cfg(feature = "alloc")]
    pub fn producer(&self, text: alloc::string::String) -> Producer {
        Producer {
            buffer: *self,
            text,
            offset: 0,
            generation: None,
            finished: false,
        }
    }
}

/// Blocking reader for one transfer.
pub struct Consumer {
    buffer: TransferBuffer,
    generation: u8,
    finished: bool,
}

impl Consumer {
    pub fn generation(&self) -> u8 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Block until the next chunk is available and append it to `out`.
    #[cfg(feature = "alloc")]
    pub fn recv_chunk(&mut self, out: &mut Vec<u8>) -> Result<Chunk, TransferError> {
        if self.finished {
            return Err(TransferError::Finished);
        }
        let header = self.buffer.header();
        let mut guard = header.lock.lock();
        loop {
            let found = header.generation.load(Ordering::Relaxed);
            if found != self.generation {
                self.finished = true;
                return Err(TransferError::Superseded {
                    expected: self.generation,
                    found,
                });
            }
            if header.used.load(Ordering::Relaxed) != 0 {
                break;
            }
            guard = header.not_empty.wait(guard);
        }

        let cell = header.len.load(Ordering::Relaxed);
        let (len, chunk) = decode_len(cell);
        let capacity = self.buffer.data_capacity();
        if len > capacity {
            self.finished = true;
            return Err(TransferError::CorruptLength { cell, capacity });
        }
        // SAFETY: the data area holds `capacity` bytes and we hold the lock.
        let data = unsafe { core::slice::from_raw_parts(self.buffer.data_ptr(), len) };
        out.extend_from_slice(data);
        header.used.fetch_sub(1, Ordering::Relaxed);
        header.not_full.notify_one(&guard);
        drop(guard);

        if chunk.is_last() {
            self.finished = true;
        }
        Ok(chunk)
    }

    /// Read chunks until the last one and return the reassembled bytes.
    ///
    /// `before_chunk` runs (without the lock) ahead of every chunk, which is
    /// where a caller asks the producer side for more.
    #[cfg(feature = "alloc")]
    pub fn recv_all(
        &mut self,
        mut before_chunk: impl FnMut(),
    ) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::new();
        loop {
            before_chunk();
            if self.recv_chunk(&mut out)?.is_last() {
                return Ok(out);
            }
        }
    }
}

/// Cooperative writer for one transfer.
#[cfg(feature = "alloc")]
pub struct Producer {
    buffer: TransferBuffer,
    text: alloc::string::String,
    offset: usize,
    generation: Option<u8>,
    finished: bool,
}

#[cfg(feature = "alloc")]
impl Producer {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The generation this producer bound to, once it has run.
    pub fn generation(&self) -> Option<u8> {
        self.generation
    }

    /// Mark the producer done without writing anything more.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Write the next chunk, suspending while the slot is full.
    #[cfg(feature = "async")]
    pub async fn send_chunk(&mut self) -> Result<Chunk, TransferError> {
        if self.finished {
            return Err(TransferError::Finished);
        }
        let buffer = self.buffer;
        let header = buffer.header();
        let mut guard = header.lock.lock_async().await;
        let expected = *self
            .generation
            .get_or_insert_with(|| header.generation.load(Ordering::Relaxed));
        loop {
            let found = header.generation.load(Ordering::Relaxed);
            if found != expected {
                self.finished = true;
                return Err(TransferError::Superseded { expected, found });
            }
            if header.used.load(Ordering::Relaxed) < CAPACITY {
                break;
            }
            guard = header.not_full.wait_async(guard).await;
        }

        let end = chunk_end(&self.text, self.offset, buffer.data_capacity());
        let bytes = &self.text.as_bytes()[self.offset..end];
        // SAFETY: `bytes.len() <= data_capacity()` and we hold the lock.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.data_ptr(), bytes.len());
        }
        let chunk = if end == self.text.len() {
            Chunk::Last
        } else {
            Chunk::More
        };
        header.len.store(encode_len(bytes.len(), chunk), Ordering::Relaxed);
        header.used.fetch_add(1, Ordering::Relaxed);
        header.not_empty.notify_one(&guard);
        drop(guard);

        self.offset = end;
        if chunk.is_last() {
            self.finished = true;
        }
        Ok(chunk)
    }
}

/// A transfer buffer that owns its (heap) memory and can be cloned across
/// threads.
#[cfg(feature = "alloc")]
#[derive(Clone)]
pub struct SharedTransferBuffer {
    _owner: alloc::sync::Arc<crate::region::HeapRegion>,
    buffer: TransferBuffer,
}

#[cfg(feature = "alloc")]
impl SharedTransferBuffer {
    pub fn new(len: usize) -> Result<Self, TransferError> {
        let owner = alloc::sync::Arc::new(crate::region::HeapRegion::new_zeroed(len));
        // SAFETY: freshly allocated, kept alive by `owner`.
        let buffer = unsafe { TransferBuffer::init(owner.region())? };
        Ok(Self {
            _owner: owner,
            buffer,
        })
    }
}

#[cfg(feature = "alloc")]
impl core::ops::Deref for SharedTransferBuffer {
    type Target = TransferBuffer;

    fn deref(&self) -> &TransferBuffer {
        &self.buffer
    }
}
