use core::ptr::NonNull;

/// A borrowed view of a shared memory region.
///
/// `Region` is just a pointer and a length. It does not own the memory and
/// does not keep it alive: whoever hands one out (an `mmap`, a
/// [`HeapRegion`], a `SharedArrayBuffer`-style host allocation) is
/// responsible for outliving every structure built on top of it.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Build a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the region (or anything attached to it) is used.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: NonNull::new(ptr).unwrap_or(NonNull::dangling()),
            len,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be within the region.
    #[inline]
    pub unsafe fn offset(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// Reference to a `T` stored at `offset`.
    ///
    /// # Safety
    ///
    /// `offset..offset + size_of::<T>()` must be in bounds, suitably aligned
    /// for `T`, and hold an initialized `T`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        unsafe { &*(self.offset(offset) as *const T) }
    }
}

/// Heap-backed, 8-byte aligned, zero-initialized memory that hands out a
/// [`Region`]. Used by tests and by in-process transports.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    words: NonNull<u64>,
    word_count: usize,
    len: usize,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    pub fn new_zeroed(len: usize) -> Self {
        let word_count = len.div_ceil(8);
        let boxed: alloc::boxed::Box<[u64]> = alloc::vec![0u64; word_count].into_boxed_slice();
        let raw = alloc::boxed::Box::into_raw(boxed) as *mut u64;
        Self {
            words: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            word_count,
            len,
        }
    }

    pub fn region(&self) -> Region {
        // SAFETY: the allocation lives as long as `self`.
        unsafe { Region::from_raw(self.words.as_ptr() as *mut u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.words.as_ptr(), self.word_count);
        // SAFETY: produced by `Box::into_raw` in `new_zeroed`.
        drop(unsafe { alloc::boxed::Box::from_raw(slice) });
    }
}
