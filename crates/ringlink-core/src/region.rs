//! Memory regions that can back ring channels

use crate::{Error, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Alignment every region must provide (one cache line)
pub const REGION_ALIGN: usize = 64;

/// A contiguous block of bytes shared between the two ends of a channel
///
/// # Safety
///
/// `as_ptr()` must stay valid for reads and writes of `len()` bytes for as
/// long as the region is alive, and must always return the same address.
/// The bytes are mutated through that pointer while `&self` is shared, so
/// implementors must not hand out Rust references to the same memory.
pub unsafe trait Region: Send + Sync {
    /// Base address of the region
    fn as_ptr(&self) -> *mut u8;

    /// Size in bytes
    fn len(&self) -> usize;

    /// Whether the region has no bytes at all
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zero-initialized, cache-line aligned heap allocation
///
/// Lets both ends of a ring live in one process, e.g. between threads.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapRegion {
    /// Allocate a new zeroed region
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Layout("region size must be non-zero".to_string()));
        }
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|e| Error::Layout(e.to_string()))?;

        // Safety: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("failed to allocate {} bytes", size),
            ))
        })?;

        Ok(Self { ptr, layout })
    }
}

// Safety: the allocation is owned by this value and never moves or shrinks
unsafe impl Region for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

// Safety: access to the bytes is coordinated by the ring protocol
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
