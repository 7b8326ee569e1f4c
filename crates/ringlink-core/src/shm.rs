//! POSIX shared memory wrapper

use crate::region::Region;
use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Named shared memory region
///
/// The mapping is released on drop. The name is removed by the first
/// [`SharedMemory::unlink`] call, or on drop if this handle is responsible
/// for it: the creator, or an opener that called [`SharedMemory::unlink_on_drop`].
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
    unlink_on_drop: AtomicBool,
    unlinked: AtomicBool,
}

// Safety: the mapping is process-wide; concurrent access to the bytes is
// coordinated by the ring protocol, not by this handle
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory region
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| Error::SharedMemory(format!("create {}: {}", name, e)))?;

        // Unlinking is tracked here so it can happen before the last mapping goes away
        shmem.set_owner(false);

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
            unlink_on_drop: AtomicBool::new(true),
            unlinked: AtomicBool::new(false),
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(format!("open {}: {}", name, e)))?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
            unlink_on_drop: AtomicBool::new(false),
            unlinked: AtomicBool::new(false),
        })
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Make this handle remove the name when it is dropped
    pub fn unlink_on_drop(&self) {
        self.unlink_on_drop.store(true, Ordering::Release);
    }

    /// Remove the name now; existing mappings stay valid
    ///
    /// Only the first call through this handle reaches the OS.
    pub fn unlink(&self) -> Result<()> {
        if self.unlinked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        nix::sys::mman::shm_unlink(self.name.as_str())
            .map_err(|e| Error::SharedMemory(format!("unlink {}: {}", self.name, e)))
    }

    /// Get a slice view of the shared memory
    ///
    /// # Safety
    ///
    /// No other process or thread may write the region while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.inner.as_ptr(), self.size)
    }
}

// Safety: the mapping lives until `inner` is dropped
unsafe impl Region for SharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if !self.unlink_on_drop.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.unlink() {
            tracing::debug!(error = %e, "shared memory already gone");
        }
    }
}
