//! Memory-mapped slot storage for the ring buffer
//!
//! Slots live in an anonymous, page-aligned mapping instead of the global
//! heap:
//! - Allocation is fallible and reported as `io::Error`, never aborts
//! - Storage is contiguous, so slot `i` is a plain pointer offset
//! - The mapping is released in one `munmap` when the storage drops

use memmap2::{MmapMut, MmapOptions};
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;

/// Fixed array of `capacity` uninitialized `T` slots backed by anonymous mmap.
///
/// The storage does not track which slots hold a value; that is the
/// ring buffer's job. Dropping the storage never drops slot contents.
pub struct SlotStorage<T> {
    // Kept alive for `base`; never accessed through a reference.
    _mmap: MmapMut,
    base: NonNull<MaybeUninit<T>>,
    capacity: usize,
}

// SAFETY: SlotStorage is a raw container; synchronization of slot access
// is provided by the ring buffer cursors.
unsafe impl<T: Send> Send for SlotStorage<T> {}
unsafe impl<T: Send> Sync for SlotStorage<T> {}

impl<T> SlotStorage<T> {
    /// Map storage for `capacity` slots.
    pub fn allocate(capacity: usize) -> io::Result<Self> {
        if mem::align_of::<T>() > page_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "slot alignment exceeds page size",
            ));
        }

        let bytes = capacity
            .checked_mul(mem::size_of::<T>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "slot storage overflow"))?;

        // Zero-sized mappings are rejected by the kernel
        let mut mmap = MmapOptions::new().len(bytes.max(1)).map_anon()?;

        let base = NonNull::new(mmap.as_mut_ptr() as *mut MaybeUninit<T>)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "null mapping"))?;

        Ok(Self {
            _mmap: mmap,
            base,
            capacity,
        })
    }

    /// Raw pointer to slot `idx`. `idx` must be below capacity.
    #[inline(always)]
    pub fn slot(&self, idx: usize) -> *mut MaybeUninit<T> {
        debug_assert!(idx < self.capacity);
        // SAFETY: idx < capacity, within the mapping
        unsafe { self.base.as_ptr().add(idx) }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes reserved for slots.
    pub fn bytes(&self) -> usize {
        self.capacity * mem::size_of::<T>()
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}
