//! Heap-backed memory provider.
//!
//! [`HeapRegion`] satisfies the memory-provider contract with a plain
//! allocation: a zeroed, cache-line-aligned block whose release hook
//! deallocates it. It is the natural backing for single-process use, tests
//! and benchmarks; cross-process queues use
//! [`ShmRegion`](crate::shm::ShmRegion) instead.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::NonNull;

use crate::error::RingError;
use crate::storage::{self, CACHE_LINE, Storage};

/// A freshly allocated, 64-byte-aligned, zeroed region.
///
/// Either convert it into a [`Storage`] with [`into_storage`]
/// (HeapRegion::into_storage), which transfers ownership together with a
/// deallocating release hook, or drop it to free the block.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is uniquely owned until handed to Storage; the pointer
// refers to a heap block, not thread-local data.
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    /// Allocates a region of `total_size` bytes.
    ///
    /// # Errors
    ///
    /// [`RingError::RegionTooSmall`] or
    /// [`RingError::BufferNotMultipleOfEight`] if `total_size` cannot hold a
    /// valid queue.
    pub fn allocate(total_size: u64) -> Result<Self, RingError> {
        storage::validate_layout(total_size)?;
        let layout = Layout::from_size_align(total_size as usize, CACHE_LINE)
            .expect("validated region size fits a Layout");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        Ok(Self { ptr, layout })
    }

    /// Base pointer of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    /// Initialises a queue header in the region and hands ownership to the
    /// returned [`Storage`], whose release hook deallocates the block.
    pub fn into_storage(self) -> Result<Storage, RingError> {
        let ptr = self.ptr;
        let layout = self.layout;
        mem::forget(self);
        // SAFETY: freshly allocated above: non-null, cache-line aligned,
        // `layout.size()` writable bytes, not aliased.
        let result = unsafe {
            Storage::open_fresh(
                ptr.as_ptr(),
                layout.size() as u64,
                Some(Box::new(move |base: NonNull<u8>| {
                    // SAFETY: base is the block allocated with `layout`.
                    unsafe { alloc::dealloc(base.as_ptr(), layout) };
                })),
            )
        };
        match result {
            Ok(storage) => Ok(storage),
            Err(err) => {
                // On error the hook was not invoked; free the block here.
                // SAFETY: ownership was never transferred.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                Err(err)
            }
        }
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with `self.layout`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
