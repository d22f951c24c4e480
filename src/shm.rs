//! POSIX shared-memory provider.
//!
//! [`ShmRegion`] satisfies the memory-provider contract with a POSIX shared
//! memory object (`shm_open` + `mmap`), so a producer and a consumer in
//! different processes can map the same queue region.
//!
//! Cleanup follows a typestate pattern:
//!
//! - [`Creator`] - creates the object; its release hook unmaps **and
//!   unlinks** the name
//! - [`Opener`] - opens an existing object; its release hook only unmaps,
//!   leaving the name for the creator to remove
//!
//! Either side of the queue may be the creator. A daemon typically creates
//! the region and clients open it:
//!
//! ```no_run
//! use shmring::queue::Queue;
//! use shmring::shm::{Creator, Opener, ShmRegion};
//!
//! // Process A
//! let inbox = Queue::new(ShmRegion::<Creator>::create("/daemon-inbox", 1 << 20)?.into_storage()?);
//!
//! // Process B
//! let outbox = Queue::new(ShmRegion::<Opener>::open("/daemon-inbox")?.into_storage()?);
//! # Ok::<(), shmring::shm::ShmError>(())
//! ```
//!
//! On daemon startup, clean up any object leaked by a crashed predecessor
//! with `rustix::shm::unlink` before creating a fresh one.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{NonNull, null_mut};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

use crate::error::RingError;
use crate::storage::{MIN_REGION_SIZE, Storage};
use crate::trace::debug;

/// Result alias for shared-memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced while creating or opening a shared-memory region.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The POSIX shared-memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `shm_open`, `ftruncate`, `mmap` or `fstat` failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: io::Errno,
    },

    /// The shared-memory object's size does not match the queue header.
    #[error("shared memory `{path}` is {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// The mapped region failed queue validation.
    #[error(transparent)]
    Region(#[from] RingError),
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

/// Cleanup behaviour marker for [`ShmRegion`].
pub trait ShmMode {
    /// Whether the name is unlinked when the region is released.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates the shared-memory object.
/// Release unmaps the region and unlinks the name.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that open an existing object. Release only
/// unmaps; the name persists until the creator removes it.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

const POSIX_NAME_MAX: usize = 255;

/// Checks the portability rules POSIX imposes on `shm_open` names: a leading
/// slash, no further slashes, at most 255 bytes.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }
    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }
    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }
    Ok(())
}

fn unmap(base: NonNull<u8>, size: u64) {
    // SAFETY: base..base+size is a live mapping produced by mmap in this
    // module and not otherwise referenced once release runs.
    unsafe {
        let _ = munmap(base.as_ptr().cast(), size as usize);
    }
}

/// A mapped POSIX shared-memory region, not yet bound to a queue.
///
/// Convert it with `into_storage()`: the creator's region is initialised
/// fresh, the opener's is attached to whatever the creator wrote. Dropping a
/// region without converting it releases the mapping (and, for the creator,
/// the name).
pub struct ShmRegion<M: ShmMode> {
    ptr: NonNull<u8>,
    size: u64,
    path: String,
    _mode: PhantomData<M>,
}

impl<M: ShmMode> std::fmt::Debug for ShmRegion<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("path", &self.path)
            .finish()
    }
}

// SAFETY: the mapping is uniquely owned until handed to Storage and refers to
// shared memory, not thread-local data.
unsafe impl<M: ShmMode> Send for ShmRegion<M> {}

impl<M: ShmMode> ShmRegion<M> {
    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The shared-memory object name.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn into_raw(mut self) -> (NonNull<u8>, u64, String) {
        let path = mem::take(&mut self.path);
        let (ptr, size) = (self.ptr, self.size);
        mem::forget(self);
        (ptr, size, path)
    }

    fn release(base: NonNull<u8>, size: u64, path: &str) {
        unmap(base, size);
        if M::SHOULD_UNLINK {
            let _ = shm::unlink(path);
        }
    }

    fn release_hook(size: u64, path: String) -> crate::storage::ReleaseHook {
        Box::new(move |base| Self::release(base, size, &path))
    }
}

impl ShmRegion<Creator> {
    /// Creates a new shared-memory object of `size` bytes and maps it.
    ///
    /// Fails with `EEXIST` if the name is already taken; a daemon that may
    /// have crashed previously should `shm::unlink` the name first.
    pub fn create(path: &str, size: u64) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(err) = ftruncate(&fd, size) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, err));
        }

        // SAFETY: fresh mapping of a valid fd; mmap returns page-aligned
        // addresses, which satisfies the region's cache-line alignment, and
        // does not alias any existing Rust object.
        let ptr = match unsafe {
            mmap(
                null_mut(),
                size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        } {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        debug!(path, size, "created shared memory region");
        Ok(Self {
            // SAFETY: mmap never returns null on success.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
            size,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }

    /// Initialises a fresh queue header in the region and hands ownership to
    /// the returned [`Storage`]. The storage's release hook unmaps the region
    /// and unlinks the name.
    pub fn into_storage(self) -> Result<Storage> {
        let (ptr, size, path) = self.into_raw();
        // SAFETY: the mapping spans `size` writable bytes at a page-aligned
        // base and nothing else accesses it yet.
        let result = unsafe {
            Storage::open_fresh(ptr.as_ptr(), size, Some(Self::release_hook(size, path.clone())))
        };
        result.map_err(|err| {
            Self::release(ptr, size, &path);
            err.into()
        })
    }
}

impl ShmRegion<Opener> {
    /// Opens and maps an existing shared-memory object, taking its size from
    /// `fstat`.
    pub fn open(path: &str) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", path, err));
            }
        };
        let size = stat.st_size as u64;
        if size < MIN_REGION_SIZE {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: MIN_REGION_SIZE,
                actual: size,
            });
        }

        // SAFETY: mapping an existing object of `size` bytes (fstat above);
        // page-aligned base; no aliasing of local objects.
        let ptr = match unsafe {
            mmap(
                null_mut(),
                size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        } {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        debug!(path, size, "opened shared memory region");
        Ok(Self {
            // SAFETY: mmap never returns null on success.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
            size,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }

    /// Attaches to the queue header the creator initialised and hands
    /// ownership to the returned [`Storage`]. The storage's release hook only
    /// unmaps; the creator owns the name.
    ///
    /// The size recorded in the header must match the mapped size, otherwise
    /// the two sides would disagree about where the ring ends.
    pub fn into_storage(self) -> Result<Storage> {
        let (ptr, size, path) = self.into_raw();
        let result = unsafe {
            // SAFETY: the mapping spans `size` writable bytes at a
            // page-aligned base.
            Storage::attach(ptr.as_ptr(), Some(Self::release_hook(size, path.clone())))
        };
        match result {
            Ok(storage) => {
                let declared = storage.total_size();
                if declared != size {
                    drop(storage); // runs the hook: unmap only
                    return Err(ShmError::SizeMismatch {
                        path,
                        expected: declared,
                        actual: size,
                    });
                }
                Ok(storage)
            }
            Err(err) => {
                Self::release(ptr, size, &path);
                Err(err.into())
            }
        }
    }
}

impl<M: ShmMode> Drop for ShmRegion<M> {
    fn drop(&mut self) {
        Self::release(self.ptr, self.size, &self.path);
    }
}
