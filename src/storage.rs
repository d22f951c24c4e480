//! Versioned on-memory layout and the [`Storage`] handle that owns a region.
//!
//! A queue lives in a single contiguous byte region whose base address is
//! 64-byte aligned. The first 256 bytes form a fixed header; everything after
//! it is the ring buffer. The layout is plain old data, with no pointers ever
//! persisted into the region, so it can be mapped by several processes at
//! different virtual addresses.
//!
//! # Memory layout (ABI v1)
//!
//! ```text
//! Offset   Size   Field
//! ┌──────────────────────────────────────────┐
//! │ 0        4     magic        (0x53505343) │
//! │ 4        4     abi_version  (1)          │
//! │ 8        8     storage_size (total T)    │
//! │ 16       48    reserved                  │
//! ├──────────────────────────────────────────┤
//! │ 64       8+56  read_ix   (own cache line)│
//! │ 128      8+56  write_ix  (own cache line)│
//! │ 192      8+56  msg_count (own cache line)│
//! ├──────────────────────────────────────────┤
//! │ 256      T-256 ring buffer               │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Each index cell sits alone on its own cache line so the producer and
//! consumer hot paths never share one. Integer fields are host-endian and
//! naturally aligned; a region is portable between processes on the same
//! machine, not between architectures of different endianness.
//!
//! [`Storage`] does not allocate or map memory itself. A memory provider
//! ([`HeapRegion`](crate::region::HeapRegion),
//! [`ShmRegion`](crate::shm::ShmRegion)) hands it a region together with a
//! release hook, and the hook runs exactly once when the `Storage` is dropped.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RingError;
use crate::trace::{debug, warn};

/// Identifies a region as a queue: `"SPSC"` in ASCII.
pub const MAGIC: u32 = 0x5350_5343;

/// On-memory layout version written by this build. Bumped on any layout
/// change; attach refuses anything else.
pub const ABI_VERSION: u32 = 1;

/// Cache line size on supported targets.
pub const CACHE_LINE: usize = 64;

/// Byte offset of the ring buffer within the region; also the header size.
pub const BUFFER_OFFSET: u64 = 256;

/// Bytes of the per-message size header inside the ring.
pub const FRAME_HEADER_SIZE: u64 = 8;

/// Smallest frame the ring can hold: the 8-byte size header plus one payload
/// byte, padded to the next multiple of 8.
pub const MIN_FRAME_SIZE: u64 = 16;

/// Smallest admissible region: header plus one minimum frame.
pub const MIN_REGION_SIZE: u64 = BUFFER_OFFSET + MIN_FRAME_SIZE;

/// Release hook invoked with the region base pointer when a [`Storage`] is
/// dropped. Providers capture whatever they need (layout, mapping length,
/// object name) in the closure.
pub type ReleaseHook = Box<dyn FnOnce(NonNull<u8>) + Send>;

/// One shared index on its own cache line.
///
/// The alignment pads the cell to a full 64 bytes, keeping the neighbouring
/// cells out of the same line.
#[repr(C, align(64))]
struct IndexCell(AtomicU64);

/// The fixed region header, ABI v1.
///
/// Field offsets are binding (see the module docs) and asserted by the layout
/// tests below.
#[repr(C)]
struct RegionHeader {
    magic: u32,
    abi_version: u32,
    storage_size: u64,
    _reserved: [u8; 48],
    read_ix: IndexCell,
    write_ix: IndexCell,
    msg_count: IndexCell,
}

/// Owning handle to one queue region.
///
/// A `Storage` is either opened *fresh* (the header is written and the index
/// cells zeroed) or *attached* to a region some other process already
/// initialised (the header is verified, the cells are left untouched). On
/// drop it invokes the provider's release hook exactly once and never reads
/// the header afterwards.
pub struct Storage {
    header: NonNull<RegionHeader>,
    total_size: u64,
    release: Option<ReleaseHook>,
}

// SAFETY: the header cells are atomics and the buffer is only touched through
// the SPSC protocol in `queue`, which orders its accesses via those atomics.
// The raw pointer refers to a mapping that stays valid for the lifetime of
// the Storage, not to thread-local data.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

/// Checks the size constraints a fresh region must satisfy.
pub(crate) fn validate_layout(total_size: u64) -> Result<(), RingError> {
    if total_size < MIN_REGION_SIZE {
        return Err(RingError::RegionTooSmall {
            size: total_size,
            min: MIN_REGION_SIZE,
        });
    }
    let buffer_size = total_size - BUFFER_OFFSET;
    if buffer_size % 8 != 0 {
        return Err(RingError::BufferNotMultipleOfEight { size: buffer_size });
    }
    Ok(())
}

fn validate_base(region: *mut u8) -> Result<NonNull<RegionHeader>, RingError> {
    let Some(base) = NonNull::new(region) else {
        return Err(RingError::NullPointer);
    };
    let addr = base.as_ptr() as usize;
    if addr % CACHE_LINE != 0 {
        return Err(RingError::MisalignedRegion {
            addr,
            align: CACHE_LINE,
        });
    }
    Ok(base.cast())
}

impl Storage {
    /// Initialises a fresh region and takes ownership of it.
    ///
    /// Writes the magic, layout version and total size, then zeroes the three
    /// index cells with release ordering so that a peer attaching afterwards
    /// observes a fully initialised header.
    ///
    /// On error the release hook is **not** invoked; the caller keeps
    /// ownership of the region.
    ///
    /// # Errors
    ///
    /// [`RingError::NullPointer`], [`RingError::MisalignedRegion`],
    /// [`RingError::RegionTooSmall`] or
    /// [`RingError::BufferNotMultipleOfEight`].
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes of `total_size` bytes for
    /// the whole lifetime of the returned `Storage`, and nothing else may
    /// access the region during this call.
    pub unsafe fn open_fresh(
        region: *mut u8,
        total_size: u64,
        release: Option<ReleaseHook>,
    ) -> Result<Self, RingError> {
        let header = validate_base(region)?;
        validate_layout(total_size)?;

        // SAFETY: the base is non-null, 64-byte aligned and spans at least
        // MIN_REGION_SIZE bytes (caller contract + checks above). Fields are
        // written through addr_of_mut! so no reference to potentially
        // uninitialised memory is formed.
        unsafe {
            let raw = header.as_ptr();
            ptr::addr_of_mut!((*raw).magic).write(MAGIC);
            ptr::addr_of_mut!((*raw).abi_version).write(ABI_VERSION);
            ptr::addr_of_mut!((*raw).storage_size).write(total_size);
        }

        // Zero the index cells. An AtomicU64 reference into the raw region is
        // valid for any byte content, and the release stores publish the
        // header writes above to a peer that attaches and acquire-loads them.
        let storage = Self {
            header,
            total_size,
            release,
        };
        storage.read_ix().store(0, Ordering::Release);
        storage.write_ix().store(0, Ordering::Release);
        storage.msg_count().store(0, Ordering::Release);

        debug!(total_size, "initialised fresh queue region");
        Ok(storage)
    }

    /// Attaches to a region another process (or an earlier incarnation of
    /// this one) already initialised.
    ///
    /// Verifies the magic and the layout version and reads the total size
    /// from the header. The index cells are left untouched, so in-flight
    /// messages survive an attach.
    ///
    /// On error the release hook is **not** invoked; the caller keeps
    /// ownership of the region.
    ///
    /// # Errors
    ///
    /// [`RingError::NullPointer`], [`RingError::MisalignedRegion`],
    /// [`RingError::BadMagic`] or [`RingError::AbiMismatch`].
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes of the region's full size
    /// (as recorded in its header) for the whole lifetime of the returned
    /// `Storage`.
    pub unsafe fn attach(
        region: *mut u8,
        release: Option<ReleaseHook>,
    ) -> Result<Self, RingError> {
        let header = validate_base(region)?;

        // SAFETY: base validated above; plain reads of the immutable header
        // fields, performed before any reference to the header is formed.
        let (magic, abi_version, total_size) = unsafe {
            let raw = header.as_ptr();
            (
                ptr::addr_of!((*raw).magic).read(),
                ptr::addr_of!((*raw).abi_version).read(),
                ptr::addr_of!((*raw).storage_size).read(),
            )
        };

        if magic != MAGIC {
            warn!(found = magic, "attach refused: bad magic");
            return Err(RingError::BadMagic {
                found: magic,
                expected: MAGIC,
            });
        }
        if abi_version != ABI_VERSION {
            warn!(found = abi_version, "attach refused: layout version mismatch");
            return Err(RingError::AbiMismatch {
                found: abi_version,
                expected: ABI_VERSION,
            });
        }

        debug!(total_size, "attached to queue region");
        Ok(Self {
            header,
            total_size,
            release,
        })
    }

    /// Total size of the region in bytes, header included.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Size of the ring buffer in bytes.
    #[inline]
    pub fn buffer_size(&self) -> u64 {
        self.total_size - BUFFER_OFFSET
    }

    /// Base pointer of the ring buffer (`region + 256`).
    #[inline]
    pub fn buffer_ptr(&self) -> *mut u8 {
        // SAFETY: the region spans at least MIN_REGION_SIZE bytes, so the
        // buffer start is in bounds.
        unsafe { self.header.as_ptr().cast::<u8>().add(BUFFER_OFFSET as usize) }
    }

    /// The consumer's next-read byte offset within the buffer.
    #[inline]
    pub fn read_ix(&self) -> &AtomicU64 {
        &self.header().read_ix.0
    }

    /// The producer's next-write byte offset within the buffer.
    #[inline]
    pub fn write_ix(&self) -> &AtomicU64 {
        &self.header().write_ix.0
    }

    /// In-flight message count, updated by both sides.
    #[inline]
    pub fn msg_count(&self) -> &AtomicU64 {
        &self.header().msg_count.0
    }

    /// The magic value stored in the header.
    pub fn magic(&self) -> u32 {
        self.header().magic
    }

    /// The layout version stored in the header.
    pub fn abi_version(&self) -> u32 {
        self.header().abi_version
    }

    #[inline]
    fn header(&self) -> &RegionHeader {
        // SAFETY: the header pointer is valid and aligned for the lifetime of
        // self; the immutable fields were initialised before construction and
        // the cells are atomics.
        unsafe { self.header.as_ref() }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.header.cast());
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("total_size", &self.total_size)
            .field("buffer_size", &self.buffer_size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{self, Layout};
    use std::mem::{align_of, offset_of, size_of};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// Cache-line-aligned scratch region for tests.
    struct AlignedBuf {
        ptr: *mut u8,
        layout: Layout,
    }

    impl AlignedBuf {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, CACHE_LINE).unwrap();
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }
    }

    impl Drop for AlignedBuf {
        fn drop(&mut self) {
            unsafe { alloc::dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn header_layout_matches_abi_table() {
        assert_eq!(offset_of!(RegionHeader, magic), 0);
        assert_eq!(offset_of!(RegionHeader, abi_version), 4);
        assert_eq!(offset_of!(RegionHeader, storage_size), 8);
        assert_eq!(offset_of!(RegionHeader, read_ix), 64);
        assert_eq!(offset_of!(RegionHeader, write_ix), 128);
        assert_eq!(offset_of!(RegionHeader, msg_count), 192);
        assert_eq!(size_of::<RegionHeader>(), BUFFER_OFFSET as usize);
    }

    #[test]
    fn index_cells_fill_a_cache_line() {
        assert_eq!(align_of::<IndexCell>(), CACHE_LINE);
        assert_eq!(size_of::<IndexCell>(), CACHE_LINE);
    }

    #[test]
    fn open_fresh_rejects_null() {
        let err = unsafe { Storage::open_fresh(ptr::null_mut(), 1024, None) }.unwrap_err();
        assert_eq!(err, RingError::NullPointer);
    }

    #[test]
    fn open_fresh_rejects_misaligned_base() {
        let buf = AlignedBuf::new(2048);
        let skewed = unsafe { buf.ptr.add(8) };
        let err = unsafe { Storage::open_fresh(skewed, 1024, None) }.unwrap_err();
        assert!(matches!(err, RingError::MisalignedRegion { align: 64, .. }));
    }

    #[test]
    fn open_fresh_rejects_undersized_region() {
        let buf = AlignedBuf::new(1024);
        let err = unsafe { Storage::open_fresh(buf.ptr, 256, None) }.unwrap_err();
        assert_eq!(
            err,
            RingError::RegionTooSmall {
                size: 256,
                min: MIN_REGION_SIZE
            }
        );
    }

    #[test]
    fn open_fresh_rejects_unaligned_buffer_size() {
        let buf = AlignedBuf::new(1024);
        // 276 - 256 = 20 bytes of buffer, not a multiple of 8.
        let err = unsafe { Storage::open_fresh(buf.ptr, 276, None) }.unwrap_err();
        assert_eq!(err, RingError::BufferNotMultipleOfEight { size: 20 });
    }

    #[test]
    fn open_fresh_writes_header_and_zeroes_cells() {
        let buf = AlignedBuf::new(1024);
        let storage = unsafe { Storage::open_fresh(buf.ptr, 1024, None) }.unwrap();
        assert_eq!(storage.magic(), MAGIC);
        assert_eq!(storage.abi_version(), ABI_VERSION);
        assert_eq!(storage.total_size(), 1024);
        assert_eq!(storage.buffer_size(), 768);
        assert_eq!(storage.read_ix().load(Ordering::Acquire), 0);
        assert_eq!(storage.write_ix().load(Ordering::Acquire), 0);
        assert_eq!(storage.msg_count().load(Ordering::Acquire), 0);
    }

    #[test]
    fn attach_sees_what_open_fresh_wrote() {
        let buf = AlignedBuf::new(1024);
        let fresh = unsafe { Storage::open_fresh(buf.ptr, 1024, None) }.unwrap();
        fresh.write_ix().store(48, Ordering::Release);
        drop(fresh);

        let attached = unsafe { Storage::attach(buf.ptr, None) }.unwrap();
        assert_eq!(attached.total_size(), 1024);
        // Attach must not touch the index cells.
        assert_eq!(attached.write_ix().load(Ordering::Acquire), 48);
    }

    #[test]
    fn attach_rejects_foreign_magic() {
        let buf = AlignedBuf::new(1024);
        unsafe { buf.ptr.cast::<u32>().write(0xDEAD_BEEF) };
        let err = unsafe { Storage::attach(buf.ptr, None) }.unwrap_err();
        assert_eq!(
            err,
            RingError::BadMagic {
                found: 0xDEAD_BEEF,
                expected: MAGIC
            }
        );
    }

    #[test]
    fn attach_rejects_unknown_abi_version() {
        let buf = AlignedBuf::new(1024);
        drop(unsafe { Storage::open_fresh(buf.ptr, 1024, None) }.unwrap());
        unsafe { buf.ptr.add(4).cast::<u32>().write(2) };
        let err = unsafe { Storage::attach(buf.ptr, None) }.unwrap_err();
        assert_eq!(
            err,
            RingError::AbiMismatch {
                found: 2,
                expected: ABI_VERSION
            }
        );
    }

    #[test]
    fn release_hook_runs_exactly_once_on_drop() {
        let buf = AlignedBuf::new(1024);
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        let storage = unsafe {
            Storage::open_fresh(
                buf.ptr,
                1024,
                Some(Box::new(move |_base| {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                })),
            )
        }
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(storage);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_hook_not_invoked_on_construction_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        let err = unsafe {
            Storage::open_fresh(
                ptr::null_mut(),
                1024,
                Some(Box::new(move |_base| {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                })),
            )
        }
        .unwrap_err();
        assert_eq!(err, RingError::NullPointer);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
