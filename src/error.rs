//! Error type for region validation and queue preconditions.

use thiserror::Error;

/// Errors reported when wiring a queue onto a memory region, or when an
/// `enqueue` precondition is violated.
///
/// The construction-time kinds ([`NullPointer`](RingError::NullPointer)
/// through [`AbiMismatch`](RingError::AbiMismatch)) are permanent for the
/// given inputs and leave the region untouched. [`MessageEmpty`]
/// (RingError::MessageEmpty) and [`MessageTooLarge`](RingError::MessageTooLarge)
/// are contract violations on the producer side; they are deliberately
/// distinct from the legitimate "queue full" outcome, which `enqueue` reports
/// as `Ok(false)`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The region pointer is null.
    #[error("region pointer is null")]
    NullPointer,

    /// The region base address is not aligned to a cache line.
    #[error("region base address {addr:#x} is not {align}-byte aligned")]
    MisalignedRegion { addr: usize, align: usize },

    /// The region cannot hold the header plus one minimum frame.
    #[error("region of {size} bytes is too small, need at least {min}")]
    RegionTooSmall { size: u64, min: u64 },

    /// The ring buffer portion of the region is not a multiple of 8 bytes.
    #[error("ring buffer of {size} bytes is not a multiple of 8")]
    BufferNotMultipleOfEight { size: u64 },

    /// The magic field does not match; the region was never initialised as a
    /// queue (or belongs to something else entirely).
    #[error("bad magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    /// The region was initialised with an incompatible on-memory layout
    /// version.
    #[error("layout version {found} is not supported (this build speaks {expected})")]
    AbiMismatch { found: u32, expected: u32 },

    /// Zero-sized messages are reserved for the wrap sentinel and cannot be
    /// enqueued.
    #[error("message payload must not be empty")]
    MessageEmpty,

    /// The message would not fit the ring even if it were completely drained.
    #[error("message of {size} bytes exceeds the maximum payload of {max}")]
    MessageTooLarge { size: u64, max: u64 },
}
