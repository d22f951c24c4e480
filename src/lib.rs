//! Lock-free SPSC variable-sized message queue over a fixed shared region.
//!
//! One producer and one consumer (threads or processes mapping the same
//! memory) exchange byte-string messages through a ring buffer that lives in
//! a contiguous, cache-line-aligned region with a versioned header. The
//! protocol is wait-free on both sides, and the consumer reads every payload
//! in place: [`Queue::dequeue_begin`] borrows a view into the ring,
//! [`Queue::dequeue_commit`] releases it.
//!
//! # Overview
//!
//! - [`Queue`] - the SPSC protocol: `enqueue`, two-phase dequeue, emptiness
//!   and length queries
//! - [`Storage`] - owns the region and its ABI v1 header (see
//!   [`storage`] for the layout table)
//! - [`HeapRegion`] - aligned heap region for single-process queues
//! - [`ShmRegion`](shm::ShmRegion) - POSIX shared memory for cross-process
//!   queues, with creator/opener cleanup typestates
//!
//! # Example
//!
//! ```
//! use shmring::{HeapRegion, Queue};
//!
//! let queue = Queue::new(HeapRegion::allocate(1024)?.into_storage()?);
//!
//! assert!(queue.enqueue(b"hello")?);
//!
//! let view = queue.dequeue_begin();
//! assert_eq!(view.payload(), b"hello");
//! queue.dequeue_commit(view);
//!
//! assert!(queue.is_empty());
//! # Ok::<(), shmring::RingError>(())
//! ```
//!
//! # Concurrency contract
//!
//! Exactly one producer and exactly one consumer, enforced at compile time
//! within a process by [`Queue::split`] and by documented contract across
//! processes. Violating it yields undefined queue state. No operation blocks,
//! and "full" / "empty" are ordinary return values, never errors.

pub mod error;
pub mod queue;
pub mod region;
pub mod shm;
pub mod storage;
pub mod trace;

pub use error::RingError;
pub use queue::{Consumer, MessageView, Producer, Queue};
pub use region::HeapRegion;
pub use storage::{ABI_VERSION, MAGIC, Storage};
