//! Lock-free SPSC queue protocol over a [`Storage`] region.
//!
//! # Overview
//!
//! - [`Queue`] - the protocol bound to one region; all mutable state lives in
//!   the region's shared index cells
//! - [`MessageView`] - borrowed, zero-copy view of the frame at the head of
//!   the queue
//! - [`Producer`] / [`Consumer`] - `Send + !Sync` role handles from
//!   [`Queue::split`] that pin each side of the contract to one thread
//!
//! Messages are byte strings. The producer writes each one as a *frame*
//! `[size: u64][payload][pad to 8]` at `write_ix` and publishes the new index
//! with a release store; the consumer observes it via an acquire load, reads
//! the payload in place, and only then commits the advance of `read_ix`. A
//! frame header of `size == 0` is the *wrap sentinel*: it tells the consumer
//! the next frame starts back at offset 0.
//!
//! # The empty/full distinction
//!
//! `read_ix == write_ix` always means empty. The producer refuses any write
//! that would land `write_ix` on `read_ix`, and no single frame may exceed
//! half the buffer ([`Queue::max_message_size`]), so a full ring is never
//! mistaken for an empty one.
//!
//! # Concurrency contract
//!
//! Exactly one thread (or process) enqueues and exactly one dequeues.
//! [`Queue::split`] enforces this at compile time within a process; across
//! processes it is a documented contract, as the type system cannot see the
//! peer mapping. All operations return immediately; nothing blocks, spins on
//! the peer, or retries internally.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;
use std::slice;
use std::sync::atomic::Ordering;

use crate::error::RingError;
use crate::storage::{FRAME_HEADER_SIZE, Storage};

/// Rounds `current + span` up to the next multiple of 8.
///
/// Every frame occupies `next_index(ix, 8 + payload) - ix` bytes, which keeps
/// both ring indices 8-byte aligned at all times.
#[inline]
const fn next_index(current: u64, span: u64) -> u64 {
    (current + span + 7) & !7
}

/// The SPSC queue protocol bound to one [`Storage`].
///
/// The object itself is stateless apart from constants derived from the
/// region size; it can be shared freely (`&Queue` from both threads) as long
/// as the SPSC contract holds. See [`Queue::split`] for handles that make the
/// contract a compile-time fact.
pub struct Queue {
    storage: Storage,
    buffer: *mut u8,
    buffer_size: u64,
    max_message_size: u64,
}

// SAFETY: the buffer pointer refers to the mapping owned by `storage`, which
// outlives the queue. Shared access is mediated by the index-cell atomics:
// every byte of the ring is owned by exactly one side at any moment, and
// ownership transfers only through release/acquire pairs on the cells.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    /// Binds the protocol to a storage region.
    pub fn new(storage: Storage) -> Self {
        let buffer = storage.buffer_ptr();
        let buffer_size = storage.buffer_size();
        Self {
            storage,
            buffer,
            buffer_size,
            max_message_size: buffer_size / 2,
        }
    }

    /// The underlying storage region.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Size of the ring buffer in bytes.
    #[inline]
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Largest frame (header + payload + padding) a single message may
    /// occupy: half the buffer, so that one frame can never wrap `write_ix`
    /// exactly onto `read_ix` and masquerade as empty.
    #[inline]
    pub fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    /// Largest payload accepted by [`enqueue`](Queue::enqueue).
    #[inline]
    pub fn max_payload_size(&self) -> u64 {
        self.max_message_size - FRAME_HEADER_SIZE
    }

    /// Appends a message to the ring. Producer-only.
    ///
    /// Returns `Ok(true)` once the frame is fully published, `Ok(false)` if
    /// the ring has no room, a legitimate runtime outcome the caller decides
    /// policy on. A failed enqueue makes no observable modification to the
    /// ring.
    ///
    /// # Errors
    ///
    /// [`RingError::MessageEmpty`] for a zero-sized payload (the size 0 is
    /// reserved for the wrap sentinel) and [`RingError::MessageTooLarge`] for
    /// one exceeding [`max_payload_size`](Queue::max_payload_size). Both are
    /// contract violations, reported distinctly from "full".
    pub fn enqueue(&self, msg: &[u8]) -> Result<bool, RingError> {
        let size = msg.len() as u64;
        if size == 0 {
            return Err(RingError::MessageEmpty);
        }
        if size > self.max_payload_size() {
            return Err(RingError::MessageTooLarge {
                size,
                max: self.max_payload_size(),
            });
        }

        // The producer owns write_ix (relaxed); the acquire on read_ix pairs
        // with the consumer's release in dequeue_commit, making the slots it
        // freed safe to reuse.
        let read_ix = self.storage.read_ix().load(Ordering::Acquire);
        let write_ix = self.storage.write_ix().load(Ordering::Relaxed);

        let total = FRAME_HEADER_SIZE + size;
        let next_w = next_index(write_ix, total);

        if next_w < self.buffer_size {
            // The frame fits without crossing the buffer end. If the producer
            // sits before the consumer in linear order, it must not run into
            // it; landing exactly on read_ix is refused too, keeping
            // write_ix != read_ix after every successful enqueue.
            if write_ix < read_ix && next_w >= read_ix {
                return Ok(false);
            }
            // SAFETY: [write_ix, next_w) is producer-owned: it lies outside
            // [read_ix, write_ix) and inside the buffer.
            unsafe { self.write_frame(write_ix, msg) };
            self.storage.write_ix().store(next_w, Ordering::Release);
        } else {
            // The frame would cross the buffer end: place it at offset 0 and
            // leave a sentinel at the old write_ix. A producer that already
            // wrapped (write_ix < read_ix) has its free space end at read_ix
            // while offset 0 still holds unread frames, so it cannot wrap
            // again; the 8-byte sentinel slot would overtake the consumer in
            // that state as well.
            if write_ix < read_ix {
                return Ok(false);
            }
            let next_w = next_index(0, total);
            if next_w >= read_ix {
                return Ok(false);
            }
            // SAFETY: [0, next_w) and the sentinel slot [write_ix,
            // write_ix + 8) are producer-owned per the checks above. The
            // sentinel is stored only after the wrapped frame is complete, so
            // a consumer that observes it always finds a valid frame at 0.
            unsafe {
                self.write_frame(0, msg);
                self.buffer.add(write_ix as usize).cast::<u64>().write(0);
            }
            self.storage.write_ix().store(next_w, Ordering::Release);
        }

        self.storage.msg_count().fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Writes `[payload][size header]` for a frame starting at offset `at`.
    ///
    /// Plain stores; the release publish of `write_ix` is the synchronisation
    /// point that makes them visible to the consumer.
    ///
    /// # Safety
    ///
    /// `[at, at + 8 + msg.len())` must lie within the producer-owned part of
    /// the ring.
    #[inline]
    unsafe fn write_frame(&self, at: u64, msg: &[u8]) {
        unsafe {
            let frame = self.buffer.add(at as usize);
            ptr::copy_nonoverlapping(
                msg.as_ptr(),
                frame.add(FRAME_HEADER_SIZE as usize),
                msg.len(),
            );
            frame.cast::<u64>().write(msg.len() as u64);
        }
    }

    /// Observes the frame at the head of the queue without consuming it.
    /// Consumer-only.
    ///
    /// Returns an [empty view](MessageView::is_empty) iff the queue is empty.
    /// Otherwise the view's payload points directly into the ring and stays
    /// valid until the matching [`dequeue_commit`](Queue::dequeue_commit);
    /// calling `dequeue_begin` again before committing returns a view of the
    /// same frame.
    ///
    /// A wrap sentinel is skipped transparently: the consumer advances its
    /// own index to 0 and looks again, so the loop terminates within one
    /// extra iteration regardless of what the producer does.
    pub fn dequeue_begin(&self) -> MessageView<'_> {
        loop {
            let read_ix = self.storage.read_ix().load(Ordering::Relaxed);
            let write_ix = self.storage.write_ix().load(Ordering::Acquire);
            if read_ix == write_ix {
                return MessageView::empty();
            }

            // SAFETY: read_ix != write_ix, so a frame header exists at
            // read_ix; the acquire load of write_ix synchronises with the
            // producer's release publish, making the frame bytes visible.
            let size = unsafe { self.buffer.add(read_ix as usize).cast::<u64>().read() };
            if size == 0 {
                // Wrap sentinel: the next frame starts at offset 0.
                self.storage.read_ix().store(0, Ordering::Release);
                continue;
            }

            return MessageView {
                size,
                data: unsafe {
                    self.buffer
                        .add(read_ix as usize + FRAME_HEADER_SIZE as usize)
                },
                index: read_ix,
                _queue: PhantomData,
            };
        }
    }

    /// Releases the frame behind `view` back to the producer. Consumer-only.
    ///
    /// The release store of `read_ix` is what hands the frame's bytes back;
    /// the caller must be done with the payload before committing. Committing
    /// an empty view is a no-op.
    pub fn dequeue_commit(&self, view: MessageView<'_>) {
        debug_assert!(!view.is_empty(), "committing an empty view");
        if view.is_empty() {
            return;
        }
        let next_r = next_index(view.index, view.size + FRAME_HEADER_SIZE);
        self.storage.read_ix().store(next_r, Ordering::Release);
        self.storage.msg_count().fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether a message is ready to dequeue. Consumer-only (it relies on
    /// owning `read_ix`).
    #[inline]
    pub fn can_dequeue(&self) -> bool {
        let read_ix = self.storage.read_ix().load(Ordering::Relaxed);
        let write_ix = self.storage.write_ix().load(Ordering::Acquire);
        read_ix != write_ix
    }

    /// Best-effort emptiness snapshot, callable from either side.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let read_ix = self.storage.read_ix().load(Ordering::Acquire);
        let write_ix = self.storage.write_ix().load(Ordering::Acquire);
        read_ix == write_ix
    }

    /// Number of in-flight messages.
    ///
    /// The count is advisory under concurrency: read from the consumer it is
    /// a lower bound (the producer may have enqueued more since), read from
    /// the producer an upper bound (the consumer may have committed more).
    /// After a single-threaded sequence has quiesced it is exact.
    #[inline]
    pub fn len(&self) -> u64 {
        self.storage.msg_count().load(Ordering::Acquire)
    }

    /// Splits the queue into its two role handles.
    ///
    /// Each handle is `Send` but not `Sync`: it can be moved to the thread
    /// that plays the role, but `&Producer`/`&Consumer` cannot be shared, so
    /// no second thread can call into the same side.
    pub fn split(&self) -> (Producer<'_>, Consumer<'_>) {
        (
            Producer {
                queue: self,
                _unsync: PhantomData,
            },
            Consumer {
                queue: self,
                _unsync: PhantomData,
            },
        )
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("buffer_size", &self.buffer_size)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

/// Borrowed view of the frame at the head of the queue.
///
/// An empty view (`size == 0`, null data) signals that the queue was empty at
/// observation. A non-empty view's payload aliases the ring and is valid
/// until the view is passed to [`Queue::dequeue_commit`].
pub struct MessageView<'a> {
    size: u64,
    data: *const u8,
    index: u64,
    _queue: PhantomData<&'a Queue>,
}

impl<'a> MessageView<'a> {
    fn empty() -> Self {
        Self {
            size: 0,
            data: ptr::null(),
            index: 0,
            _queue: PhantomData,
        }
    }

    /// True iff the queue held no message when this view was taken.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Payload length in bytes; 0 for an empty view.
    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Byte offset of the frame within the ring buffer.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The message bytes, in place in the ring. Empty slice for an empty
    /// view.
    ///
    /// The slice borrows the view, so it cannot outlive the commit that
    /// returns the frame to the producer.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.data.is_null() {
            &[]
        } else {
            // SAFETY: data points at `size` payload bytes inside the ring,
            // which stay consumer-owned while this view exists; committing
            // consumes the view and with it every borrow of the slice.
            unsafe { slice::from_raw_parts(self.data, self.size as usize) }
        }
    }
}

impl std::fmt::Debug for MessageView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageView")
            .field("size", &self.size)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Marker type to opt out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the queue. Exactly one of these may be live per queue.
pub struct Producer<'a> {
    queue: &'a Queue,
    _unsync: PhantomUnsync,
}

impl Producer<'_> {
    /// See [`Queue::enqueue`].
    #[inline]
    pub fn enqueue(&self, msg: &[u8]) -> Result<bool, RingError> {
        self.queue.enqueue(msg)
    }

    /// See [`Queue::len`]; from this side the count is an upper bound.
    #[inline]
    pub fn len(&self) -> u64 {
        self.queue.len()
    }

    /// See [`Queue::is_empty`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Read end of the queue. Exactly one of these may be live per queue.
pub struct Consumer<'a> {
    queue: &'a Queue,
    _unsync: PhantomUnsync,
}

impl<'a> Consumer<'a> {
    /// See [`Queue::dequeue_begin`].
    #[inline]
    pub fn dequeue_begin(&self) -> MessageView<'a> {
        self.queue.dequeue_begin()
    }

    /// See [`Queue::dequeue_commit`].
    #[inline]
    pub fn dequeue_commit(&self, view: MessageView<'a>) {
        self.queue.dequeue_commit(view)
    }

    /// See [`Queue::can_dequeue`].
    #[inline]
    pub fn can_dequeue(&self) -> bool {
        self.queue.can_dequeue()
    }

    /// See [`Queue::len`]; from this side the count is a lower bound.
    #[inline]
    pub fn len(&self) -> u64 {
        self.queue.len()
    }

    /// See [`Queue::is_empty`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::hint;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn queue_with(total_size: u64) -> Queue {
        Queue::new(
            HeapRegion::allocate(total_size)
                .unwrap()
                .into_storage()
                .unwrap(),
        )
    }

    fn read_ix(queue: &Queue) -> u64 {
        queue.storage().read_ix().load(Ordering::Acquire)
    }

    fn write_ix(queue: &Queue) -> u64 {
        queue.storage().write_ix().load(Ordering::Acquire)
    }

    #[test]
    fn next_index_rounds_up_to_eight() {
        assert_eq!(next_index(0, 13), 16);
        assert_eq!(next_index(0, 16), 16);
        assert_eq!(next_index(16, 9), 32);
        assert_eq!(next_index(32, 28), 64);
    }

    #[test]
    fn fresh_queue_is_empty() {
        let queue = queue_with(1024);
        assert!(queue.is_empty());
        assert!(!queue.can_dequeue());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.buffer_size(), 768);
        assert_eq!(queue.max_message_size(), 384);
        assert_eq!(queue.max_payload_size(), 376);
    }

    #[test]
    fn empty_dequeue_returns_empty_view() {
        let queue = queue_with(1024);
        let view = queue.dequeue_begin();
        assert!(view.is_empty());
        assert_eq!(view.len(), 0);
        assert_eq!(view.payload(), b"");
    }

    #[test]
    fn single_message_roundtrip() {
        let queue = queue_with(1024);
        assert_eq!(queue.enqueue(&[1, 2, 3, 4, 5]), Ok(true));
        assert!(!queue.is_empty());
        assert!(queue.can_dequeue());
        assert_eq!(queue.len(), 1);

        let view = queue.dequeue_begin();
        assert_eq!(view.len(), 5);
        assert_eq!(view.index(), 0);
        assert_eq!(view.payload(), &[1, 2, 3, 4, 5]);
        queue.dequeue_commit(view);

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        // Frame of 8 + 5 bytes, padded to the next multiple of 8.
        assert_eq!(read_ix(&queue), 16);
    }

    #[test]
    fn indices_advance_by_padded_frames() {
        let queue = queue_with(1024);
        for expected_len in 1..=5u64 {
            assert_eq!(queue.enqueue(&[0xAB; 8]), Ok(true));
            assert_eq!(queue.len(), expected_len);
            assert_eq!(write_ix(&queue), expected_len * 16);
        }
    }

    #[test]
    fn indices_stay_eight_byte_aligned() {
        let queue = queue_with(1024);
        for size in [1usize, 2, 3, 7, 8, 9, 15, 16, 17, 31] {
            assert_eq!(queue.enqueue(&vec![0x5A; size]), Ok(true));
            assert_eq!(write_ix(&queue) % 8, 0);
            let view = queue.dequeue_begin();
            queue.dequeue_commit(view);
            assert_eq!(read_ix(&queue) % 8, 0);
        }
    }

    #[test]
    fn rejects_empty_message() {
        let queue = queue_with(1024);
        assert_eq!(queue.enqueue(b""), Err(RingError::MessageEmpty));
        assert!(queue.is_empty());
    }

    #[test]
    fn rejects_oversize_message() {
        let queue = queue_with(1024);
        let err = queue.enqueue(&[0u8; 400]).unwrap_err();
        assert_eq!(
            err,
            RingError::MessageTooLarge {
                size: 400,
                max: 376
            }
        );
        // The queue is observably unchanged.
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(write_ix(&queue), 0);
    }

    #[test]
    fn max_payload_is_accepted() {
        let queue = queue_with(1024);
        assert_eq!(queue.enqueue(&vec![0x11; 376]), Ok(true));
        let view = queue.dequeue_begin();
        assert_eq!(view.len(), 376);
        queue.dequeue_commit(view);
    }

    #[test]
    fn fill_reports_full_without_modifying_the_ring() {
        let queue = queue_with(1024);
        // 20-byte payloads occupy 32-byte frames; B/32 - 1 = 23 must fit.
        let mut accepted = 0u64;
        while queue.enqueue(&[0x42; 20]).unwrap() {
            accepted += 1;
        }
        assert_eq!(accepted, 23);
        assert_eq!(queue.len(), 23);

        let write_before = write_ix(&queue);
        assert_eq!(queue.enqueue(&[0x42; 20]), Ok(false));
        assert_eq!(write_ix(&queue), write_before);
        assert_eq!(queue.len(), 23);
    }

    // Fill until full, free one frame, and the producer wraps into it.
    // Priming the ring first keeps the wrap target clear of the consumer's
    // index.
    #[test]
    fn freeing_one_frame_unblocks_the_producer() {
        let queue = queue_with(1024);
        // Prime: cycle one small message so the indices start at 16, not 0.
        assert_eq!(queue.enqueue(&[0xEE; 8]), Ok(true));
        queue.dequeue_commit(queue.dequeue_begin());

        let mut sent = Vec::new();
        let mut seq = 0u8;
        loop {
            let payload = [seq; 20];
            if !queue.enqueue(&payload).unwrap() {
                break;
            }
            sent.push(payload);
            seq += 1;
        }

        let view = queue.dequeue_begin();
        assert_eq!(view.payload(), &sent[0]);
        queue.dequeue_commit(view);

        let payload = [seq; 20];
        assert_eq!(queue.enqueue(&payload), Ok(true));
        sent.push(payload);

        for expected in &sent[1..] {
            let view = queue.dequeue_begin();
            assert_eq!(view.payload(), expected);
            queue.dequeue_commit(view);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    // From a zero-aligned fill the wrap target coincides with the freed
    // frame, which the uniform reject bound refuses: write_ix may never land
    // exactly on read_ix. A second free makes room.
    #[test]
    fn wrap_never_lands_on_the_read_index() {
        let queue = queue_with(1024);
        while queue.enqueue(&[0x42; 20]).unwrap() {}

        queue.dequeue_commit(queue.dequeue_begin());
        assert_eq!(queue.enqueue(&[0x42; 20]), Ok(false));

        queue.dequeue_commit(queue.dequeue_begin());
        assert_eq!(queue.enqueue(&[0x42; 20]), Ok(true));
    }

    #[test]
    fn wrap_writes_sentinel_and_frame_at_origin() {
        // B = 64: one 24-byte payload fills half the ring.
        let queue = queue_with(256 + 64);
        assert_eq!(queue.max_payload_size(), 24);

        // Walk the indices to 48.
        assert_eq!(queue.enqueue(&[1; 24]), Ok(true));
        queue.dequeue_commit(queue.dequeue_begin());
        assert_eq!(queue.enqueue(&[2; 8]), Ok(true));
        queue.dequeue_commit(queue.dequeue_begin());
        assert_eq!(read_ix(&queue), 48);
        assert_eq!(write_ix(&queue), 48);

        // The next frame cannot fit in [48, 64): it wraps.
        assert_eq!(queue.enqueue(&[3; 24]), Ok(true));
        assert_eq!(write_ix(&queue), 32);

        // Sentinel at the old write index, frame at offset 0.
        let sentinel =
            unsafe { queue.storage().buffer_ptr().add(48).cast::<u64>().read() };
        assert_eq!(sentinel, 0);

        let view = queue.dequeue_begin();
        assert_eq!(view.index(), 0);
        assert_eq!(view.payload(), &[3; 24]);
        queue.dequeue_commit(view);
        assert_eq!(read_ix(&queue), 32);
        assert!(queue.is_empty());
    }

    #[test]
    fn views_repeat_until_committed() {
        let queue = queue_with(1024);
        queue.enqueue(b"once").unwrap();
        let first = queue.dequeue_begin();
        let second = queue.dequeue_begin();
        assert_eq!(first.index(), second.index());
        assert_eq!(first.payload(), second.payload());
        queue.dequeue_commit(second);
        assert!(queue.dequeue_begin().is_empty());
    }

    #[test]
    fn queries_do_not_mutate() {
        let queue = queue_with(1024);
        queue.enqueue(b"stay").unwrap();
        for _ in 0..3 {
            assert!(!queue.is_empty());
            assert!(queue.can_dequeue());
            assert_eq!(queue.len(), 1);
        }
        assert_eq!(queue.dequeue_begin().payload(), b"stay");
    }

    #[test]
    fn emptiness_matches_count_when_quiesced() {
        let queue = queue_with(1024);
        assert_eq!(queue.is_empty(), queue.len() == 0);
        queue.enqueue(b"x").unwrap();
        assert_eq!(queue.is_empty(), queue.len() == 0);
        queue.dequeue_commit(queue.dequeue_begin());
        assert_eq!(queue.is_empty(), queue.len() == 0);
    }

    #[test]
    fn header_survives_traffic() {
        let queue = queue_with(1024);
        for round in 0..200u64 {
            let size = (round % 48 + 1) as usize;
            while !queue.enqueue(&vec![round as u8; size]).unwrap() {
                queue.dequeue_commit(queue.dequeue_begin());
            }
        }
        while queue.can_dequeue() {
            queue.dequeue_commit(queue.dequeue_begin());
        }
        assert_eq!(queue.storage().magic(), crate::storage::MAGIC);
        assert_eq!(queue.storage().abi_version(), crate::storage::ABI_VERSION);
        assert_eq!(queue.storage().total_size(), 1024);
    }

    #[test]
    fn fifo_order_across_many_wraps() {
        let queue = queue_with(256 + 256);
        let mut inbox = Vec::new();
        let mut outbox = Vec::new();
        for i in 0..500u64 {
            let size = (i % 40 + 1) as usize;
            let payload: Vec<u8> = (0..size).map(|j| (i as u8).wrapping_add(j as u8)).collect();
            while !queue.enqueue(&payload).unwrap() {
                let view = queue.dequeue_begin();
                outbox.push(view.payload().to_vec());
                queue.dequeue_commit(view);
            }
            inbox.push(payload);
        }
        while queue.can_dequeue() {
            let view = queue.dequeue_begin();
            outbox.push(view.payload().to_vec());
            queue.dequeue_commit(view);
        }
        assert_eq!(inbox, outbox);
    }

    fn payload_byte(message: usize, offset: usize) -> u8 {
        (message.wrapping_mul(31).wrapping_add(offset)) as u8
    }

    #[test]
    fn two_threads_preserve_fifo_over_randomised_sizes() {
        const MESSAGES: usize = 1_000_000;
        const SEED: u64 = 0x5350_5343;

        let queue = queue_with(64 * 1024);
        let (producer, consumer) = queue.split();

        thread::scope(|scope| {
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(SEED);
                let mut buf = [0u8; 64];
                for i in 0..MESSAGES {
                    let size = rng.gen_range(1..=64usize);
                    for (j, byte) in buf[..size].iter_mut().enumerate() {
                        *byte = payload_byte(i, j);
                    }
                    while !producer.enqueue(&buf[..size]).unwrap() {
                        hint::spin_loop();
                    }
                }
            });

            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(SEED);
                for i in 0..MESSAGES {
                    let size = rng.gen_range(1..=64usize);
                    let view = loop {
                        let view = consumer.dequeue_begin();
                        if !view.is_empty() {
                            break view;
                        }
                        hint::spin_loop();
                    };
                    assert_eq!(view.len() as usize, size, "message {i} length");
                    let payload = view.payload();
                    for (j, &byte) in payload.iter().enumerate() {
                        assert_eq!(byte, payload_byte(i, j), "message {i} byte {j}");
                    }
                    consumer.dequeue_commit(view);
                }
            });
        });

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}
