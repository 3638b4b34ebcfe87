// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-producer single-consumer byte ring.
//!
//! One thread writes, one thread reads. The producer composes records
//! into a private region (`reserve` + `advance`) and makes them visible
//! by storing its private writer position into the published `W` cursor
//! (`publish`). The consumer loads `W` (`refresh`), reads the window
//! `[private reader, W)` and stores its private reader into the
//! published `R` cursor (`announce`) so the producer can size growth
//! decisions.
//!
//! Cursors are monotonic global byte offsets. Capacity grows by
//! *segment handoff*: when the current segment cannot hold a reserved
//! record, the producer links a fresh, larger segment and seals the old
//! one. Records are contiguous within a segment; the consumer frees a
//! segment once it has drained past it. `R <= W <= private writer`
//! holds at all times, across handoffs.
//!
//! # Memory ordering
//!
//! On x86-64 the publish/refresh pair uses compiler-fence-bounded
//! relaxed accesses: total store order already keeps the payload bytes
//! ahead of the cursor store. Elsewhere a release store / acquire load
//! pair is used instead. Segment links always use release/acquire.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pads a value out to a cache line so the two cursors never share one.
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Sentinel for a segment still owned by the producer's write cursor.
const SEGMENT_OPEN: usize = usize::MAX;

/// One contiguous allocation in the ring's segment chain.
struct Segment {
    /// Byte storage. The producer writes `[used, capacity)`, the
    /// consumer reads `[0, sealed or W-start)`; the regions never
    /// overlap because bytes below `W` are producer-immutable.
    data: UnsafeCell<Box<[u8]>>,

    /// Global offset of `data[0]`.
    start: u64,

    /// `SEGMENT_OPEN` while the producer still appends here; the final
    /// byte count once sealed. Stored after `next` with release order.
    sealed: AtomicUsize,

    /// Successor segment, set exactly once right before sealing.
    next: AtomicPtr<Segment>,
}

impl Segment {
    fn alloc(size: usize, start: u64) -> *mut Segment {
        Box::into_raw(Box::new(Segment {
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            start,
            sealed: AtomicUsize::new(SEGMENT_OPEN),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn capacity(&self) -> usize {
        // SAFETY: the Box is never replaced after allocation; only its
        // contents are written, so reading the length is always safe.
        unsafe { (&*self.data.get()).len() }
    }
}

/// State shared by the two ring handles.
struct Shared {
    /// Published writer position `W`.
    write_pos: CachePadded<AtomicU64>,

    /// Published reader position `R`.
    read_pos: CachePadded<AtomicU64>,

    /// Earliest segment not yet freed; advanced by the consumer.
    chain_head: AtomicPtr<Segment>,

    /// Set by the first handle to drop; the second frees the chain.
    hangup: AtomicBool,
}

// SAFETY: Shared is accessed by exactly one producer and one consumer
// thread; the atomics order every cross-thread access, and raw segment
// pointers are only dereferenced under the SPSC protocol documented on
// each use site.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn release_handle(&self) {
        if self.hangup.swap(true, Ordering::AcqRel) {
            // Second handle down: nobody can touch the chain anymore.
            let mut seg = self.chain_head.load(Ordering::Acquire);
            while !seg.is_null() {
                // SAFETY: both handles are gone, so this thread has
                // exclusive ownership of every remaining segment.
                let boxed = unsafe { Box::from_raw(seg) };
                seg = boxed.next.load(Ordering::Acquire);
            }
            self.chain_head.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

/// Store a published cursor.
///
/// Total store order already keeps the payload bytes ahead of the
/// cursor store on x86-64, so compiler fences around a relaxed store
/// suffice there; weaker architectures take a release store instead.
#[inline]
fn publish_store(cursor: &AtomicU64, value: u64) {
    #[cfg(target_arch = "x86_64")]
    {
        std::sync::atomic::compiler_fence(Ordering::SeqCst);
        cursor.store(value, Ordering::Relaxed);
        std::sync::atomic::compiler_fence(Ordering::SeqCst);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        cursor.store(value, Ordering::Release);
    }
}

/// Load a published cursor.
#[inline]
fn publish_load(cursor: &AtomicU64) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        std::sync::atomic::compiler_fence(Ordering::SeqCst);
        let value = cursor.load(Ordering::Relaxed);
        std::sync::atomic::compiler_fence(Ordering::SeqCst);
        value
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        cursor.load(Ordering::Acquire)
    }
}

/// Create a ring with the given initial capacity and growth multiplier.
///
/// # Panics
///
/// Panics if `initial_size` is 0 or `multiplier <= 1.0`.
pub fn channel(initial_size: usize, multiplier: f64) -> (RingProducer, RingConsumer) {
    assert!(initial_size > 0, "initial_size must be > 0");
    assert!(multiplier > 1.0, "multiplier must be > 1.0");

    let first = Segment::alloc(initial_size, 0);
    let shared = Arc::new(Shared {
        write_pos: CachePadded::new(AtomicU64::new(0)),
        read_pos: CachePadded::new(AtomicU64::new(0)),
        chain_head: AtomicPtr::new(first),
        hangup: AtomicBool::new(false),
    });

    let producer = RingProducer {
        shared: Arc::clone(&shared),
        tail: first,
        writer: 0,
        seg_used: 0,
        multiplier,
    };
    let consumer = RingConsumer {
        shared,
        head: first,
        reader: 0,
        seen_write: 0,
    };
    (producer, consumer)
}

// =======================================================================
// Producer
// =======================================================================

/// Write half of a ring. Owned by exactly one thread.
pub struct RingProducer {
    shared: Arc<Shared>,
    /// Segment currently written to.
    tail: *mut Segment,
    /// Private writer position (global offset).
    writer: u64,
    /// Bytes written into the tail segment, `writer - tail.start`.
    seg_used: usize,
    multiplier: f64,
}

// SAFETY: the producer may move to another thread; it is the single
// writer and never aliases the consumer's read window.
unsafe impl Send for RingProducer {}

impl RingProducer {
    /// Private writer position. Records written up to here are complete
    /// but not necessarily published yet.
    pub fn position(&self) -> u64 {
        self.writer
    }

    /// Unconsumed bytes currently held by the ring, based on the
    /// consumer's last announced position.
    pub fn occupancy(&self) -> u64 {
        self.writer - self.shared.read_pos.load(Ordering::Relaxed)
    }

    /// Reserve `size` contiguous writable bytes at the private writer.
    ///
    /// Grows the ring by linking a fresh segment when the current one
    /// cannot hold the record.
    pub fn reserve(&mut self, size: usize) -> &mut [u8] {
        // SAFETY: tail is a live segment owned by this chain; only the
        // producer dereferences it for writing.
        let tail = unsafe { &*self.tail };
        if tail.capacity() - self.seg_used < size {
            self.grow(size);
        }
        let tail = unsafe { &*self.tail };
        let used = self.seg_used;
        // SAFETY: `[used, used + size)` is above the published writer,
        // so the consumer never reads it until `publish` moves `W` past
        // it; the producer is the only writer.
        unsafe {
            let buf = &mut *tail.data.get();
            &mut buf[used..used + size]
        }
    }

    /// Advance the private writer over `len` bytes written into the
    /// region returned by [`reserve`](Self::reserve).
    pub fn advance(&mut self, len: usize) {
        debug_assert!({
            // SAFETY: see reserve(); producer-only access.
            let cap = unsafe { (*self.tail).capacity() };
            self.seg_used + len <= cap
        });
        self.seg_used += len;
        self.writer += len as u64;
    }

    /// Publish the private writer position as `W`.
    pub fn publish(&self) {
        publish_store(&self.shared.write_pos, self.writer);
    }

    /// Publish an explicit position (used by the update queue, which
    /// records positions per enqueue and coalesces them).
    pub fn publish_position(&self, position: u64) {
        debug_assert!(position <= self.writer);
        publish_store(&self.shared.write_pos, position);
    }

    /// Seal the tail segment and link a fresh one sized for `need`
    /// bytes plus headroom.
    fn grow(&mut self, need: usize) {
        let occupancy = self.occupancy() as usize;
        let grown = ((occupancy + need) as f64 * self.multiplier) as usize;
        let new_size = grown.max(need);

        log::debug!(
            "ring grow: need={} occupancy={} new_segment={}",
            need,
            occupancy,
            new_size
        );

        let new_seg = Segment::alloc(new_size, self.writer);
        // SAFETY: producer-exclusive access to the open tail segment.
        let old = unsafe { &*self.tail };
        // Link first, then seal: the consumer acquires `sealed` and must
        // then observe a non-null `next`.
        old.next.store(new_seg, Ordering::Release);
        old.sealed.store(self.seg_used, Ordering::Release);

        self.tail = new_seg;
        self.seg_used = 0;
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.shared.release_handle();
    }
}

// =======================================================================
// Consumer
// =======================================================================

/// Read half of a ring. Owned by exactly one thread.
pub struct RingConsumer {
    shared: Arc<Shared>,
    /// Segment currently read from.
    head: *mut Segment,
    /// Private reader position (global offset).
    reader: u64,
    /// `W` as of the last `refresh`.
    seen_write: u64,
}

// SAFETY: single consumer; see RingProducer.
unsafe impl Send for RingConsumer {}

impl RingConsumer {
    /// Load the published writer position.
    pub fn refresh(&mut self) {
        self.seen_write = publish_load(&self.shared.write_pos);
    }

    /// True when no published data remains. Reloads `W`.
    pub fn is_empty(&mut self) -> bool {
        self.refresh();
        self.reader == self.seen_write
    }

    /// Private reader position.
    pub fn position(&self) -> u64 {
        self.reader
    }

    /// Contiguous readable window at the private reader, bounded by the
    /// last refreshed `W` and the current segment.
    ///
    /// Returns an empty slice when drained. Advancing past a sealed
    /// segment (and freeing it) happens here.
    pub fn readable(&mut self) -> &[u8] {
        loop {
            if self.reader == self.seen_write {
                return &[];
            }
            // SAFETY: head is live until this consumer frees it below.
            let seg = unsafe { &*self.head };
            let offset = (self.reader - seg.start) as usize;
            let sealed = seg.sealed.load(Ordering::Acquire);
            let limit = if sealed == SEGMENT_OPEN {
                seg.capacity()
            } else {
                sealed
            };

            if offset < limit {
                let published_in_seg =
                    ((self.seen_write - seg.start).min(limit as u64)) as usize;
                if published_in_seg <= offset {
                    return &[];
                }
                // SAFETY: `[offset, published_in_seg)` is below `W` and
                // at or above `R`: immutable for the producer, exclusive
                // to this consumer.
                return unsafe {
                    let buf = &*seg.data.get();
                    &buf[offset..published_in_seg]
                };
            }

            // Drained past this segment's sealed end: follow the link.
            debug_assert_ne!(sealed, SEGMENT_OPEN);
            let next = seg.next.load(Ordering::Acquire);
            debug_assert!(!next.is_null());
            self.shared.chain_head.store(next, Ordering::Release);
            let retired = self.head;
            self.head = next;
            // SAFETY: the consumer has fully drained `retired` and
            // chain_head no longer references it; the producer moved on
            // when it sealed it.
            drop(unsafe { Box::from_raw(retired) });
        }
    }

    /// Advance the private reader over `len` consumed bytes.
    pub fn consume(&mut self, len: usize) {
        debug_assert!(self.reader + len as u64 <= self.seen_write);
        self.reader += len as u64;
    }

    /// Publish the private reader position as `R` so the producer can
    /// compute occupancy.
    pub fn announce(&self) {
        self.shared.read_pos.store(self.reader, Ordering::Relaxed);
    }

    /// Publish an explicit position (update-queue path).
    pub fn announce_position(&self, position: u64) {
        debug_assert!(position <= self.reader);
        self.shared.read_pos.store(position, Ordering::Relaxed);
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.shared.release_handle();
    }
}
