// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer-local queue of pending ring updates.
//!
//! Publishing a cursor and waking the target thread are deferred: each
//! send records an update here, and at scheduler checkpoints (loop
//! turns, or when the queue fills) [`UpdateQueue::flush`] publishes the
//! highest recorded position per target and signals only the targets
//! observed asleep. This coalesces both the atomic publications and the
//! eventfd wakes across bursts of small messages.

use std::sync::Arc;

use crate::error::ServerError;
use crate::ring::buffer::{RingConsumer, RingProducer};
use crate::ring::wake::WakeState;

/// One pending publish event.
///
/// `is_write` distinguishes a writer publication (`W`, wakes the
/// consumer) from a readership advance (`R`, lets the producer size
/// growth decisions; never wakes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingUpdate {
    target: u32,
    position: u64,
    is_write: bool,
}

/// Bounded FIFO of pending updates, owned by one thread.
#[derive(Debug)]
pub struct UpdateQueue {
    entries: Vec<RingUpdate>,
    capacity: usize,
}

impl UpdateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// True when the next non-coalescing enqueue would overflow.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// True when no updates are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a publish event. An existing entry for the same target
    /// and direction is overwritten with the newer (higher) position.
    ///
    /// Callers flush at checkpoints; a full queue here means the flush
    /// discipline was violated, which is fatal by design.
    pub fn enqueue(
        &mut self,
        target: u32,
        position: u64,
        is_write: bool,
    ) -> Result<(), ServerError> {
        for entry in &mut self.entries {
            if entry.target == target && entry.is_write == is_write {
                debug_assert!(position >= entry.position);
                entry.position = position;
                return Ok(());
            }
        }
        if self.entries.len() >= self.capacity {
            return Err(ServerError::UpdateQueueOverflow {
                capacity: self.capacity,
            });
        }
        self.entries.push(RingUpdate {
            target,
            position,
            is_write,
        });
        Ok(())
    }

    /// Publish every pending update and wake the consumers that were
    /// observed asleep.
    ///
    /// `producers[i]` / `consumers[i]` are this thread's halves of the
    /// rings shared with target thread `i`; `wakes[i]` is target `i`'s
    /// wake state. Writer publications are ordered before the sleep
    /// check, which is what makes the double-check sleep protocol on
    /// the consumer side lossless.
    pub fn flush(
        &mut self,
        producers: &[RingProducer],
        consumers: &[RingConsumer],
        wakes: &[Arc<WakeState>],
    ) {
        for entry in self.entries.drain(..) {
            let i = entry.target as usize;
            if entry.is_write {
                producers[i].publish_position(entry.position);
                wakes[i].wake_if_asleep();
            } else {
                consumers[i].announce_position(entry.position);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::buffer;
    use crate::ring::wake::WaitOutcome;
    use std::time::Duration;

    fn write_bytes(prod: &mut RingProducer, payload: &[u8]) {
        let buf = prod.reserve(payload.len());
        buf.copy_from_slice(payload);
        prod.advance(payload.len());
    }

    #[test]
    fn test_enqueue_coalesces_per_target() {
        let mut queue = UpdateQueue::new(4);
        queue.enqueue(0, 10, true).unwrap();
        queue.enqueue(0, 25, true).unwrap();
        queue.enqueue(1, 5, true).unwrap();
        queue.enqueue(0, 7, false).unwrap();

        assert_eq!(queue.entries.len(), 3);
        assert_eq!(
            queue.entries[0],
            RingUpdate {
                target: 0,
                position: 25,
                is_write: true
            }
        );
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut queue = UpdateQueue::new(2);
        queue.enqueue(0, 1, true).unwrap();
        queue.enqueue(1, 1, true).unwrap();
        assert!(queue.is_full());
        assert!(queue.enqueue(2, 1, true).is_err());

        // Coalescing onto an existing target still succeeds when full.
        queue.enqueue(1, 9, true).unwrap();
    }

    #[test]
    fn test_flush_publishes_and_wakes_sleeper() {
        let (mut prod, mut cons) = buffer::channel(64, 1.5);
        let wake = Arc::new(WakeState::new().unwrap());

        write_bytes(&mut prod, b"payload");
        let position = prod.position();

        let mut queue = UpdateQueue::new(4);
        queue.enqueue(0, position, true).unwrap();

        // Consumer has not been woken or shown data yet.
        assert!(cons.is_empty());

        wake.sleep.fall_asleep();
        queue.flush(&[prod], &[], std::slice::from_ref(&wake));

        assert!(!cons.is_empty());
        assert_eq!(
            wake.eventfd.wait(Some(Duration::from_millis(50))).unwrap(),
            WaitOutcome::Signalled
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_skips_awake_consumer() {
        let (mut prod, _cons) = buffer::channel(64, 1.5);
        let wake = Arc::new(WakeState::new().unwrap());

        write_bytes(&mut prod, b"x");
        let mut queue = UpdateQueue::new(4);
        queue.enqueue(0, prod.position(), true).unwrap();
        queue.flush(&[prod], &[], std::slice::from_ref(&wake));

        // Target was awake: no spurious signal.
        assert_eq!(
            wake.eventfd.wait(Some(Duration::from_millis(10))).unwrap(),
            WaitOutcome::Timeout
        );
    }

    #[test]
    fn test_read_announce_does_not_wake() {
        let (mut prod, mut cons) = buffer::channel(64, 1.5);
        let wake = Arc::new(WakeState::new().unwrap());
        wake.sleep.fall_asleep();

        write_bytes(&mut prod, b"abcdef");
        prod.publish();
        cons.refresh();
        let chunk_len = cons.readable().len();
        cons.consume(chunk_len);

        let mut queue = UpdateQueue::new(4);
        queue.enqueue(0, cons.position(), false).unwrap();
        queue.flush(&[], std::slice::from_ref(&cons), std::slice::from_ref(&wake));

        assert_eq!(prod.occupancy(), 0);
        assert_eq!(
            wake.eventfd.wait(Some(Duration::from_millis(10))).unwrap(),
            WaitOutcome::Timeout
        );
    }
}
