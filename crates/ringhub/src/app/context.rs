// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback context: the app-facing send API.
//!
//! Messages are composed from an optional write-buffer prefix (the
//! `w_*` family) plus the payload passed to the send call. Every send
//! encodes one outbound record per target worker; multi-recipient
//! sends partition client ids by their worker half first, so the
//! worker-side fan-out never needs a cross-worker lookup. Cursor
//! publication and wakes are deferred to the update queue.

use std::sync::Arc;

use crate::client_id::ClientId;
use crate::error::ServerError;
use crate::msg::{self, RecipientSet};
use crate::ring::buffer::RingProducer;
use crate::ring::queue::UpdateQueue;
use crate::ring::wake::WakeState;
use crate::ws::frame;

/// Context handed to every app callback.
pub struct AppContext<'a> {
    outbound: &'a mut [RingProducer],
    updates: &'a mut UpdateQueue,
    worker_wakes: &'a [Arc<WakeState>],

    /// Lazily allocated composed-message buffer.
    wbuf: &'a mut Vec<u8>,

    /// Per-worker recipient scratch, reused across sends.
    partition: &'a mut [Vec<u32>],

    /// The client the current callback concerns, if any.
    cur: Option<ClientId>,

    max_ws_msg_size: usize,
    wbuf_initial_size: usize,

    /// First fatal condition hit inside a send; later sends no-op.
    failure: Option<ServerError>,
}

impl<'a> AppContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        outbound: &'a mut [RingProducer],
        updates: &'a mut UpdateQueue,
        worker_wakes: &'a [Arc<WakeState>],
        wbuf: &'a mut Vec<u8>,
        partition: &'a mut [Vec<u32>],
        cur: Option<ClientId>,
        max_ws_msg_size: usize,
        wbuf_initial_size: usize,
    ) -> Self {
        Self {
            outbound,
            updates,
            worker_wakes,
            wbuf,
            partition,
            cur,
            max_ws_msg_size,
            wbuf_initial_size,
            failure: None,
        }
    }

    pub(crate) fn take_failure(&mut self) -> Option<ServerError> {
        self.failure.take()
    }

    /// The client id of the peer the current callback is about.
    /// `None` inside `init` and `timer`.
    pub fn current_client(&self) -> Option<ClientId> {
        self.cur
    }

    /// Number of worker threads (the fan-out width).
    pub fn worker_count(&self) -> usize {
        self.outbound.len()
    }

    // ===================================================================
    // Write-buffer composition
    // ===================================================================

    fn wbuf_reserve(&mut self, incr: usize) {
        if self.wbuf.capacity() == 0 {
            self.wbuf.reserve(self.wbuf_initial_size.max(incr));
        } else {
            self.wbuf.reserve(incr);
        }
    }

    /// Append raw bytes to the composed-message buffer.
    pub fn w_bytes(&mut self, bytes: &[u8]) {
        self.wbuf_reserve(bytes.len());
        self.wbuf.extend_from_slice(bytes);
    }

    pub fn w_u8(&mut self, v: u8) {
        self.wbuf_reserve(1);
        self.wbuf.push(v);
    }

    pub fn w_u16(&mut self, v: u16) {
        self.w_bytes(&v.to_ne_bytes());
    }

    pub fn w_u32(&mut self, v: u32) {
        self.w_bytes(&v.to_ne_bytes());
    }

    pub fn w_u64(&mut self, v: u64) {
        self.w_bytes(&v.to_ne_bytes());
    }

    /// Network-order variants for wire-visible integers.
    pub fn w_u16_net(&mut self, v: u16) {
        self.w_bytes(&v.to_be_bytes());
    }

    pub fn w_u32_net(&mut self, v: u32) {
        self.w_bytes(&v.to_be_bytes());
    }

    pub fn w_u64_net(&mut self, v: u64) {
        self.w_bytes(&v.to_be_bytes());
    }

    pub fn w_i8(&mut self, v: i8) {
        self.w_u8(v as u8);
    }

    pub fn w_i16(&mut self, v: i16) {
        self.w_u16(v as u16);
    }

    pub fn w_i32(&mut self, v: i32) {
        self.w_u32(v as u32);
    }

    pub fn w_i64(&mut self, v: i64) {
        self.w_u64(v as u64);
    }

    pub fn w_i16_net(&mut self, v: i16) {
        self.w_u16_net(v as u16);
    }

    pub fn w_i32_net(&mut self, v: i32) {
        self.w_u32_net(v as u32);
    }

    pub fn w_i64_net(&mut self, v: i64) {
        self.w_u64_net(v as u64);
    }

    // ===================================================================
    // Send family
    // ===================================================================

    /// Send to the client the current callback is about.
    pub fn to_cur(&mut self, is_text: bool, payload: &[u8]) {
        let Some(cur) = self.cur else {
            log::warn!("to_cur outside a per-client callback; dropped");
            self.wbuf.clear();
            return;
        };
        self.send(cur.worker(), RecipientSet::Single(cur.peer()), is_text, payload);
        self.wbuf.clear();
    }

    /// Send to one client.
    pub fn to_single(&mut self, is_text: bool, client: ClientId, payload: &[u8]) {
        self.send(
            client.worker(),
            RecipientSet::Single(client.peer()),
            is_text,
            payload,
        );
        self.wbuf.clear();
    }

    /// Send to a set of clients, partitioned per worker.
    pub fn to_multi(&mut self, is_text: bool, clients: &[ClientId], payload: &[u8]) {
        self.partition_clients(clients);
        for worker in 0..self.outbound.len() {
            let subset = std::mem::take(&mut self.partition[worker]);
            match subset.len() {
                0 => {}
                1 => self.send(
                    worker as u32,
                    RecipientSet::Single(subset[0]),
                    is_text,
                    payload,
                ),
                _ => self.send(worker as u32, RecipientSet::Array(&subset), is_text, payload),
            }
            self.partition[worker] = subset;
        }
        self.wbuf.clear();
    }

    /// Broadcast to every live client.
    pub fn to_every(&mut self, is_text: bool, payload: &[u8]) {
        for worker in 0..self.outbound.len() {
            self.send(worker as u32, RecipientSet::Every, is_text, payload);
        }
        self.wbuf.clear();
    }

    /// Broadcast to everyone except the current callback's client.
    pub fn to_every_except_cur(&mut self, is_text: bool, payload: &[u8]) {
        let Some(cur) = self.cur else {
            log::warn!("to_every_except_cur outside a per-client callback; dropped");
            self.wbuf.clear();
            return;
        };
        self.to_every_except_single(is_text, cur, payload);
    }

    /// Broadcast to everyone except one client.
    pub fn to_every_except_single(&mut self, is_text: bool, excluded: ClientId, payload: &[u8]) {
        for worker in 0..self.outbound.len() {
            let recipients = if worker as u32 == excluded.worker() {
                RecipientSet::EveryExceptSingle(excluded.peer())
            } else {
                RecipientSet::Every
            };
            self.send(worker as u32, recipients, is_text, payload);
        }
        self.wbuf.clear();
    }

    /// Broadcast to everyone except a set of clients.
    pub fn to_every_except_multi(&mut self, is_text: bool, excluded: &[ClientId], payload: &[u8]) {
        self.partition_clients(excluded);
        for worker in 0..self.outbound.len() {
            let subset = std::mem::take(&mut self.partition[worker]);
            match subset.len() {
                0 => self.send(worker as u32, RecipientSet::Every, is_text, payload),
                1 => self.send(
                    worker as u32,
                    RecipientSet::EveryExceptSingle(subset[0]),
                    is_text,
                    payload,
                ),
                _ => self.send(
                    worker as u32,
                    RecipientSet::EveryExceptArray(&subset),
                    is_text,
                    payload,
                ),
            }
            self.partition[worker] = subset;
        }
        self.wbuf.clear();
    }

    /// Group client ids by their worker half into the reused scratch
    /// vectors (bounded, heap-backed).
    fn partition_clients(&mut self, clients: &[ClientId]) {
        for bucket in self.partition.iter_mut() {
            bucket.clear();
        }
        for client in clients {
            let worker = client.worker() as usize;
            if worker < self.partition.len() {
                self.partition[worker].push(client.peer());
            } else {
                log::warn!("client id {} names unknown worker", client);
            }
        }
    }

    /// Encode one record into a worker's outbound ring and record the
    /// publish event.
    fn send(&mut self, worker: u32, recipients: RecipientSet<'_>, is_text: bool, payload: &[u8]) {
        if self.failure.is_some() {
            return;
        }
        let total = self.wbuf.len() + payload.len();
        if total > self.max_ws_msg_size {
            log::error!(
                "outbound message of {} bytes exceeds the {} byte cap",
                total,
                self.max_ws_msg_size
            );
            self.failure = Some(ServerError::InvalidConfig {
                reason: "outbound message exceeds max_ws_msg_size".to_string(),
            });
            return;
        }
        let opcode = if is_text {
            frame::SERVER_TEXT
        } else {
            frame::SERVER_BINARY
        };

        let position = msg::write_outbound(
            &mut self.outbound[worker as usize],
            recipients,
            opcode,
            self.wbuf,
            payload,
        );

        if self.updates.is_full() {
            // Checkpoint flush; only write entries can be pending here.
            self.updates.flush(self.outbound, &[], self.worker_wakes);
        }
        if let Err(e) = self.updates.enqueue(worker, position, true) {
            self.failure = Some(e);
        }
    }

    /// Internal: close frame for an app-chosen close code.
    pub(crate) fn send_close(&mut self, client: ClientId, code: u16) {
        if self.failure.is_some() {
            return;
        }
        let position = msg::write_outbound(
            &mut self.outbound[client.worker() as usize],
            RecipientSet::Single(client.peer()),
            frame::SERVER_CLOSE,
            &code.to_be_bytes(),
            &[],
        );
        if self.updates.is_full() {
            self.updates.flush(self.outbound, &[], self.worker_wakes);
        }
        if let Err(e) = self.updates.enqueue(client.worker(), position, true) {
            self.failure = Some(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::ParsedRecipients;
    use crate::ring::buffer::{self, RingConsumer};

    struct Harness {
        producers: Vec<RingProducer>,
        consumers: Vec<RingConsumer>,
        updates: UpdateQueue,
        wakes: Vec<Arc<WakeState>>,
        wbuf: Vec<u8>,
        partition: Vec<Vec<u32>>,
    }

    impl Harness {
        fn new(workers: usize) -> Self {
            let mut producers = Vec::new();
            let mut consumers = Vec::new();
            for _ in 0..workers {
                let (p, c) = buffer::channel(4096, 1.5);
                producers.push(p);
                consumers.push(c);
            }
            Self {
                producers,
                consumers,
                updates: UpdateQueue::new(16),
                wakes: (0..workers)
                    .map(|_| Arc::new(WakeState::new().unwrap()))
                    .collect(),
                wbuf: Vec::new(),
                partition: (0..workers).map(|_| Vec::new()).collect(),
            }
        }

        fn ctx(&mut self, cur: Option<ClientId>) -> AppContext<'_> {
            AppContext::new(
                &mut self.producers,
                &mut self.updates,
                &self.wakes,
                &mut self.wbuf,
                &mut self.partition,
                cur,
                1 << 20,
                4096,
            )
        }

        fn flush(&mut self) {
            self.updates
                .flush(&self.producers, &[], &self.wakes);
        }

        fn records(&mut self, worker: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
            let cons = &mut self.consumers[worker];
            cons.refresh();
            let mut out = Vec::new();
            loop {
                let chunk = cons.readable();
                if chunk.is_empty() {
                    break;
                }
                let mut consumed = 0;
                while consumed < chunk.len() {
                    let (record, used) = msg::parse_outbound(&chunk[consumed..]).unwrap();
                    let recipients = match record.recipients {
                        ParsedRecipients::Single(s) => vec![0u8, s as u8],
                        ParsedRecipients::Array(l) => {
                            let mut v = vec![1u8];
                            v.extend(l.iter().map(|s| s as u8));
                            v
                        }
                        ParsedRecipients::Every => vec![2u8],
                        ParsedRecipients::EveryExceptSingle(s) => vec![3u8, s as u8],
                        ParsedRecipients::EveryExceptArray(l) => {
                            let mut v = vec![4u8];
                            v.extend(l.iter().map(|s| s as u8));
                            v
                        }
                    };
                    out.push((recipients, record.frame.to_vec()));
                    consumed += used;
                }
                cons.consume(consumed);
            }
            out
        }
    }

    #[test]
    fn test_to_cur_echo_frame_bytes() {
        // Echoing "hi!" must produce exactly 81 03 68 69 21.
        let mut h = Harness::new(2);
        let cur = ClientId::from_parts(1, 9);
        let mut ctx = h.ctx(Some(cur));
        ctx.to_cur(true, b"hi!");
        assert!(ctx.take_failure().is_none());
        h.flush();

        assert!(h.records(0).is_empty());
        let recs = h.records(1);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].0, vec![0u8, 9]);
        assert_eq!(recs[0].1, [0x81, 0x03, 0x68, 0x69, 0x21]);
    }

    #[test]
    fn test_to_every_one_record_per_worker() {
        let mut h = Harness::new(2);
        let mut ctx = h.ctx(None);
        ctx.to_every(true, b"X");
        h.flush();

        for worker in 0..2 {
            let recs = h.records(worker);
            assert_eq!(recs.len(), 1, "worker {}", worker);
            assert_eq!(recs[0].0, vec![2u8]);
            assert_eq!(recs[0].1, [0x81, 0x01, 0x58]);
        }
    }

    #[test]
    fn test_to_every_except_single_splits_kinds() {
        // The exclusion lives on worker 1 slot 7; worker 0
        // sees EVERY, worker 1 sees EVERY_EXCEPT_SINGLE [7].
        let mut h = Harness::new(2);
        let excluded = ClientId::from_parts(1, 7);
        let mut ctx = h.ctx(None);
        ctx.to_every_except_single(true, excluded, b"X");
        h.flush();

        assert_eq!(h.records(0)[0].0, vec![2u8]);
        assert_eq!(h.records(1)[0].0, vec![3u8, 7]);
    }

    #[test]
    fn test_to_multi_partitions_and_degrades() {
        let mut h = Harness::new(3);
        let clients = [
            ClientId::from_parts(0, 1),
            ClientId::from_parts(0, 2),
            ClientId::from_parts(2, 5),
        ];
        let mut ctx = h.ctx(None);
        ctx.to_multi(false, &clients, b"m");
        h.flush();

        // Worker 0: two recipients -> ARRAY; worker 1: none; worker 2:
        // one -> SINGLE.
        assert_eq!(h.records(0)[0].0, vec![1u8, 1, 2]);
        assert!(h.records(1).is_empty());
        assert_eq!(h.records(2)[0].0, vec![0u8, 5]);
    }

    #[test]
    fn test_to_every_except_multi_degrades() {
        let mut h = Harness::new(3);
        let excluded = [
            ClientId::from_parts(1, 4),
            ClientId::from_parts(2, 6),
            ClientId::from_parts(2, 8),
        ];
        let mut ctx = h.ctx(None);
        ctx.to_every_except_multi(true, &excluded, b"e");
        h.flush();

        assert_eq!(h.records(0)[0].0, vec![2u8]);
        assert_eq!(h.records(1)[0].0, vec![3u8, 4]);
        assert_eq!(h.records(2)[0].0, vec![4u8, 6, 8]);
    }

    #[test]
    fn test_wbuf_prefix_composed_and_cleared() {
        let mut h = Harness::new(1);
        let mut ctx = h.ctx(None);
        ctx.w_u8(0x01);
        ctx.w_u16_net(0x0203);
        ctx.to_every(false, b"tail");
        h.flush();

        let recs = h.records(0);
        // 3 prefix bytes + 4 payload bytes behind a 2-byte header.
        assert_eq!(
            recs[0].1,
            [0x82, 0x07, 0x01, 0x02, 0x03, b't', b'a', b'i', b'l']
        );

        // Buffer cleared: next send has no stale prefix.
        let mut ctx = h.ctx(None);
        ctx.to_every(false, b"z");
        h.flush();
        assert_eq!(h.records(0)[0].1, [0x82, 0x01, b'z']);
    }

    #[test]
    fn test_network_order_helpers() {
        let mut h = Harness::new(1);
        let mut ctx = h.ctx(None);
        ctx.w_u32_net(0xAABBCCDD);
        ctx.w_u64_net(0x1122334455667788);
        ctx.to_every(false, b"");
        h.flush();

        let recs = h.records(0);
        assert_eq!(
            &recs[0].1[2..],
            [0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn test_oversized_send_is_fatal() {
        let mut h = Harness::new(1);
        let mut producers = std::mem::take(&mut h.producers);
        let mut updates = UpdateQueue::new(4);
        let wakes = h.wakes.clone();
        let mut wbuf = Vec::new();
        let mut partition = vec![Vec::new()];
        let mut ctx = AppContext::new(
            &mut producers,
            &mut updates,
            &wakes,
            &mut wbuf,
            &mut partition,
            None,
            8, // tiny cap
            64,
        );
        ctx.to_every(false, b"way too long");
        assert!(ctx.take_failure().is_some());
    }

    #[test]
    fn test_to_cur_without_current_client_is_dropped() {
        let mut h = Harness::new(1);
        let mut ctx = h.ctx(None);
        ctx.to_cur(true, b"nope");
        assert!(ctx.take_failure().is_none());
        h.flush();
        assert!(h.records(0).is_empty());
    }

    #[test]
    fn test_send_close_record() {
        let mut h = Harness::new(1);
        let client = ClientId::from_parts(0, 3);
        let mut ctx = h.ctx(None);
        ctx.send_close(client, 4005);
        h.flush();

        let recs = h.records(0);
        assert_eq!(recs[0].0, vec![0u8, 3]);
        assert_eq!(recs[0].1, [0x88, 0x02, 0x0F, 0xA5]);
    }
}
