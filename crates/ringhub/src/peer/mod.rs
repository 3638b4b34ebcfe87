// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer slots and the per-peer I/O state machine.
//!
//! A peer's `(layer, mortality)` pair selects how its socket events are
//! handled. Both progress monotonically:
//!
//! ```text
//! layer:     TCP -> (TLS ->) HTTP -> WS     (drops to TCP on shutdown)
//! mortality: LIVE -> SHUTDOWN_WRITE -> SHUTDOWN_READ -> DEAD
//! ```
//!
//! Writes resume from `old_wsize` against the original message bytes;
//! a write reports success only on full completion. Shutdown is a
//! bidirectional half-close: FIN first, then read-and-discard until
//! the peer's FIN, then the slot is zeroed and its index recycled.

pub mod socket;
pub mod tls;

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use rustls::ServerConnection;

use crate::error::IoStatus;
use crate::ws::frame::FrameAssembler;
use socket::BoxedSocket;

/// Protocol layer at which the peer's bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    Tcp,
    Tls,
    Http,
    Ws,
}

/// Position in the shutdown progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mortality {
    Live,
    ShutdownWrite,
    ShutdownRead,
    Dead,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Layer::Tcp => "TCP",
            Layer::Tls => "TLS",
            Layer::Http => "HTTP",
            Layer::Ws => "WS",
        };
        write!(f, "{}", s)
    }
}

/// One connected client and all of its per-connection state.
pub struct Peer {
    /// Non-blocking socket.
    pub sock: BoxedSocket,

    /// TLS session for encrypted listeners.
    pub tls: Option<ServerConnection>,

    pub layer: Layer,
    pub mortality: Mortality,

    /// Write-readiness shadow: true while blocked awaiting writable.
    pub is_writing: bool,

    /// Resume offset into the in-flight message.
    pub old_wsize: usize,

    /// Message currently being written.
    pending: Option<Vec<u8>>,

    /// Messages queued behind the in-flight one.
    send_queue: VecDeque<Vec<u8>>,

    /// Start graceful shutdown once the queue fully drains.
    shutdown_after_write: bool,

    /// Owning app index.
    pub app: u32,

    /// Inbound frame decoder + reassembler (WS layer).
    pub assembler: FrameAssembler,

    /// Upgrade request accumulator (HTTP layer).
    pub upgrade_buf: Vec<u8>,

    /// Close code reported to the app; 1006 until a real code arrives.
    pub close_code: u16,

    /// The app saw an OPEN for this peer and must see a CLOSE.
    pub open_announced: bool,
}

impl Peer {
    pub fn new(sock: BoxedSocket, tls: Option<ServerConnection>, app: u32, max_msg: usize) -> Self {
        let layer = if tls.is_some() { Layer::Tls } else { Layer::Http };
        Self {
            sock,
            tls,
            layer,
            mortality: Mortality::Live,
            is_writing: false,
            old_wsize: 0,
            pending: None,
            send_queue: VecDeque::new(),
            shutdown_after_write: false,
            app,
            assembler: FrameAssembler::new(max_msg),
            upgrade_buf: Vec::new(),
            close_code: 1006,
            open_announced: false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    /// Live WS peer, eligible for fan-out delivery.
    pub fn is_live_ws(&self) -> bool {
        self.layer == Layer::Ws && self.mortality == Mortality::Live
    }

    /// Anything still waiting to be written?
    pub fn has_backlog(&self) -> bool {
        self.pending.is_some() || !self.send_queue.is_empty()
    }

    // ===================================================================
    // Read
    // ===================================================================

    /// Non-blocking read at the current layer.
    ///
    /// `(Done, n)` with `n > 0` bytes, `(ClosePeer, 0)` when the peer
    /// closed its write half or errored, `(Again, 0)` on would-block.
    pub fn read(&mut self, buf: &mut [u8]) -> (IoStatus, usize) {
        let res = match &mut self.tls {
            Some(conn) => tls::read_plaintext(&mut self.sock, conn, buf),
            None => self.sock.read(buf),
        };
        match res {
            Ok(0) => (IoStatus::ClosePeer, 0),
            Ok(n) => (IoStatus::Done, n),
            Err(e) => match IoStatus::from_io_error(&e) {
                IoStatus::Again => (IoStatus::Again, 0),
                _ => {
                    log::debug!("peer read failed: {}", e);
                    (IoStatus::ClosePeer, 0)
                }
            },
        }
    }

    // ===================================================================
    // Write
    // ===================================================================

    /// Queue a wire-ready message behind any in-flight write.
    pub fn queue_frame(&mut self, frame: Vec<u8>) {
        self.send_queue.push_back(frame);
    }

    /// Queue a message and arrange graceful shutdown once it (and the
    /// rest of the backlog) has been written out.
    pub fn queue_close(&mut self, frame: Vec<u8>, close_code: u16) {
        self.send_queue.push_back(frame);
        self.shutdown_after_write = true;
        self.close_code = close_code;
    }

    /// Drive the write machine until drained or blocked.
    ///
    /// `Done` means every queued byte reached the transport (the only
    /// success); `Again` leaves `old_wsize` pointing at the resume
    /// offset and the write-blocked shadow set.
    pub fn flush_writes(&mut self) -> IoStatus {
        loop {
            if self.pending.is_none() {
                self.pending = self.send_queue.pop_front();
                self.old_wsize = 0;
            }
            let Some(msg) = &self.pending else {
                // Backlog drained; push any leftover ciphertext.
                if let Some(conn) = &mut self.tls {
                    match tls::flush_ciphertext(&mut self.sock, conn) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.is_writing = true;
                            return IoStatus::Again;
                        }
                        Err(e) => {
                            log::debug!("ciphertext flush failed: {}", e);
                            return IoStatus::ClosePeer;
                        }
                    }
                }
                self.is_writing = false;
                if self.shutdown_after_write && self.mortality == Mortality::Live {
                    self.mortality = Mortality::ShutdownWrite;
                }
                return IoStatus::Done;
            };

            // Always the original message bytes plus a resume offset:
            // a TLS retry must see identical input.
            let remaining_len = msg.len() - self.old_wsize;
            let res = match &mut self.tls {
                Some(conn) => tls::write_plaintext(&mut self.sock, conn, &msg[self.old_wsize..]),
                None => self.sock.write(&msg[self.old_wsize..]),
            };
            match res {
                Ok(0) => return IoStatus::ClosePeer,
                Ok(n) if n == remaining_len => {
                    self.pending = None;
                    self.old_wsize = 0;
                }
                Ok(n) => {
                    self.old_wsize += n;
                    self.is_writing = true;
                    return IoStatus::Again;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.is_writing = true;
                    return IoStatus::Again;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("peer write failed: {}", e);
                    return IoStatus::ClosePeer;
                }
            }
        }
    }

    // ===================================================================
    // Shutdown
    // ===================================================================

    /// Mark the peer for immediate shutdown (no close frame pending).
    pub fn mark_shutdown(&mut self, close_code: u16) {
        if self.mortality == Mortality::Live {
            self.mortality = Mortality::ShutdownWrite;
            self.close_code = close_code;
        }
    }

    /// Advance the shutdown progression.
    ///
    /// `Again` while waiting for the peer's FIN, `Done` once `DEAD`
    /// (the caller then frees the slot), `Fatal` when `shutdown(2)`
    /// fails on a healthy socket.
    pub fn advance_shutdown(&mut self, scratch: &mut [u8]) -> IoStatus {
        if self.mortality == Mortality::ShutdownWrite {
            // The layer drops back to TCP: anything still buffered is
            // no longer meaningful at this point.
            self.layer = Layer::Tcp;
            if let Some(conn) = &mut self.tls {
                tls::send_close_notify(&mut self.sock, conn);
            }
            if let Err(e) = self.sock.shutdown_write() {
                log::error!("shutdown(SHUT_WR) failed: {}", e);
                return IoStatus::Fatal;
            }
            self.mortality = Mortality::ShutdownRead;
        }

        if self.mortality == Mortality::ShutdownRead {
            // Read-and-discard until the peer also closes; consuming
            // stray bytes keeps the kernel from answering with RST.
            loop {
                let res = match &mut self.tls {
                    Some(conn) => tls::read_plaintext(&mut self.sock, conn, scratch),
                    None => self.sock.read(scratch),
                };
                match res {
                    Ok(0) => {
                        self.mortality = Mortality::Dead;
                        break;
                    }
                    Ok(n) => {
                        log::debug!("discarded {} bytes during shutdown", n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStatus::Again,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("read during shutdown failed: {}", e);
                        self.mortality = Mortality::Dead;
                        break;
                    }
                }
            }
        }

        debug_assert_eq!(self.mortality, Mortality::Dead);
        IoStatus::Done
    }
}

// =======================================================================
// Peer table
// =======================================================================

/// Fixed-capacity table of peer slots with index recycling.
///
/// A slot is either vacant or fully populated; freeing drops the whole
/// peer (closing the socket, which also removes every poll
/// registration for it) and returns the index to the free list.
pub struct PeerTable {
    slots: Vec<Option<Peer>>,
    free: Vec<u32>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        let mut free: Vec<u32> = (0..capacity as u32).collect();
        free.reverse();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Claim a slot. `None` when the table is full.
    pub fn insert(&mut self, peer: Peer) -> Option<u32> {
        let index = self.free.pop()?;
        debug_assert!(self.slots[index as usize].is_none());
        self.slots[index as usize] = Some(peer);
        Some(index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Peer> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    pub fn get(&self, index: u32) -> Option<&Peer> {
        self.slots.get(index as usize)?.as_ref()
    }

    /// Drop the peer and recycle its index.
    pub fn remove(&mut self, index: u32) -> Option<Peer> {
        let peer = self.slots.get_mut(index as usize)?.take()?;
        self.free.push(index);
        Some(peer)
    }

    /// Iterate every populated slot.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut Peer)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|p| (i as u32, p)))
    }

    /// Slot indices of peers eligible for fan-out delivery.
    pub fn live_ws_slots(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(p) if p.is_live_ws() => Some(i as u32),
                _ => None,
            })
            .collect()
    }
}
