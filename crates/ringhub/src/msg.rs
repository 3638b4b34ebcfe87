// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring record formats.
//!
//! Outbound (app -> worker) records carry a recipient-set tag, the
//! recipient slot indices the tag calls for, and a complete
//! server-to-client WebSocket frame, ready to be written to sockets:
//!
//! ```text
//! +------+----------------+--------------+----------------------+
//! | kind | count (ARRAY   | recipients   | WS frame             |
//! | (1B) | kinds only,4B) | (4B each)    | (header + payload)   |
//! +------+----------------+--------------+----------------------+
//! ```
//!
//! Inbound (worker -> app) records carry an event tag, the originating
//! peer slot, and the payload (or close code):
//!
//! ```text
//! +------+-----------+----------+---------+
//! | kind | peer (4B) | len (4B) | payload |
//! +------+-----------+----------+---------+
//! ```
//!
//! Multi-byte fields are written as explicit little-endian bytes;
//! records never cross a ring segment boundary, so a published window
//! always holds whole records.

use std::fmt;

use crate::ring::buffer::RingProducer;
use crate::ws::frame;

// =======================================================================
// Errors
// =======================================================================

/// Ring record corruption. Rings are process-internal, so any parse
/// failure is a fatal logic error, not a peer problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgError {
    UnknownKind(u8),
    Truncated,
}

impl fmt::Display for MsgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgError::UnknownKind(k) => write!(f, "unknown ring record kind {:#x}", k),
            MsgError::Truncated => write!(f, "truncated ring record"),
        }
    }
}

impl std::error::Error for MsgError {}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, MsgError> {
    let bytes: [u8; 4] = buf
        .get(at..at + 4)
        .ok_or(MsgError::Truncated)?
        .try_into()
        .map_err(|_| MsgError::Truncated)?;
    Ok(u32::from_le_bytes(bytes))
}

// =======================================================================
// Outbound records
// =======================================================================

const KIND_SINGLE: u8 = 0;
const KIND_ARRAY: u8 = 1;
const KIND_EVERY: u8 = 2;
const KIND_EVERY_EXCEPT_SINGLE: u8 = 3;
const KIND_EVERY_EXCEPT_ARRAY: u8 = 4;

/// Recipient set of an outbound record, as written by an app.
///
/// Slot indices are the worker-local halves of client ids; apps do
/// their own per-worker partitioning, so the worker never needs a
/// cross-worker lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientSet<'a> {
    Single(u32),
    Array(&'a [u32]),
    Every,
    EveryExceptSingle(u32),
    EveryExceptArray(&'a [u32]),
}

impl RecipientSet<'_> {
    fn kind(&self) -> u8 {
        match self {
            RecipientSet::Single(_) => KIND_SINGLE,
            RecipientSet::Array(_) => KIND_ARRAY,
            RecipientSet::Every => KIND_EVERY,
            RecipientSet::EveryExceptSingle(_) => KIND_EVERY_EXCEPT_SINGLE,
            RecipientSet::EveryExceptArray(_) => KIND_EVERY_EXCEPT_ARRAY,
        }
    }

    /// Encoded size of the recipient section (after the kind byte).
    fn encoded_len(&self) -> usize {
        match self {
            RecipientSet::Every => 0,
            RecipientSet::Single(_) | RecipientSet::EveryExceptSingle(_) => 4,
            RecipientSet::Array(list) | RecipientSet::EveryExceptArray(list) => 4 + 4 * list.len(),
        }
    }
}

/// Parsed recipient list view over record bytes.
#[derive(Debug, Clone, Copy)]
pub struct SlotList<'a> {
    bytes: &'a [u8],
}

impl<'a> SlotList<'a> {
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        self.bytes.chunks_exact(4).map(|c| {
            u32::from_le_bytes([c[0], c[1], c[2], c[3]])
        })
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.iter().any(|s| s == slot)
    }
}

/// A parsed outbound record borrowed from the ring window.
#[derive(Debug, Clone, Copy)]
pub enum ParsedRecipients<'a> {
    Single(u32),
    Array(SlotList<'a>),
    Every,
    EveryExceptSingle(u32),
    EveryExceptArray(SlotList<'a>),
}

/// One outbound record: recipients plus the wire-ready frame.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRecord<'a> {
    pub recipients: ParsedRecipients<'a>,
    pub frame: &'a [u8],
}

impl OutboundRecord<'_> {
    /// True when the frame is a close frame; the worker starts peer
    /// shutdown after flushing it.
    pub fn is_close(&self) -> bool {
        self.frame.first() == Some(&frame::SERVER_CLOSE)
    }
}

/// Append an outbound record to a ring. The frame payload is supplied
/// in two parts (composed write-buffer prefix + send payload) so the
/// app context can avoid concatenating them first. Returns the
/// producer's new private position, for the update queue.
pub fn write_outbound(
    prod: &mut RingProducer,
    recipients: RecipientSet<'_>,
    opcode: u8,
    payload_head: &[u8],
    payload_tail: &[u8],
) -> u64 {
    let payload_len = payload_head.len() + payload_tail.len();
    let header_len = frame::server_header_size(payload_len);
    let total = 1 + recipients.encoded_len() + header_len + payload_len;

    let buf = prod.reserve(total);
    buf[0] = recipients.kind();
    let mut at = 1;

    match recipients {
        RecipientSet::Every => {}
        RecipientSet::Single(slot) | RecipientSet::EveryExceptSingle(slot) => {
            buf[at..at + 4].copy_from_slice(&slot.to_le_bytes());
            at += 4;
        }
        RecipientSet::Array(list) | RecipientSet::EveryExceptArray(list) => {
            buf[at..at + 4].copy_from_slice(&(list.len() as u32).to_le_bytes());
            at += 4;
            for slot in list {
                buf[at..at + 4].copy_from_slice(&slot.to_le_bytes());
                at += 4;
            }
        }
    }

    at += frame::write_server_header(&mut buf[at..], opcode, payload_len);
    buf[at..at + payload_head.len()].copy_from_slice(payload_head);
    at += payload_head.len();
    buf[at..at + payload_tail.len()].copy_from_slice(payload_tail);
    at += payload_tail.len();
    debug_assert_eq!(at, total);

    prod.advance(total);
    prod.position()
}

/// Length of the server frame starting at `buf[0]`, or `Truncated`.
fn server_frame_len(buf: &[u8]) -> Result<usize, MsgError> {
    if buf.len() < 2 {
        return Err(MsgError::Truncated);
    }
    let len7 = (buf[1] & 0x7F) as usize;
    let (header, payload) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Err(MsgError::Truncated);
            }
            (4, u16::from_be_bytes([buf[2], buf[3]]) as usize)
        }
        127 => {
            if buf.len() < 10 {
                return Err(MsgError::Truncated);
            }
            let len = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            (10, len as usize)
        }
        n => (2, n),
    };
    Ok(header + payload)
}

/// Parse one outbound record from the front of `buf`.
///
/// Returns the record and its encoded length. `buf` must start at a
/// record boundary; an empty `buf` is reported by the caller, not here.
pub fn parse_outbound(buf: &[u8]) -> Result<(OutboundRecord<'_>, usize), MsgError> {
    let kind = *buf.first().ok_or(MsgError::Truncated)?;
    let mut at = 1;

    let recipients = match kind {
        KIND_EVERY => ParsedRecipients::Every,
        KIND_SINGLE | KIND_EVERY_EXCEPT_SINGLE => {
            let slot = read_u32(buf, at)?;
            at += 4;
            if kind == KIND_SINGLE {
                ParsedRecipients::Single(slot)
            } else {
                ParsedRecipients::EveryExceptSingle(slot)
            }
        }
        KIND_ARRAY | KIND_EVERY_EXCEPT_ARRAY => {
            let count = read_u32(buf, at)? as usize;
            at += 4;
            let bytes = buf.get(at..at + 4 * count).ok_or(MsgError::Truncated)?;
            at += 4 * count;
            let list = SlotList { bytes };
            if kind == KIND_ARRAY {
                ParsedRecipients::Array(list)
            } else {
                ParsedRecipients::EveryExceptArray(list)
            }
        }
        other => return Err(MsgError::UnknownKind(other)),
    };

    let frame_len = server_frame_len(&buf[at..])?;
    let frame = buf.get(at..at + frame_len).ok_or(MsgError::Truncated)?;
    Ok((
        OutboundRecord { recipients, frame },
        at + frame_len,
    ))
}

// =======================================================================
// Inbound records
// =======================================================================

const KIND_OPEN: u8 = 0;
const KIND_READ: u8 = 1;
const KIND_CLOSE: u8 = 2;

/// Inbound record header size: kind + peer + len.
const INBOUND_HEADER: usize = 9;

/// One inbound event delivered to an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRecord<'a> {
    /// Peer completed the upgrade.
    Open { peer: u32 },

    /// A complete message arrived; `is_text` mirrors the frame opcode.
    Read {
        peer: u32,
        is_text: bool,
        payload: &'a [u8],
    },

    /// Peer departed with the given close code.
    Close { peer: u32, code: u16 },
}

/// Append an OPEN record.
pub fn write_open(prod: &mut RingProducer, peer: u32) -> u64 {
    write_inbound(prod, KIND_OPEN, peer, &[], &[])
}

/// Append a READ record. The text flag travels in the first payload
/// byte so the record stays self-delimiting.
pub fn write_read(prod: &mut RingProducer, peer: u32, is_text: bool, payload: &[u8]) -> u64 {
    write_inbound(prod, KIND_READ, peer, &[u8::from(is_text)], payload)
}

/// Append a CLOSE record carrying the peer's close code.
pub fn write_close(prod: &mut RingProducer, peer: u32, code: u16) -> u64 {
    write_inbound(prod, KIND_CLOSE, peer, &code.to_le_bytes(), &[])
}

fn write_inbound(prod: &mut RingProducer, kind: u8, peer: u32, meta: &[u8], payload: &[u8]) -> u64 {
    let len = meta.len() + payload.len();
    let total = INBOUND_HEADER + len;
    let buf = prod.reserve(total);
    buf[0] = kind;
    buf[1..5].copy_from_slice(&peer.to_le_bytes());
    buf[5..9].copy_from_slice(&(len as u32).to_le_bytes());
    buf[9..9 + meta.len()].copy_from_slice(meta);
    buf[9 + meta.len()..total].copy_from_slice(payload);
    prod.advance(total);
    prod.position()
}

/// Parse one inbound record from the front of `buf`.
pub fn parse_inbound(buf: &[u8]) -> Result<(InboundRecord<'_>, usize), MsgError> {
    if buf.len() < INBOUND_HEADER {
        return Err(MsgError::Truncated);
    }
    let kind = buf[0];
    let peer = read_u32(buf, 1)?;
    let len = read_u32(buf, 5)? as usize;
    let body = buf
        .get(INBOUND_HEADER..INBOUND_HEADER + len)
        .ok_or(MsgError::Truncated)?;

    let record = match kind {
        KIND_OPEN => InboundRecord::Open { peer },
        KIND_READ => {
            let (&flag, payload) = body.split_first().ok_or(MsgError::Truncated)?;
            InboundRecord::Read {
                peer,
                is_text: flag != 0,
                payload,
            }
        }
        KIND_CLOSE => {
            if body.len() < 2 {
                return Err(MsgError::Truncated);
            }
            InboundRecord::Close {
                peer,
                code: u16::from_le_bytes([body[0], body[1]]),
            }
        }
        other => return Err(MsgError::UnknownKind(other)),
    };
    Ok((record, INBOUND_HEADER + len))
}
