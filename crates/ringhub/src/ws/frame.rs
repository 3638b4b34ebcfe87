// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RFC 6455 framing.
//!
//! Server-to-client frames are FIN-only and unmasked; the length prefix
//! is 1, 3 or 9 bytes depending on the payload size. Client-to-server
//! frames must be masked and may be fragmented; [`FrameAssembler`]
//! reassembles them incrementally across reads, with a configurable cap
//! on the reassembled message size.

use std::fmt;

/// FIN + text opcode byte of a server data frame.
pub const SERVER_TEXT: u8 = 0x81;

/// FIN + binary opcode byte of a server data frame.
pub const SERVER_BINARY: u8 = 0x82;

/// FIN + close opcode byte.
pub const SERVER_CLOSE: u8 = 0x88;

/// FIN + pong opcode byte.
pub const SERVER_PONG: u8 = 0x8A;

/// Payloads up to this length use the 1-byte length encoding.
pub const SMALL_PAYLOAD_MAX: usize = 125;

/// Payloads up to this length use the 0x7E + 2-byte length encoding.
pub const MEDIUM_PAYLOAD_MAX: usize = 65_535;

/// Largest header a frame can carry: 2 bytes + 8 length + 4 mask.
pub const MAX_HEADER_SIZE: usize = 14;

// Close codes (RFC 6455 section 7.4 plus the app/internal split).

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Protocol error (unmasked frame, bad opcode, bad fragmentation).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Unacceptable data type.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

/// Invalid payload (non-UTF-8 text).
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;

/// Message too big to process.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// First close code available to app callbacks.
pub const CLOSE_APP_MIN: u16 = 4000;

/// Last close code available to app callbacks.
pub const CLOSE_APP_MAX: u16 = 4899;

/// Whether a close code is in the range app callbacks may return;
/// [4900, 4999] is reserved for internal use.
pub fn is_app_close_code(code: u16) -> bool {
    (CLOSE_APP_MIN..=CLOSE_APP_MAX).contains(&code)
}

/// Number of header bytes a server frame needs for `payload_len`.
pub fn server_header_size(payload_len: usize) -> usize {
    if payload_len <= SMALL_PAYLOAD_MAX {
        2
    } else if payload_len <= MEDIUM_PAYLOAD_MAX {
        4
    } else {
        10
    }
}

/// Write a server frame header into `out`; returns the header length.
///
/// `out` must hold at least [`server_header_size`] bytes. All
/// multi-byte fields are written as explicit big-endian bytes.
pub fn write_server_header(out: &mut [u8], opcode: u8, payload_len: usize) -> usize {
    out[0] = opcode;
    if payload_len <= SMALL_PAYLOAD_MAX {
        out[1] = payload_len as u8;
        2
    } else if payload_len <= MEDIUM_PAYLOAD_MAX {
        out[1] = 0x7E;
        out[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        4
    } else {
        out[1] = 0x7F;
        out[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        10
    }
}

/// Encode a complete server data frame.
pub fn encode_server_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; server_header_size(payload.len()) + payload.len()];
    let header = write_server_header(&mut frame, opcode, payload.len());
    frame[header..].copy_from_slice(payload);
    frame
}

/// Encode a server close frame with a status code and optional reason.
pub fn encode_close_frame(code: u16, reason: &[u8]) -> Vec<u8> {
    debug_assert!(reason.len() <= SMALL_PAYLOAD_MAX - 2);
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    encode_server_frame(SERVER_CLOSE, &payload)
}

// =======================================================================
// Inbound decoding
// =======================================================================

/// One decoded inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete (possibly reassembled) data message.
    Message { is_text: bool, payload: Vec<u8> },

    /// Ping: the payload must be echoed in a pong.
    Ping(Vec<u8>),

    /// Pong: no action required.
    Pong,

    /// Close: code 1005 when the payload carried none.
    Close { code: u16 },
}

/// A protocol violation; carries the close code to send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameError {
    pub close_code: u16,
    pub reason: &'static str,
}

impl FrameError {
    fn protocol(reason: &'static str) -> Self {
        Self {
            close_code: CLOSE_PROTOCOL_ERROR,
            reason,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (close {})", self.reason, self.close_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Opcode> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Incremental decoder + fragmentation reassembler for one peer.
///
/// Bytes from the socket are appended with [`feed`](Self::feed); calls
/// to [`next`](Self::next) then pull complete events until `None`.
#[derive(Debug)]
pub struct FrameAssembler {
    /// Raw bytes not yet consumed by a complete frame.
    input: Vec<u8>,

    /// Read position in `input`; compacted opportunistically.
    input_pos: usize,

    /// Reassembly buffer for a fragmented message.
    fragments: Vec<u8>,

    /// Data opcode of the in-progress fragmented message.
    fragment_opcode: Option<Opcode>,

    /// Cap on a reassembled message.
    max_msg_size: usize,
}

impl FrameAssembler {
    pub fn new(max_msg_size: usize) -> Self {
        Self {
            input: Vec::new(),
            input_pos: 0,
            fragments: Vec::new(),
            fragment_opcode: None,
            max_msg_size,
        }
    }

    /// Append raw socket bytes.
    pub fn feed(&mut self, data: &[u8]) {
        if self.input_pos > 0 && self.input_pos >= self.input.len() / 2 {
            self.input.drain(..self.input_pos);
            self.input_pos = 0;
        }
        self.input.extend_from_slice(data);
    }

    /// Buffered bytes not yet decoded.
    pub fn pending_len(&self) -> usize {
        self.input.len() - self.input_pos
    }

    /// Decode the next complete event, if one is buffered.
    pub fn next(&mut self) -> Result<Option<FrameEvent>, FrameError> {
        loop {
            let Some((header, opcode, fin, payload_len)) = self.parse_header()? else {
                return Ok(None);
            };
            let total = header + payload_len;
            if self.pending_len() < total {
                return Ok(None);
            }

            // Unmask in place: the masking key is the last 4 header bytes.
            let start = self.input_pos;
            let (mask_base, payload_base) = (start + header - 4, start + header);
            let mask = [
                self.input[mask_base],
                self.input[mask_base + 1],
                self.input[mask_base + 2],
                self.input[mask_base + 3],
            ];
            for i in 0..payload_len {
                self.input[payload_base + i] ^= mask[i % 4];
            }
            let payload = self.input[payload_base..payload_base + payload_len].to_vec();
            self.input_pos += total;

            if opcode.is_control() {
                return self.control_event(opcode, payload).map(Some);
            }

            match self.data_event(opcode, fin, payload)? {
                Some(event) => return Ok(Some(event)),
                // Mid-fragment: keep pulling frames.
                None => continue,
            }
        }
    }

    /// Parse the frame header at the current read position.
    ///
    /// Returns `(header_len, opcode, fin, payload_len)`, or `None` when
    /// more bytes are needed.
    #[allow(clippy::type_complexity)]
    fn parse_header(&self) -> Result<Option<(usize, Opcode, bool, usize)>, FrameError> {
        let buf = &self.input[self.input_pos..];
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            // No extension was negotiated, so RSV bits must be clear.
            return Err(FrameError::protocol("nonzero RSV bits"));
        }
        let Some(opcode) = Opcode::from_bits(buf[0] & 0x0F) else {
            return Err(FrameError::protocol("unknown opcode"));
        };
        if buf[1] & 0x80 == 0 {
            return Err(FrameError::protocol("client frame not masked"));
        }

        let len7 = (buf[1] & 0x7F) as usize;
        let (ext_len, payload_len) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (2, u16::from_be_bytes([buf[2], buf[3]]) as usize)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len > self.max_msg_size as u64 {
                    return Err(FrameError {
                        close_code: CLOSE_TOO_BIG,
                        reason: "frame exceeds maximum message size",
                    });
                }
                (8, len as usize)
            }
            n => (0, n),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::protocol("fragmented control frame"));
            }
            if payload_len > SMALL_PAYLOAD_MAX {
                return Err(FrameError::protocol("oversized control frame"));
            }
        }
        if payload_len > self.max_msg_size {
            return Err(FrameError {
                close_code: CLOSE_TOO_BIG,
                reason: "frame exceeds maximum message size",
            });
        }

        let header_len = 2 + ext_len + 4;
        if buf.len() < header_len {
            return Ok(None);
        }
        Ok(Some((header_len, opcode, fin, payload_len)))
    }

    fn control_event(&self, opcode: Opcode, payload: Vec<u8>) -> Result<FrameEvent, FrameError> {
        match opcode {
            Opcode::Ping => Ok(FrameEvent::Ping(payload)),
            Opcode::Pong => Ok(FrameEvent::Pong),
            Opcode::Close => {
                let code = match payload.len() {
                    0 => 1005, // no status present
                    1 => return Err(FrameError::protocol("close frame with 1-byte payload")),
                    _ => u16::from_be_bytes([payload[0], payload[1]]),
                };
                Ok(FrameEvent::Close { code })
            }
            _ => unreachable!("data opcode routed to control_event"),
        }
    }

    /// Feed one data frame into reassembly. Returns an event when a
    /// message completes.
    fn data_event(
        &mut self,
        opcode: Opcode,
        fin: bool,
        payload: Vec<u8>,
    ) -> Result<Option<FrameEvent>, FrameError> {
        match (opcode, self.fragment_opcode) {
            (Opcode::Continuation, None) => {
                Err(FrameError::protocol("continuation without a message"))
            }
            (Opcode::Text | Opcode::Binary, Some(_)) => {
                Err(FrameError::protocol("new message inside fragmented message"))
            }
            (Opcode::Continuation, Some(first)) => {
                if self.fragments.len() + payload.len() > self.max_msg_size {
                    return Err(FrameError {
                        close_code: CLOSE_TOO_BIG,
                        reason: "reassembled message exceeds maximum size",
                    });
                }
                self.fragments.extend_from_slice(&payload);
                if !fin {
                    return Ok(None);
                }
                self.fragment_opcode = None;
                let complete = std::mem::take(&mut self.fragments);
                self.finish_message(first, complete).map(Some)
            }
            (first @ (Opcode::Text | Opcode::Binary), None) => {
                if fin {
                    return self.finish_message(first, payload).map(Some);
                }
                self.fragment_opcode = Some(first);
                self.fragments = payload;
                Ok(None)
            }
            _ => unreachable!("control opcode routed to data_event"),
        }
    }

    fn finish_message(&self, opcode: Opcode, payload: Vec<u8>) -> Result<FrameEvent, FrameError> {
        let is_text = opcode == Opcode::Text;
        if is_text && std::str::from_utf8(&payload).is_err() {
            return Err(FrameError {
                close_code: CLOSE_INVALID_PAYLOAD,
                reason: "text message is not valid UTF-8",
            });
        }
        Ok(FrameEvent::Message { is_text, payload })
    }
}
