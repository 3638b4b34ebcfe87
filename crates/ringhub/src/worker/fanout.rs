// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recipient-set expansion for outbound records.
//!
//! A drained outbound record names a recipient set drawn from this
//! worker's own peer table; expansion is entirely local. Delivery goes
//! through each peer's write machine: a partial write parks on the
//! peer and never blocks the fan-out loop. A recipient slot that is
//! vacant, recycled, or not yet (or no longer) a live WS peer simply
//! misses.

use crate::error::ServerError;
use crate::msg::{OutboundRecord, ParsedRecipients};
use crate::peer::PeerTable;
use crate::ring::buffer::RingProducer;
use crate::ring::queue::UpdateQueue;
use crate::ws::frame;

/// Close code carried by a wire-ready close frame, used to label the
/// CLOSE record handed to the app.
fn close_frame_code(frame_bytes: &[u8]) -> u16 {
    if frame_bytes.len() >= 4 && (frame_bytes[1] & 0x7F) >= 2 {
        u16::from_be_bytes([frame_bytes[2], frame_bytes[3]])
    } else {
        frame::CLOSE_NORMAL
    }
}

/// Remove a peer slot, announcing the departure to its app when the
/// app saw an OPEN.
pub(crate) fn retire_peer(
    peers: &mut PeerTable,
    slot: u32,
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    let Some(peer) = peers.remove(slot) else {
        return Ok(());
    };
    log::debug!("peer {} retired (close code {})", slot, peer.close_code);
    if peer.open_announced {
        let position = crate::msg::write_close(
            &mut inbound[peer.app as usize],
            slot,
            peer.close_code,
        );
        updates.enqueue(peer.app, position, true)?;
    }
    // Dropping the peer closes its socket; the poll instance forgets
    // the descriptor with it.
    Ok(())
}

/// Deliver one record to every recipient the tag selects.
pub(crate) fn deliver(
    peers: &mut PeerTable,
    record: &OutboundRecord<'_>,
    scratch: &mut [u8],
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    match record.recipients {
        ParsedRecipients::Single(slot) => {
            deliver_one(peers, slot, record, scratch, inbound, updates)
        }
        ParsedRecipients::Array(list) => {
            for slot in list.iter() {
                deliver_one(peers, slot, record, scratch, inbound, updates)?;
            }
            Ok(())
        }
        ParsedRecipients::Every => {
            for slot in peers.live_ws_slots() {
                deliver_one(peers, slot, record, scratch, inbound, updates)?;
            }
            Ok(())
        }
        ParsedRecipients::EveryExceptSingle(excluded) => {
            for slot in peers.live_ws_slots() {
                if slot != excluded {
                    deliver_one(peers, slot, record, scratch, inbound, updates)?;
                }
            }
            Ok(())
        }
        ParsedRecipients::EveryExceptArray(excluded) => {
            for slot in peers.live_ws_slots() {
                if !excluded.contains(slot) {
                    deliver_one(peers, slot, record, scratch, inbound, updates)?;
                }
            }
            Ok(())
        }
    }
}

fn deliver_one(
    peers: &mut PeerTable,
    slot: u32,
    record: &OutboundRecord<'_>,
    scratch: &mut [u8],
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    let Some(peer) = peers.get_mut(slot) else {
        // Stale client id: the slot was recycled or never existed.
        return Ok(());
    };
    if !peer.is_live_ws() {
        return Ok(());
    }

    if record.is_close() {
        peer.queue_close(record.frame.to_vec(), close_frame_code(record.frame));
    } else {
        peer.queue_frame(record.frame.to_vec());
    }

    super::pump_peer_writes(peers, slot, scratch, inbound, updates)
}
