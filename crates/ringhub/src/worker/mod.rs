// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker I/O threads.
//!
//! Each worker runs an edge-triggered poll loop over its listening
//! sockets, its peers, and its wake eventfd. Dispatch per peer follows
//! the `(layer, mortality)` pair; app-originated messages drained from
//! the outbound rings fan out through [`fanout`].
//!
//! Token layout: listeners take `0..n`, the wake eventfd takes `n`,
//! and peer slot `i` takes `n + 1 + i`.

pub mod fanout;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{
    Config, ListenerConfig, DEFAULT_UPDATE_QUEUE_SIZE, MAX_POLL_EVENTS, MAX_UPGRADE_REQUEST_SIZE,
    WORKER_READ_BUF_SIZE,
};
use crate::error::{IoStatus, ServerError};
use crate::logging;
use crate::msg;
use crate::peer::{tls, Layer, Mortality, Peer, PeerTable};
use crate::ring::buffer::RingProducer;
use crate::ring::pair::WorkerLinks;
use crate::ring::queue::UpdateQueue;
use crate::ws::frame::{self, FrameEvent};
use crate::ws::handshake;

pub(crate) use fanout::retire_peer;

/// One listening endpoint, resolved for worker use.
pub struct ListenerBinding {
    pub cfg: ListenerConfig,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

/// Bind a listener with `SO_REUSEADDR` + `SO_REUSEPORT` so every
/// worker owns its own accept queue on the same port.
fn bind_listener(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// One I/O worker thread.
pub struct Worker {
    index: u32,
    poll: Poll,
    listeners: Vec<(mio::net::TcpListener, ListenerBinding)>,
    peers: PeerTable,
    links: WorkerLinks,
    updates: UpdateQueue,
    shutdown: Arc<AtomicBool>,
    rbuf: Vec<u8>,
    max_ws_msg_size: usize,
}

impl Worker {
    pub fn new(
        index: u32,
        config: &Config,
        bindings: Vec<ListenerBinding>,
        links: WorkerLinks,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(|source| ServerError::Poll { source })?;

        let mut listeners = Vec::with_capacity(bindings.len());
        for (i, binding) in bindings.into_iter().enumerate() {
            let addr = SocketAddr::new(binding.cfg.addr, binding.cfg.port);
            let mut listener = bind_listener(addr).map_err(|source| ServerError::Socket {
                addr: addr.to_string(),
                source,
            })?;
            poll.registry()
                .register(&mut listener, Token(i), Interest::READABLE)
                .map_err(|source| ServerError::Poll { source })?;
            listeners.push((listener, binding));
        }

        let wake_fd = links.wake.eventfd.raw_fd();
        poll.registry()
            .register(
                &mut SourceFd(&wake_fd),
                Token(listeners.len()),
                Interest::READABLE,
            )
            .map_err(|source| ServerError::Poll { source })?;

        Ok(Self {
            index,
            poll,
            listeners,
            peers: PeerTable::new(config.peer_slots),
            links,
            updates: UpdateQueue::new(DEFAULT_UPDATE_QUEUE_SIZE),
            shutdown,
            rbuf: vec![0u8; WORKER_READ_BUF_SIZE],
            max_ws_msg_size: config.max_ws_msg_size,
        })
    }

    fn peer_token_base(&self) -> usize {
        self.listeners.len() + 1
    }

    /// The worker event loop. Returns on cooperative shutdown or a
    /// fatal condition.
    pub fn run(mut self) -> Result<(), ServerError> {
        logging::set_thread_tag(format!("worker #{}", self.index));
        log::info!(
            "worker up: {} listeners, {} peer slots",
            self.listeners.len(),
            self.peers.capacity()
        );

        let mut events = Events::with_capacity(MAX_POLL_EVENTS);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.drain_outbound()?;
            self.flush_updates();

            // Idle protocol: announce sleep, re-scan, then block. A
            // producer that published after the re-scan saw ASLEEP and
            // signals the eventfd, so the poll below returns at once.
            self.links.wake.sleep.fall_asleep();
            if self.shutdown.load(Ordering::Acquire) || self.outbound_pending() {
                self.links.wake.sleep.wake_up();
                continue;
            }
            let poll_result = self.poll.poll(&mut events, None);
            self.links.wake.sleep.wake_up();
            if let Err(e) = poll_result {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Poll { source: e });
            }

            for event in events.iter() {
                let token = event.token().0;
                if token < self.listeners.len() {
                    self.accept_all(token)?;
                } else if token == self.listeners.len() {
                    self.links.wake.eventfd.drain();
                } else {
                    let slot = (token - self.peer_token_base()) as u32;
                    let Self {
                        peers,
                        links,
                        updates,
                        rbuf,
                        ..
                    } = &mut self;
                    handle_peer_event(
                        peers,
                        slot,
                        event.is_readable(),
                        event.is_writable(),
                        rbuf,
                        &mut links.inbound,
                        updates,
                    )?;
                }
            }
        }

        // Cooperative shutdown: flush what we owe the apps, then drop
        // every peer (closing the sockets).
        self.flush_updates();
        log::info!("worker down ({} peers dropped)", self.peers.live_count());
        Ok(())
    }

    /// True when any outbound ring has published data.
    fn outbound_pending(&mut self) -> bool {
        self.links.outbound.iter_mut().any(|cons| !cons.is_empty())
    }

    /// Drain every app's outbound ring, fanning records out to peers,
    /// then record read announcements.
    fn drain_outbound(&mut self) -> Result<(), ServerError> {
        let Self {
            peers,
            links,
            updates,
            rbuf,
            ..
        } = &mut *self;

        for (app, cons) in links.outbound.iter_mut().enumerate() {
            cons.refresh();
            let mut drained_any = false;
            loop {
                let chunk = cons.readable();
                if chunk.is_empty() {
                    break;
                }
                let mut consumed = 0;
                while consumed < chunk.len() {
                    let (record, used) = msg::parse_outbound(&chunk[consumed..]).map_err(|e| {
                        ServerError::Thread {
                            name: "worker".to_string(),
                            reason: format!("outbound ring corrupt: {}", e),
                        }
                    })?;
                    fanout::deliver(peers, &record, rbuf, &mut links.inbound, updates)?;
                    consumed += used;
                }
                cons.consume(consumed);
                drained_any = true;
            }
            if drained_any {
                updates.enqueue(app as u32, cons.position(), false)?;
            }
        }
        Ok(())
    }

    /// Publish pending cursor updates and wake sleeping apps.
    fn flush_updates(&mut self) {
        self.updates
            .flush(&self.links.inbound, &self.links.outbound, &self.links.app_wakes);
    }

    /// Accept until the listener would block.
    fn accept_all(&mut self, listener_index: usize) -> Result<(), ServerError> {
        loop {
            let (listener, binding) = &self.listeners[listener_index];
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    let tls_session = match &binding.tls {
                        Some(config) => match tls::new_session(config) {
                            Ok(session) => Some(session),
                            Err(e) => {
                                log::warn!("TLS session setup failed for {}: {}", addr, e);
                                continue;
                            }
                        },
                        None => None,
                    };
                    let app = binding.cfg.app as u32;
                    let peer = Peer::new(Box::new(stream), tls_session, app, self.max_ws_msg_size);

                    let Some(slot) = self.peers.insert(peer) else {
                        log::warn!("peer table full, dropping connection from {}", addr);
                        continue;
                    };
                    let token = Token(self.peer_token_base() + slot as usize);
                    let fd = match self.peers.get(slot) {
                        Some(p) => p.sock.raw_fd(),
                        None => continue,
                    };
                    if let Err(e) = self.poll.registry().register(
                        &mut SourceFd(&fd),
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("poll registration failed for {}: {}", addr, e);
                        self.peers.remove(slot);
                        continue;
                    }
                    log::debug!("accepted {} as peer {} (app {})", addr, slot, app);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }
}

// =======================================================================
// Per-peer event handling
// =======================================================================

/// Drive one peer's write machine, progressing shutdown when the
/// backlog drains into a pending close.
pub(crate) fn pump_peer_writes(
    peers: &mut PeerTable,
    slot: u32,
    scratch: &mut [u8],
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    let Some(peer) = peers.get_mut(slot) else {
        return Ok(());
    };
    match peer.flush_writes() {
        IoStatus::Done => {
            if peer.mortality != Mortality::Live {
                match peer.advance_shutdown(scratch) {
                    IoStatus::Done | IoStatus::ClosePeer => {
                        retire_peer(peers, slot, inbound, updates)?;
                    }
                    IoStatus::Again => {}
                    IoStatus::Fatal => {
                        return Err(ServerError::Thread {
                            name: "worker".to_string(),
                            reason: "shutdown(2) failed on a healthy socket".to_string(),
                        })
                    }
                }
            }
        }
        IoStatus::Again => {}
        IoStatus::ClosePeer => retire_peer(peers, slot, inbound, updates)?,
        IoStatus::Fatal => {
            return Err(ServerError::Thread {
                name: "worker".to_string(),
                reason: "fatal peer write failure".to_string(),
            })
        }
    }
    Ok(())
}

/// Dispatch one readiness event for a peer slot.
pub(crate) fn handle_peer_event(
    peers: &mut PeerTable,
    slot: u32,
    readable: bool,
    writable: bool,
    rbuf: &mut [u8],
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    if peers.get(slot).is_none() {
        // Already retired; late event for a closed descriptor.
        return Ok(());
    }

    if writable {
        if let Some(peer) = peers.get_mut(slot) {
            peer.is_writing = false;
        }
        pump_peer_writes(peers, slot, rbuf, inbound, updates)?;
    }

    let Some(peer) = peers.get_mut(slot) else {
        return Ok(());
    };

    if peer.mortality != Mortality::Live {
        // Mid-shutdown: the only interesting event is the peer's FIN.
        match peer.advance_shutdown(rbuf) {
            IoStatus::Done | IoStatus::ClosePeer => retire_peer(peers, slot, inbound, updates)?,
            IoStatus::Again => {}
            IoStatus::Fatal => {
                return Err(ServerError::Thread {
                    name: "worker".to_string(),
                    reason: "shutdown(2) failed on a healthy socket".to_string(),
                })
            }
        }
        return Ok(());
    }

    if readable {
        match peer.layer {
            Layer::Tls => tls_step(peers, slot, rbuf, inbound, updates)?,
            Layer::Http => http_read(peers, slot, rbuf, inbound, updates)?,
            Layer::Ws => ws_read(peers, slot, rbuf, inbound, updates)?,
            // A live peer never sits at the raw TCP layer; shutdown
            // drops back here, and that path returned above.
            Layer::Tcp => {}
        }
    }
    Ok(())
}

/// Drive the TLS handshake; on completion the peer surfaces at the
/// HTTP layer and any buffered plaintext is consumed immediately.
fn tls_step(
    peers: &mut PeerTable,
    slot: u32,
    rbuf: &mut [u8],
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    let Some(peer) = peers.get_mut(slot) else {
        return Ok(());
    };
    let Some(conn) = &mut peer.tls else {
        peer.layer = Layer::Http;
        return http_read(peers, slot, rbuf, inbound, updates);
    };
    match tls::handshake_step(&mut peer.sock, conn) {
        Ok(true) => {
            log::debug!("peer {} TLS handshake complete", slot);
            peer.layer = Layer::Http;
            http_read(peers, slot, rbuf, inbound, updates)
        }
        Ok(false) => Ok(()),
        Err(e) => {
            log::debug!("peer {} TLS handshake failed: {}", slot, e);
            retire_peer(peers, slot, inbound, updates)
        }
    }
}

/// Accumulate and answer the HTTP upgrade request.
fn http_read(
    peers: &mut PeerTable,
    slot: u32,
    rbuf: &mut [u8],
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    loop {
        let Some(peer) = peers.get_mut(slot) else {
            return Ok(());
        };
        let (status, n) = peer.read(rbuf);
        match status {
            IoStatus::Done => {
                peer.upgrade_buf.extend_from_slice(&rbuf[..n]);
                if let Some(end) = handshake::find_request_end(&peer.upgrade_buf) {
                    match handshake::parse_upgrade(&peer.upgrade_buf[..end]) {
                        Ok(request) => {
                            let accept = handshake::accept_key(&request.key);
                            peer.queue_frame(handshake::response_101(&accept));
                            peer.layer = Layer::Ws;
                            peer.open_announced = true;

                            // A client may pipeline frames behind the
                            // upgrade request.
                            let leftover = peer.upgrade_buf.split_off(end);
                            peer.upgrade_buf = Vec::new();
                            if !leftover.is_empty() {
                                peer.assembler.feed(&leftover);
                            }

                            log::debug!("peer {} upgraded on {}", slot, request.path);
                            let position = msg::write_open(&mut inbound[peer.app as usize], slot);
                            updates.enqueue(peer.app, position, true)?;

                            process_frames(peers, slot, inbound, updates)?;
                            return ws_read(peers, slot, rbuf, inbound, updates);
                        }
                        Err(e) => {
                            log::debug!("peer {} bad upgrade: {}", slot, e);
                            peer.queue_close(
                                handshake::response_400().to_vec(),
                                frame::CLOSE_PROTOCOL_ERROR,
                            );
                            return pump_peer_writes(peers, slot, rbuf, inbound, updates);
                        }
                    }
                }
                if peer.upgrade_buf.len() > MAX_UPGRADE_REQUEST_SIZE {
                    log::debug!("peer {} oversized upgrade request", slot);
                    peer.queue_close(
                        handshake::response_400().to_vec(),
                        frame::CLOSE_PROTOCOL_ERROR,
                    );
                    return pump_peer_writes(peers, slot, rbuf, inbound, updates);
                }
            }
            IoStatus::Again => return pump_peer_writes(peers, slot, rbuf, inbound, updates),
            _ => return retire_peer(peers, slot, inbound, updates),
        }
    }
}

/// Pull decoded frame events out of the peer's assembler.
///
/// READ records flow to the owning app; pings are answered in place;
/// a close frame (or protocol violation) queues the close reply and
/// stops further parsing.
fn process_frames(
    peers: &mut PeerTable,
    slot: u32,
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    loop {
        let Some(peer) = peers.get_mut(slot) else {
            return Ok(());
        };
        if peer.mortality != Mortality::Live {
            return Ok(());
        }
        match peer.assembler.next() {
            Ok(Some(FrameEvent::Message { is_text, payload })) => {
                let position =
                    msg::write_read(&mut inbound[peer.app as usize], slot, is_text, &payload);
                updates.enqueue(peer.app, position, true)?;
            }
            Ok(Some(FrameEvent::Ping(payload))) => {
                peer.queue_frame(frame::encode_server_frame(frame::SERVER_PONG, &payload));
            }
            Ok(Some(FrameEvent::Pong)) => {}
            Ok(Some(FrameEvent::Close { code })) => {
                // Echo the close; 1005 (no code on the wire) answers
                // with a bare normal closure.
                let echo = if code == 1005 { frame::CLOSE_NORMAL } else { code };
                peer.queue_close(frame::encode_close_frame(echo, b""), echo);
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                log::debug!("peer {} protocol violation: {}", slot, e);
                peer.queue_close(
                    frame::encode_close_frame(e.close_code, e.reason.as_bytes()),
                    e.close_code,
                );
                return Ok(());
            }
        }
    }
}

/// Read WS-layer bytes until the socket would block, decoding frames
/// as they complete.
fn ws_read(
    peers: &mut PeerTable,
    slot: u32,
    rbuf: &mut [u8],
    inbound: &mut [RingProducer],
    updates: &mut UpdateQueue,
) -> Result<(), ServerError> {
    loop {
        let Some(peer) = peers.get_mut(slot) else {
            return Ok(());
        };
        if peer.mortality != Mortality::Live {
            break;
        }
        let (status, n) = peer.read(rbuf);
        match status {
            IoStatus::Done => {
                peer.assembler.feed(&rbuf[..n]);
                process_frames(peers, slot, inbound, updates)?;
            }
            IoStatus::Again => break,
            _ => {
                // EOF without a close frame, or a socket error.
                return retire_peer(peers, slot, inbound, updates);
            }
        }
    }
    // Push out any pong or close queued while parsing.
    pump_peer_writes(peers, slot, rbuf, inbound, updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::InboundRecord;
    use crate::peer::socket::mock::{MockHandle, MockSocket};
    use crate::ring::buffer::{self, RingConsumer};

    const UPGRADE: &str = "GET /chat HTTP/1.1\r\n\
        Host: example.net\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    struct Fixture {
        peers: PeerTable,
        inbound: Vec<RingProducer>,
        inbound_cons: Vec<RingConsumer>,
        updates: UpdateQueue,
        rbuf: Vec<u8>,
    }

    fn fixture() -> (Fixture, u32, MockHandle) {
        let mut peers = PeerTable::new(8);
        let (sock, handle) = MockSocket::new();
        let peer = Peer::new(Box::new(sock), None, 0, 1 << 20);
        let slot = peers.insert(peer).unwrap();
        let (prod, cons) = buffer::channel(4096, 1.5);
        (
            Fixture {
                peers,
                inbound: vec![prod],
                inbound_cons: vec![cons],
                updates: UpdateQueue::new(8),
                rbuf: vec![0u8; 4096],
            },
            slot,
            handle,
        )
    }

    fn drain_inbound(fx: &mut Fixture) -> Vec<u8> {
        fx.inbound[0].publish();
        let cons = &mut fx.inbound_cons[0];
        cons.refresh();
        let mut out = Vec::new();
        loop {
            let chunk = cons.readable();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len();
            out.extend_from_slice(chunk);
            cons.consume(n);
        }
        out
    }

    fn masked(first_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [7u8, 21, 9, 3];
        let mut out = vec![first_byte, 0x80 | payload.len() as u8];
        out.extend_from_slice(&mask);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        out
    }

    #[test]
    fn test_upgrade_flow_emits_open_and_101() {
        let (mut fx, slot, handle) = fixture();
        handle.feed(UPGRADE.as_bytes());

        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        let peer = fx.peers.get(slot).unwrap();
        assert_eq!(peer.layer, Layer::Ws);
        assert!(peer.open_announced);

        let written = handle.written();
        let text = std::str::from_utf8(&written).unwrap();
        assert!(text.starts_with("HTTP/1.1 101"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let bytes = drain_inbound(&mut fx);
        let (rec, _) = msg::parse_inbound(&bytes).unwrap();
        assert_eq!(rec, InboundRecord::Open { peer: slot });
    }

    #[test]
    fn test_bad_upgrade_gets_400_and_shutdown() {
        let (mut fx, slot, handle) = fixture();
        handle.feed(b"GET / HTTP/1.0\r\n\r\n");

        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        let written = handle.written();
        assert!(written.starts_with(b"HTTP/1.1 400"));
        assert!(handle.fin_sent());
        // OPEN never reached the app, so no record was produced.
        assert!(drain_inbound(&mut fx).is_empty());
    }

    #[test]
    fn test_message_after_upgrade_reaches_app() {
        let (mut fx, slot, handle) = fixture();
        handle.feed(UPGRADE.as_bytes());
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();
        let _ = drain_inbound(&mut fx);

        handle.feed(&masked(0x81, b"hi!"));
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        let bytes = drain_inbound(&mut fx);
        let (rec, _) = msg::parse_inbound(&bytes).unwrap();
        assert_eq!(
            rec,
            InboundRecord::Read {
                peer: slot,
                is_text: true,
                payload: b"hi!"
            }
        );
    }

    #[test]
    fn test_pipelined_frame_behind_upgrade() {
        let (mut fx, slot, handle) = fixture();
        let mut bytes = UPGRADE.as_bytes().to_vec();
        bytes.extend_from_slice(&masked(0x81, b"early"));
        handle.feed(&bytes);

        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        let bytes = drain_inbound(&mut fx);
        let (open, used) = msg::parse_inbound(&bytes).unwrap();
        assert_eq!(open, InboundRecord::Open { peer: slot });
        let (read, _) = msg::parse_inbound(&bytes[used..]).unwrap();
        assert_eq!(
            read,
            InboundRecord::Read {
                peer: slot,
                is_text: true,
                payload: b"early"
            }
        );
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut fx, slot, handle) = fixture();
        handle.feed(UPGRADE.as_bytes());
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();
        handle.clear_written();

        handle.feed(&masked(0x89, b"tick"));
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        let mut expected = vec![frame::SERVER_PONG, 4];
        expected.extend_from_slice(b"tick");
        assert_eq!(handle.written(), expected);
    }

    #[test]
    fn test_client_close_echoed_and_reported() {
        let (mut fx, slot, handle) = fixture();
        handle.feed(UPGRADE.as_bytes());
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();
        let _ = drain_inbound(&mut fx);
        handle.clear_written();

        let close_payload = 4242u16.to_be_bytes();
        handle.feed(&masked(0x88, &close_payload));
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        // Close echoed, FIN sent, waiting for the peer's FIN.
        assert_eq!(handle.written(), frame::encode_close_frame(4242, b""));
        assert!(handle.fin_sent());

        // Peer FIN: slot is retired and the app hears CLOSE.
        handle.set_eof();
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();
        assert_eq!(fx.peers.live_count(), 0);

        let bytes = drain_inbound(&mut fx);
        let (rec, _) = msg::parse_inbound(&bytes).unwrap();
        assert_eq!(rec, InboundRecord::Close { peer: slot, code: 4242 });
    }

    #[test]
    fn test_protocol_error_closes_with_1002() {
        let (mut fx, slot, handle) = fixture();
        handle.feed(UPGRADE.as_bytes());
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();
        let _ = drain_inbound(&mut fx);
        handle.clear_written();

        // Unmasked frame: protocol violation.
        handle.feed(&[0x81, 0x01, b'x']);
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        let written = handle.written();
        assert_eq!(written[0], frame::SERVER_CLOSE);
        assert_eq!(
            u16::from_be_bytes([written[2], written[3]]),
            frame::CLOSE_PROTOCOL_ERROR
        );
        assert!(handle.fin_sent());
    }

    #[test]
    fn test_abrupt_eof_reports_1006() {
        let (mut fx, slot, handle) = fixture();
        handle.feed(UPGRADE.as_bytes());
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();
        let _ = drain_inbound(&mut fx);

        handle.set_eof();
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            false,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();

        assert_eq!(fx.peers.live_count(), 0);
        let bytes = drain_inbound(&mut fx);
        let (rec, _) = msg::parse_inbound(&bytes).unwrap();
        assert_eq!(rec, InboundRecord::Close { peer: slot, code: 1006 });
    }

    #[test]
    fn test_stale_event_ignored() {
        let (mut fx, slot, _) = fixture();
        fx.peers.remove(slot).unwrap();
        handle_peer_event(
            &mut fx.peers,
            slot,
            true,
            true,
            &mut fx.rbuf,
            &mut fx.inbound,
            &mut fx.updates,
        )
        .unwrap();
    }
}
