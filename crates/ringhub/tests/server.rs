// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests over real sockets: a running server, plain TCP
//! clients doing the upgrade by hand, and byte-exact frame checks.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ringhub::{
    AppConfig, AppContext, AppHandler, ClientId, Config, Control, ListenerConfig, Message, Server,
};

/// Reserve an ephemeral port number for the server to bind.
fn pick_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn config_on(port: u16, workers: usize) -> Config {
    Config {
        worker_count: workers,
        apps: vec![AppConfig::new("test")],
        listeners: vec![ListenerConfig {
            addr: "127.0.0.1".parse().unwrap(),
            port,
            app: 0,
            tls: None,
        }],
        ..Config::default()
    }
}

/// Minimal blocking WebSocket client.
struct WsClient {
    stream: TcpStream,
}

impl WsClient {
    fn connect(port: u16) -> WsClient {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut client = WsClient { stream };

        let request = "GET / HTTP/1.1\r\n\
            Host: 127.0.0.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        client.stream.write_all(request.as_bytes()).unwrap();

        // Read headers up to the blank line.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 101"), "bad response: {}", text);
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        client
    }

    fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x80 | opcode];
        if payload.len() <= 125 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 65_535 {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        self.stream.write_all(&frame).unwrap();
    }

    /// Read one server frame; returns (first byte, payload).
    fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).unwrap();
        assert_eq!(header[1] & 0x80, 0, "server frames are unmasked");
        let len = match header[1] as usize {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n,
        };
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).unwrap();
        (header[0], payload)
    }

    /// Read raw bytes until EOF.
    fn read_to_eof(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        let _ = self.stream.read_to_end(&mut rest);
        rest
    }
}

// =======================================================================
// Apps under test
// =======================================================================

struct Echo;

impl AppHandler for Echo {
    fn read(&mut self, ctx: &mut AppContext<'_>, _client: ClientId, msg: Message<'_>) -> Control {
        ctx.to_cur(msg.is_text, msg.payload);
        Control::Continue
    }
}

struct Broadcast;

impl AppHandler for Broadcast {
    fn read(&mut self, ctx: &mut AppContext<'_>, _client: ClientId, msg: Message<'_>) -> Control {
        ctx.to_every(msg.is_text, msg.payload);
        Control::Continue
    }
}

struct RejectWith4321 {
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl AppHandler for RejectWith4321 {
    fn open(&mut self, _ctx: &mut AppContext<'_>, _client: ClientId) -> Control {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Control::Continue
    }

    fn read(&mut self, _ctx: &mut AppContext<'_>, _client: ClientId, _msg: Message<'_>) -> Control {
        Control::Close(4321)
    }

    fn close(&mut self, _ctx: &mut AppContext<'_>, _client: ClientId, _code: u16) -> Control {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Control::Continue
    }
}

// =======================================================================
// Tests
// =======================================================================

#[test]
fn test_echo_exact_frame_bytes() {
    let port = pick_port();
    let server = Server::start(config_on(port, 1), vec![Box::new(Echo)]).unwrap();

    let mut client = WsClient::connect(port);
    client.send_frame(0x1, b"hi!");

    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"hi!");

    drop(client);
    server.stop().unwrap();
}

#[test]
fn test_echo_across_two_workers() {
    let port = pick_port();
    let server = Server::start(config_on(port, 2), vec![Box::new(Echo)]).unwrap();

    // Several clients; the kernel spreads them over the two accept
    // queues, and each echo must come back on the right socket.
    let mut clients: Vec<WsClient> = (0..4).map(|_| WsClient::connect(port)).collect();
    for (i, client) in clients.iter_mut().enumerate() {
        let text = format!("client {}", i);
        client.send_frame(0x1, text.as_bytes());
    }
    for (i, client) in clients.iter_mut().enumerate() {
        let (first, payload) = client.read_frame();
        assert_eq!(first, 0x81);
        assert_eq!(payload, format!("client {}", i).as_bytes());
    }

    drop(clients);
    server.stop().unwrap();
}

#[test]
fn test_broadcast_reaches_every_client() {
    let port = pick_port();
    let server = Server::start(config_on(port, 2), vec![Box::new(Broadcast)]).unwrap();

    let mut a = WsClient::connect(port);
    let mut b = WsClient::connect(port);
    let mut c = WsClient::connect(port);
    // Both handshakes finished; the broadcast set is all three.
    std::thread::sleep(Duration::from_millis(100));

    a.send_frame(0x1, b"X");

    for client in [&mut a, &mut b, &mut c] {
        let (first, payload) = client.read_frame();
        assert_eq!(first, 0x81);
        assert_eq!(payload, b"X");
    }

    drop((a, b, c));
    server.stop().unwrap();
}

#[test]
fn test_70k_payload_roundtrip() {
    let port = pick_port();
    let server = Server::start(config_on(port, 1), vec![Box::new(Echo)]).unwrap();

    let payload: Vec<u8> = (0..70 * 1024).map(|i| (i % 256) as u8).collect();
    let mut client = WsClient::connect(port);
    client.send_frame(0x2, &payload);

    let (first, echoed) = client.read_frame();
    assert_eq!(first, 0x82);
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed, payload);

    drop(client);
    server.stop().unwrap();
}

#[test]
fn test_fragmented_message_reassembled() {
    let port = pick_port();
    let server = Server::start(config_on(port, 1), vec![Box::new(Echo)]).unwrap();

    // Frames are built by hand here so FIN can be controlled.
    let mut client = WsClient::connect(port);
    let mask = [9u8, 8, 7, 6];
    let mut bytes = Vec::new();
    for (fin, opcode, part) in [
        (false, 0x1u8, b"frag".as_slice()),
        (false, 0x0, b"ment"),
        (true, 0x0, b"ed"),
    ] {
        bytes.push(if fin { 0x80 | opcode } else { opcode });
        bytes.push(0x80 | part.len() as u8);
        bytes.extend_from_slice(&mask);
        bytes.extend(part.iter().enumerate().map(|(j, b)| b ^ mask[j % 4]));
    }
    client.stream.write_all(&bytes).unwrap();

    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"fragmented");

    drop(client);
    server.stop().unwrap();
}

#[test]
fn test_app_close_code_reaches_client() {
    let port = pick_port();
    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let server = Server::start(
        config_on(port, 1),
        vec![Box::new(RejectWith4321 {
            opens: Arc::clone(&opens),
            closes: Arc::clone(&closes),
        })],
    )
    .unwrap();

    let mut client = WsClient::connect(port);
    client.send_frame(0x1, b"anything");

    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x88);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 4321);

    // Finish the closing handshake from the client side; the server
    // then finishes the TCP shutdown once it sees the client FIN.
    client.send_frame(0x8, &4321u16.to_be_bytes());
    assert!(client.read_to_eof().is_empty());
    drop(client);

    // The app heard both lifecycle events.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while closes.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    server.stop().unwrap();
}

#[test]
fn test_client_initiated_close_echoed() {
    let port = pick_port();
    let server = Server::start(config_on(port, 1), vec![Box::new(Echo)]).unwrap();

    let mut client = WsClient::connect(port);
    client.send_frame(0x8, &1000u16.to_be_bytes());

    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x88);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

    // Server half-closed; nothing further arrives.
    assert!(client.read_to_eof().is_empty());

    server.stop().unwrap();
}

#[test]
fn test_unmasked_frame_rejected_with_1002() {
    let port = pick_port();
    let server = Server::start(config_on(port, 1), vec![Box::new(Echo)]).unwrap();

    let mut client = WsClient::connect(port);
    // Unmasked client frame: protocol violation.
    client.stream.write_all(&[0x81, 0x01, b'x']).unwrap();

    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x88);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

    server.stop().unwrap();
}

#[test]
fn test_ping_gets_pong() {
    let port = pick_port();
    let server = Server::start(config_on(port, 1), vec![Box::new(Echo)]).unwrap();

    let mut client = WsClient::connect(port);
    client.send_frame(0x9, b"are you there");

    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x8A);
    assert_eq!(payload, b"are you there");

    drop(client);
    server.stop().unwrap();
}
