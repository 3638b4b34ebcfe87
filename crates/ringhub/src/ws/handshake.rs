// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP/1.1 -> WebSocket upgrade handshake.
//!
//! Workers accumulate request bytes until the header terminator, then
//! validate the upgrade here and answer with a 101 (or a 400 and a
//! close). Only the handshake subset of HTTP is understood; anything
//! else on the socket is a failed upgrade.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fmt;

/// Concatenated with the client key before hashing (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Fields extracted from a valid upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request path, e.g. `/chat`.
    pub path: String,

    /// `Host` header, when present.
    pub host: Option<String>,

    /// `Sec-WebSocket-Key` value, still base64.
    pub key: String,
}

/// Why an upgrade request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    NotHttp,
    WrongMethod,
    MissingUpgradeHeader,
    MissingConnectionUpgrade,
    WrongVersion,
    MissingKey,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeError::NotHttp => "request is not HTTP/1.1",
            HandshakeError::WrongMethod => "method is not GET",
            HandshakeError::MissingUpgradeHeader => "missing 'Upgrade: websocket'",
            HandshakeError::MissingConnectionUpgrade => "Connection header lacks 'upgrade'",
            HandshakeError::WrongVersion => "Sec-WebSocket-Version is not 13",
            HandshakeError::MissingKey => "missing Sec-WebSocket-Key",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for HandshakeError {}

/// Locate the end of the request head (`\r\n\r\n`). Returns the offset
/// one past the terminator.
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse and validate an upgrade request head (bytes up to and
/// including the `\r\n\r\n` terminator).
pub fn parse_upgrade(head: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    let text = std::str::from_utf8(head).map_err(|_| HandshakeError::NotHttp)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HandshakeError::NotHttp)?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(HandshakeError::NotHttp)?;
    let path = parts.next().ok_or(HandshakeError::NotHttp)?;
    let version = parts.next().ok_or(HandshakeError::NotHttp)?;
    if version != "HTTP/1.1" {
        return Err(HandshakeError::NotHttp);
    }
    if method != "GET" {
        return Err(HandshakeError::WrongMethod);
    }

    let mut host = None;
    let mut key = None;
    let mut has_upgrade = false;
    let mut has_connection_upgrade = false;
    let mut version_13 = false;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("upgrade") {
            has_upgrade = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            has_connection_upgrade = value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version_13 = value == "13";
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_string());
        }
    }

    if !has_upgrade {
        return Err(HandshakeError::MissingUpgradeHeader);
    }
    if !has_connection_upgrade {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }
    if !version_13 {
        return Err(HandshakeError::WrongVersion);
    }
    let key = key.ok_or(HandshakeError::MissingKey)?;

    Ok(UpgradeRequest {
        path: path.to_string(),
        host,
        key,
    })
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut input = Vec::with_capacity(key.len() + WS_GUID.len());
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(WS_GUID.as_bytes());
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &input);
    BASE64.encode(digest.as_ref())
}

/// Build the 101 Switching Protocols response.
pub fn response_101(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
    .into_bytes()
}

/// The rejection response sent before closing a failed upgrade.
pub fn response_400() -> &'static [u8] {
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_find_request_end() {
        assert_eq!(find_request_end(b"GET / HTTP/1.1"), None);
        let buf = b"GET / HTTP/1.1\r\n\r\nextra";
        assert_eq!(find_request_end(buf), Some(18));
    }

    #[test]
    fn test_parse_valid_upgrade() {
        let req = parse_upgrade(REQUEST.as_bytes()).unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.host.as_deref(), Some("server.example.com"));
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn test_rfc_example_accept_key() {
        // RFC 6455 section 1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_post_rejected() {
        let bad = REQUEST.replacen("GET", "POST", 1);
        assert_eq!(
            parse_upgrade(bad.as_bytes()),
            Err(HandshakeError::WrongMethod)
        );
    }

    #[test]
    fn test_http_10_rejected() {
        let bad = REQUEST.replacen("HTTP/1.1", "HTTP/1.0", 1);
        assert_eq!(parse_upgrade(bad.as_bytes()), Err(HandshakeError::NotHttp));
    }

    #[test]
    fn test_missing_key_rejected() {
        let bad = REQUEST.replace("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", "");
        assert_eq!(
            parse_upgrade(bad.as_bytes()),
            Err(HandshakeError::MissingKey)
        );
    }

    #[test]
    fn test_wrong_version_rejected() {
        let bad = REQUEST.replace("Version: 13", "Version: 8");
        assert_eq!(
            parse_upgrade(bad.as_bytes()),
            Err(HandshakeError::WrongVersion)
        );
    }

    #[test]
    fn test_connection_token_list() {
        // Browsers may send "Connection: keep-alive, Upgrade".
        let req = REQUEST.replace(
            "Connection: Upgrade",
            "Connection: keep-alive, Upgrade",
        );
        assert!(parse_upgrade(req.as_bytes()).is_ok());
    }

    #[test]
    fn test_case_insensitive_headers() {
        let req = REQUEST
            .replace("Upgrade: websocket", "UPGRADE: WebSocket")
            .replace("Connection: Upgrade", "connection: upgrade");
        assert!(parse_upgrade(req.as_bytes()).is_ok());
    }

    #[test]
    fn test_response_101_shape() {
        let resp = response_101("abc=");
        let text = std::str::from_utf8(&resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 101"));
        assert!(text.contains("Sec-WebSocket-Accept: abc=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
