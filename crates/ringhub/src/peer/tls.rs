// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rustls plumbing for encrypted peers.
//!
//! A TLS peer carries a `rustls::ServerConnection` next to its socket.
//! Every outcome is mapped onto the same classes the plain TCP path
//! uses: bytes / would-block / peer-closed / error, so the peer state
//! machine above stays transport-agnostic.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};

use crate::config::TlsListenerConfig;
use crate::error::ServerError;
use crate::peer::socket::BoxedSocket;

/// Build the shared server config from PEM files.
pub fn load_server_config(cfg: &TlsListenerConfig) -> Result<Arc<ServerConfig>, ServerError> {
    let cert_pem = std::fs::read(&cfg.cert_path).map_err(|e| ServerError::Tls {
        reason: format!("read {}: {}", cfg.cert_path.display(), e),
    })?;
    let key_pem = std::fs::read(&cfg.key_path).map_err(|e| ServerError::Tls {
        reason: format!("read {}: {}", cfg.key_path.display(), e),
    })?;

    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls {
            reason: format!("parse certificate: {:?}", e),
        })?;
    if certs.is_empty() {
        return Err(ServerError::Tls {
            reason: "no certificates found in PEM data".to_string(),
        });
    }
    let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|e| ServerError::Tls {
        reason: format!("parse private key: {:?}", e),
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls {
            reason: e.to_string(),
        })?;
    Ok(Arc::new(config))
}

/// Create a fresh server-side session.
pub fn new_session(config: &Arc<ServerConfig>) -> Result<ServerConnection, ServerError> {
    ServerConnection::new(Arc::clone(config)).map_err(|e| ServerError::Tls {
        reason: e.to_string(),
    })
}

/// Pull ciphertext from the socket into the session.
///
/// Returns `Ok(true)` if progress was made, `Ok(false)` on would-block,
/// `Err` on EOF or a TLS-level failure.
fn pump_read(sock: &mut BoxedSocket, conn: &mut ServerConnection) -> io::Result<bool> {
    match conn.read_tls(sock) {
        Ok(0) => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "TLS transport closed",
        )),
        Ok(_) => {
            conn.process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

/// Push buffered ciphertext to the socket.
///
/// Returns `Ok(true)` when nothing remains buffered, `Ok(false)` when
/// the socket would block with ciphertext still pending.
pub fn flush_ciphertext(sock: &mut BoxedSocket, conn: &mut ServerConnection) -> io::Result<bool> {
    while conn.wants_write() {
        match conn.write_tls(sock) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "TLS transport closed",
                ))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Drive the handshake.
///
/// Returns `Ok(true)` once the handshake is complete, `Ok(false)` when
/// it is still waiting on the peer.
pub fn handshake_step(sock: &mut BoxedSocket, conn: &mut ServerConnection) -> io::Result<bool> {
    loop {
        flush_ciphertext(sock, conn)?;
        if !conn.is_handshaking() {
            return Ok(true);
        }
        if !pump_read(sock, conn)? {
            return Ok(false);
        }
    }
}

/// Read decrypted plaintext, pumping the socket as needed.
///
/// Mirrors the plain `read` contract: `Ok(n)` with data, `Ok(0)` when
/// the peer closed (close_notify or transport EOF), `WouldBlock` when
/// no plaintext is available yet.
pub fn read_plaintext(
    sock: &mut BoxedSocket,
    conn: &mut ServerConnection,
    buf: &mut [u8],
) -> io::Result<usize> {
    loop {
        match conn.reader().read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) => return Err(e),
        }
        match pump_read(sock, conn) {
            Ok(true) => continue,
            Ok(false) => return Err(io::Error::new(io::ErrorKind::WouldBlock, "no plaintext")),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}

/// Write plaintext into the session and push as much ciphertext as the
/// socket accepts. Returns the number of plaintext bytes accepted;
/// would-block covers a full session buffer as well as a full socket.
pub fn write_plaintext(
    sock: &mut BoxedSocket,
    conn: &mut ServerConnection,
    data: &[u8],
) -> io::Result<usize> {
    let n = conn.writer().write(data)?;
    flush_ciphertext(sock, conn)?;
    if n == 0 && !data.is_empty() {
        // Session buffer is at its limit behind a blocked socket.
        return Err(io::Error::new(io::ErrorKind::WouldBlock, "session full"));
    }
    Ok(n)
}

/// Queue a close_notify alert and push what fits.
pub fn send_close_notify(sock: &mut BoxedSocket, conn: &mut ServerConnection) {
    conn.send_close_notify();
    if let Err(e) = flush_ciphertext(sock, conn) {
        log::debug!("close_notify flush failed: {}", e);
    }
}
