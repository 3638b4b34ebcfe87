// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket abstraction for peer connections.
//!
//! Unifies the real non-blocking TCP stream with a mock used by the
//! protocol tests, so the peer state machine can be exercised without
//! sockets.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::RawFd;

/// Byte-oriented, non-blocking peer socket.
pub trait PeerSocket: Read + Write + Send {
    /// Half-close the write side (TCP FIN).
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Raw descriptor for poll registration; -1 for test doubles.
    fn raw_fd(&self) -> RawFd;
}

impl PeerSocket for mio::net::TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Write)
    }

    fn raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

/// Boxed socket, the form stored in a peer slot.
pub type BoxedSocket = Box<dyn PeerSocket>;

// =======================================================================
// Test mock
// =======================================================================
