// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Result kinds shared by the event loops.
//!
//! Interior operations report one of four statuses. `Again` and
//! `ClosePeer` are recovered locally by the event loop that observed
//! them; `Fatal` propagates up and terminates the process after a
//! best-effort flush.

use std::fmt;
use std::io;

/// Status of a non-blocking interior operation.
///
/// - `Done` - the operation completed in full. Partial completion is
///   never reported as `Done`.
/// - `Again` - the operation would block; resume on the next readiness
///   notification.
/// - `ClosePeer` - drop this peer: malformed framing, peer reset,
///   unexpected EOF outside shutdown, or a protocol violation.
/// - `Fatal` - unrecoverable process-level failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum IoStatus {
    Done,
    Again,
    ClosePeer,
    Fatal,
}

impl IoStatus {
    /// Classify an `io::Error` from a non-blocking socket operation.
    pub fn from_io_error(err: &io::Error) -> IoStatus {
        match err.kind() {
            io::ErrorKind::WouldBlock => IoStatus::Again,
            io::ErrorKind::Interrupted => IoStatus::Again,
            _ => IoStatus::ClosePeer,
        }
    }

    /// Check for `Done`.
    pub fn is_done(self) -> bool {
        matches!(self, IoStatus::Done)
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoStatus::Done => "Done",
            IoStatus::Again => "Again",
            IoStatus::ClosePeer => "ClosePeer",
            IoStatus::Fatal => "Fatal",
        };
        write!(f, "{}", s)
    }
}

/// Process-level failures that terminate the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration rejected by validation.
    InvalidConfig { reason: String },

    /// A ring update queue overflowed its configured size.
    UpdateQueueOverflow { capacity: usize },

    /// Thread spawn or join failure.
    Thread { name: String, reason: String },

    /// Socket setup (bind, listen, option) failure.
    Socket { addr: String, source: io::Error },

    /// Event poller creation or registration failure.
    Poll { source: io::Error },

    /// Wake descriptor (eventfd) failure.
    WakeFd { source: io::Error },

    /// TLS configuration (certificate/key) failure.
    Tls { reason: String },

    /// An app callback reported a fatal condition.
    AppFatal { app: String },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {}", reason)
            }
            ServerError::UpdateQueueOverflow { capacity } => {
                write!(f, "ring update queue overflow (capacity {})", capacity)
            }
            ServerError::Thread { name, reason } => {
                write!(f, "thread '{}' failed: {}", name, reason)
            }
            ServerError::Socket { addr, source } => {
                write!(f, "socket setup failed for {}: {}", addr, source)
            }
            ServerError::Poll { source } => write!(f, "event poll failure: {}", source),
            ServerError::WakeFd { source } => write!(f, "wake descriptor failure: {}", source),
            ServerError::Tls { reason } => write!(f, "TLS setup failed: {}", reason),
            ServerError::AppFatal { app } => write!(f, "app '{}' reported fatal", app),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Socket { source, .. }
            | ServerError::Poll { source }
            | ServerError::WakeFd { source } => Some(source),
            _ => None,
        }
    }
}

/// Convenience alias for fallible server-level operations.
pub type Result<T> = std::result::Result<T, ServerError>;
