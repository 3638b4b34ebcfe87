// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frozen runtime configuration.
//!
//! This module centralizes all tunables consumed by the core. The
//! config is frozen before any thread is spawned; there is no dynamic
//! reconfiguration. Environment and file parsing live outside the core
//! (the server binary maps CLI flags onto a [`Config`]).

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServerError;

// =======================================================================
// Defaults
// =======================================================================

/// Default worker thread count.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default initial size of each outbound (app -> worker) ring, in bytes.
pub const DEFAULT_OUTBOUND_RING_SIZE: usize = 1 << 20;

/// Default initial size of each inbound (worker -> app) ring, in bytes.
pub const DEFAULT_INBOUND_RING_SIZE: usize = 1 << 20;

/// Default growth multiplier applied when a ring or write buffer must
/// grow. Must be > 1.0; typical values are 1.5 - 2.0.
pub const DEFAULT_GROWTH_MULTIPLIER: f64 = 1.5;

/// Default cap on a reassembled inbound WebSocket message, in bytes.
pub const DEFAULT_MAX_WS_MSG_SIZE: usize = 16 * 1024 * 1024;

/// Default per-app ring update queue capacity (pending publish events).
pub const DEFAULT_UPDATE_QUEUE_SIZE: usize = 256;

/// Default peer slot capacity per worker.
pub const DEFAULT_PEER_SLOT_COUNT: usize = 4096;

/// Default initial size of an app's lazily allocated write buffer.
pub const DEFAULT_APP_WBUF_SIZE: usize = 4096;

/// Worker read buffer size (one per worker, reused across peers).
pub const WORKER_READ_BUF_SIZE: usize = 64 * 1024;

/// Maximum buffered bytes for an HTTP upgrade request.
pub const MAX_UPGRADE_REQUEST_SIZE: usize = 8 * 1024;

/// Maximum events drained per poll turn.
pub const MAX_POLL_EVENTS: usize = 256;

// =======================================================================
// Listener configuration
// =======================================================================

/// One listening endpoint, owned by a single app.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address.
    pub addr: IpAddr,

    /// Listen port.
    pub port: u16,

    /// Index into [`Config::apps`] of the app served on this port.
    pub app: usize,

    /// TLS material; `None` means plaintext TCP.
    pub tls: Option<TlsListenerConfig>,
}

/// TLS material for an encrypted listener.
#[derive(Debug, Clone)]
pub struct TlsListenerConfig {
    /// PEM certificate chain path.
    pub cert_path: PathBuf,

    /// PEM private key path.
    pub key_path: PathBuf,
}

impl ListenerConfig {
    /// Plaintext listener on all interfaces.
    pub fn plain(port: u16, app: usize) -> Self {
        Self {
            addr: IpAddr::from([0, 0, 0, 0]),
            port,
            app,
            tls: None,
        }
    }

    /// TLS listener on all interfaces.
    pub fn tls(port: u16, app: usize, cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            addr: IpAddr::from([0, 0, 0, 0]),
            port,
            app,
            tls: Some(TlsListenerConfig {
                cert_path,
                key_path,
            }),
        }
    }

    /// Whether peers accepted on this listener speak TLS first.
    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }
}

// =======================================================================
// App configuration
// =======================================================================

/// Per-app tunables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// App name, used for the thread name and log tag.
    pub name: String,

    /// Capacity of the app's ring update queue.
    pub update_queue_size: usize,

    /// Initial size of the app's lazily allocated write buffer.
    pub wbuf_size: usize,

    /// Period between timer callbacks; `None` disables the timer.
    pub timer_interval: Option<Duration>,
}

impl AppConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            update_queue_size: DEFAULT_UPDATE_QUEUE_SIZE,
            wbuf_size: DEFAULT_APP_WBUF_SIZE,
            timer_interval: None,
        }
    }

    pub fn with_timer(mut self, interval: Duration) -> Self {
        self.timer_interval = Some(interval);
        self
    }
}

// =======================================================================
// Top-level configuration
// =======================================================================

/// Frozen server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of I/O worker threads.
    pub worker_count: usize,

    /// Peer slot capacity per worker.
    pub peer_slots: usize,

    /// Initial outbound ring size in bytes.
    pub outbound_ring_size: usize,

    /// Initial inbound ring size in bytes.
    pub inbound_ring_size: usize,

    /// Ring / write-buffer growth multiplier (> 1.0).
    pub growth_multiplier: f64,

    /// Maximum reassembled inbound WebSocket message size.
    pub max_ws_msg_size: usize,

    /// App declarations; index is the app id.
    pub apps: Vec<AppConfig>,

    /// Listening endpoints.
    pub listeners: Vec<ListenerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            peer_slots: DEFAULT_PEER_SLOT_COUNT,
            outbound_ring_size: DEFAULT_OUTBOUND_RING_SIZE,
            inbound_ring_size: DEFAULT_INBOUND_RING_SIZE,
            growth_multiplier: DEFAULT_GROWTH_MULTIPLIER,
            max_ws_msg_size: DEFAULT_MAX_WS_MSG_SIZE,
            apps: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

impl Config {
    /// Validate invariants the core assumes once threads are running.
    pub fn validate(&self) -> Result<(), ServerError> {
        let fail = |reason: &str| {
            Err(ServerError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.worker_count == 0 {
            return fail("worker_count must be > 0");
        }
        if self.apps.is_empty() {
            return fail("at least one app is required");
        }
        if self.listeners.is_empty() {
            return fail("at least one listener is required");
        }
        if !(self.growth_multiplier > 1.0) {
            return fail("growth_multiplier must be > 1.0");
        }
        if self.peer_slots == 0 || self.peer_slots > u32::MAX as usize {
            return fail("peer_slots must be in 1..=u32::MAX");
        }
        if self.outbound_ring_size == 0 || self.inbound_ring_size == 0 {
            return fail("ring sizes must be > 0");
        }
        for (i, app) in self.apps.iter().enumerate() {
            if app.name.is_empty() {
                return Err(ServerError::InvalidConfig {
                    reason: format!("app {} has an empty name", i),
                });
            }
            if app.update_queue_size == 0 {
                return Err(ServerError::InvalidConfig {
                    reason: format!("app '{}': update_queue_size must be > 0", app.name),
                });
            }
        }
        for lst in &self.listeners {
            if lst.app >= self.apps.len() {
                return Err(ServerError::InvalidConfig {
                    reason: format!("listener :{} names unknown app {}", lst.port, lst.app),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            apps: vec![AppConfig::new("echo")],
            listeners: vec![ListenerConfig::plain(8080, 0)],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_rejected_without_apps() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut cfg = valid_config();
        cfg.worker_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_multiplier_bounds() {
        let mut cfg = valid_config();
        cfg.growth_multiplier = 1.0;
        assert!(cfg.validate().is_err());
        cfg.growth_multiplier = 1.5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_listener_app_reference() {
        let mut cfg = valid_config();
        cfg.listeners[0].app = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_listener_encryption_flag() {
        let plain = ListenerConfig::plain(80, 0);
        assert!(!plain.is_encrypted());

        let tls = ListenerConfig::tls(443, 0, "cert.pem".into(), "key.pem".into());
        assert!(tls.is_encrypted());
    }
}
