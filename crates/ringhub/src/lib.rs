// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # ringhub - ring-coupled WebSocket server core
//!
//! A horizontally scalable WebSocket server that multiplexes many
//! client connections across a pool of I/O worker threads and a
//! separate pool of app threads, coordinated entirely through lockless
//! single-producer/single-consumer byte rings.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         app threads                          |
//! |   callbacks: init / open / read / close / timer              |
//! |   sends: to_cur, to_single, to_multi, to_every, ...          |
//! +------------^--------------------------------+----------------+
//!              | inbound rings                  | outbound rings
//!              | (worker -> app)                | (app -> worker)
//! +------------+--------------------------------v----------------+
//! |                       worker threads                         |
//! |   epoll loop: listeners | peers | wake eventfd               |
//! |   per peer: TCP -> (TLS ->) HTTP upgrade -> WebSocket        |
//! |   fan-out: SINGLE / ARRAY / EVERY / EVERY_EXCEPT_*           |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every (worker, app) pair owns one I/O pair of SPSC rings. Cursor
//! publications and eventfd wakes are batched through per-producer
//! update queues; consumers run a double-check sleep protocol so no
//! wakeup is ever lost.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ringhub::{
//!     AppConfig, AppContext, AppHandler, ClientId, Config, Control, ListenerConfig, Message,
//!     Server,
//! };
//!
//! struct Echo;
//!
//! impl AppHandler for Echo {
//!     fn read(&mut self, ctx: &mut AppContext<'_>, _client: ClientId, msg: Message<'_>) -> Control {
//!         ctx.to_cur(msg.is_text, msg.payload);
//!         Control::Continue
//!     }
//! }
//!
//! fn main() -> Result<(), ringhub::ServerError> {
//!     let config = Config {
//!         apps: vec![AppConfig::new("echo")],
//!         listeners: vec![ListenerConfig::plain(8080, 0)],
//!         ..Config::default()
//!     };
//!     let server = Server::start(config, vec![Box::new(Echo)])?;
//!     server.join()
//! }
//! ```

pub mod app;
pub mod client_id;
pub mod config;
pub mod error;
pub mod logging;
pub mod msg;
pub mod peer;
pub mod ring;
pub mod server;
pub mod worker;
pub mod ws;

pub use app::context::AppContext;
pub use app::decode::{DecodeError, PayloadReader};
pub use app::{AppHandler, Control, Message};
pub use client_id::ClientId;
pub use config::{AppConfig, Config, ListenerConfig, TlsListenerConfig};
pub use error::{IoStatus, ServerError};
pub use server::Server;
