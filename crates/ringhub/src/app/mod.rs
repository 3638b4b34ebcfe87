// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! App threads and the callback surface.
//!
//! An app implements [`AppHandler`]; the runtime calls it from a
//! single app thread, so handlers are `Send` but never shared. Every
//! callback receives an [`AppContext`](context::AppContext) exposing
//! the send family and the composed write buffer.

pub mod context;
pub mod decode;
pub mod event_loop;

use crate::client_id::ClientId;
use context::AppContext;

/// What a callback asks the runtime to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Carry on.
    Continue,

    /// Close the client this callback was invoked for, sending a close
    /// frame with the given code. Codes must be in [4000, 4899];
    /// [4900, 4999] is reserved for internal use.
    Close(u16),

    /// Unrecoverable: terminate the server.
    Fatal,
}

/// One complete inbound message.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub is_text: bool,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    /// Schema-driven reader over the payload.
    pub fn reader(&self) -> decode::PayloadReader<'a> {
        decode::PayloadReader::new(self.payload)
    }
}

/// Lifecycle hooks of one app.
///
/// `init` runs once before any I/O; `timer` fires at the configured
/// interval when one is set. The default implementations do nothing.
pub trait AppHandler: Send {
    fn init(&mut self, ctx: &mut AppContext<'_>) -> Control {
        let _ = ctx;
        Control::Continue
    }

    fn open(&mut self, ctx: &mut AppContext<'_>, client: ClientId) -> Control {
        let _ = (ctx, client);
        Control::Continue
    }

    fn read(&mut self, ctx: &mut AppContext<'_>, client: ClientId, msg: Message<'_>) -> Control;

    fn close(&mut self, ctx: &mut AppContext<'_>, client: ClientId, code: u16) -> Control {
        let _ = (ctx, client, code);
        Control::Continue
    }

    fn timer(&mut self, ctx: &mut AppContext<'_>) -> Control {
        let _ = ctx;
        Control::Continue
    }
}
