// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket protocol: RFC 6455 framing and the upgrade handshake.

pub mod frame;
pub mod handshake;

pub use frame::{FrameAssembler, FrameError, FrameEvent};
pub use handshake::{accept_key, parse_upgrade, UpgradeRequest};
