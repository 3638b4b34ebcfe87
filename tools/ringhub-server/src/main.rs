// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ringhub demo server.
//!
//! Serves a single echo app: every message comes straight back to the
//! sender, and messages starting with `!all ` are broadcast to every
//! connected client instead.
//!
//! ```bash
//! # Plain WebSocket on port 8080, 4 workers
//! ringhub-server --port 8080 --workers 4
//!
//! # TLS
//! ringhub-server --port 443 --cert server.crt --key server.key
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use ringhub::{
    logging, AppConfig, AppContext, AppHandler, ClientId, Config, Control, ListenerConfig,
    Message, Server,
};

/// ringhub demo server
#[derive(Parser, Debug)]
#[command(name = "ringhub-server")]
#[command(about = "Ring-coupled WebSocket echo server")]
#[command(version)]
struct Args {
    /// Listen port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// I/O worker thread count
    #[arg(short, long, default_value = "2")]
    workers: usize,

    /// TLS certificate chain (PEM); enables TLS together with --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Periodic stats interval in seconds (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,
}

/// Echo app with a broadcast escape and periodic stats.
struct EchoApp {
    messages: u64,
    clients: u64,
}

const BROADCAST_PREFIX: &[u8] = b"!all ";

impl AppHandler for EchoApp {
    fn init(&mut self, _ctx: &mut AppContext<'_>) -> Control {
        log::info!("echo app ready");
        Control::Continue
    }

    fn open(&mut self, _ctx: &mut AppContext<'_>, client: ClientId) -> Control {
        self.clients += 1;
        log::debug!("{} connected ({} online)", client, self.clients);
        Control::Continue
    }

    fn read(&mut self, ctx: &mut AppContext<'_>, _client: ClientId, msg: Message<'_>) -> Control {
        self.messages += 1;
        match msg.payload.strip_prefix(BROADCAST_PREFIX) {
            Some(rest) if msg.is_text => ctx.to_every(true, rest),
            _ => ctx.to_cur(msg.is_text, msg.payload),
        }
        Control::Continue
    }

    fn close(&mut self, _ctx: &mut AppContext<'_>, client: ClientId, code: u16) -> Control {
        self.clients = self.clients.saturating_sub(1);
        log::debug!("{} departed with code {}", client, code);
        Control::Continue
    }

    fn timer(&mut self, _ctx: &mut AppContext<'_>) -> Control {
        log::info!(
            "stats: {} clients online, {} messages handled",
            self.clients,
            self.messages
        );
        Control::Continue
    }
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    logging::init(args.log_level);

    let mut app = AppConfig::new("echo");
    if args.stats_interval > 0 {
        app = app.with_timer(Duration::from_secs(args.stats_interval));
    }

    let listener = match (args.cert, args.key) {
        (Some(cert), Some(key)) => ListenerConfig {
            addr: args.bind,
            ..ListenerConfig::tls(args.port, 0, cert, key)
        },
        _ => ListenerConfig {
            addr: args.bind,
            ..ListenerConfig::plain(args.port, 0)
        },
    };

    let config = Config {
        worker_count: args.workers,
        apps: vec![app],
        listeners: vec![listener],
        ..Config::default()
    };

    log::info!(
        "listening on {}:{} with {} workers",
        args.bind,
        args.port,
        args.workers
    );

    let server = match Server::start(
        config,
        vec![Box::new(EchoApp {
            messages: 0,
            clients: 0,
        })],
    ) {
        Ok(server) => server,
        Err(e) => {
            log::error!("startup failed: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    match server.join() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            log::error!("server terminated: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
