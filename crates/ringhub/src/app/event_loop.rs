// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The app thread loop.
//!
//! Drains inbound rings from every worker, dispatches callbacks, and
//! publishes outbound messages through the update queue. Between
//! drains the thread runs the double-check idle protocol against its
//! eventfd, with the poll timeout doubling as the timer clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::app::context::AppContext;
use crate::app::{AppHandler, Control, Message};
use crate::client_id::ClientId;
use crate::config::{AppConfig, Config};
use crate::error::ServerError;
use crate::logging;
use crate::msg::{self, InboundRecord};
use crate::ring::pair::AppLinks;
use crate::ring::queue::UpdateQueue;
use crate::ws::frame;

/// One app thread.
pub struct App {
    name: String,
    handler: Box<dyn AppHandler>,
    links: AppLinks,
    updates: UpdateQueue,
    wbuf: Vec<u8>,
    partition: Vec<Vec<u32>>,
    timer_interval: Option<Duration>,
    max_ws_msg_size: usize,
    wbuf_initial_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl App {
    pub fn new(
        config: &Config,
        app_config: &AppConfig,
        handler: Box<dyn AppHandler>,
        links: AppLinks,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let worker_count = links.outbound.len();
        Self {
            name: app_config.name.clone(),
            handler,
            links,
            updates: UpdateQueue::new(app_config.update_queue_size),
            wbuf: Vec::new(),
            partition: (0..worker_count).map(|_| Vec::new()).collect(),
            timer_interval: app_config.timer_interval,
            max_ws_msg_size: config.max_ws_msg_size,
            wbuf_initial_size: app_config.wbuf_size,
            shutdown,
        }
    }

    /// The app event loop. Returns on cooperative shutdown or a fatal
    /// condition.
    pub fn run(mut self) -> Result<(), ServerError> {
        logging::set_thread_tag(format!("app {}", self.name));
        log::info!("app up ({} workers)", self.links.outbound.len());

        match self.run_hook(Hook::Init)? {
            Control::Fatal => {
                return Err(ServerError::AppFatal {
                    app: self.name.clone(),
                })
            }
            Control::Close(_) => {
                log::warn!("init returned Close; no client to close");
            }
            Control::Continue => {}
        }
        self.flush_updates();

        let mut next_timer = self.timer_interval.map(|iv| Instant::now() + iv);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.drain_all()?;
            self.flush_updates();

            if let (Some(deadline), Some(interval)) = (next_timer, self.timer_interval) {
                if Instant::now() >= deadline {
                    match self.run_hook(Hook::Timer)? {
                        Control::Fatal => {
                            return Err(ServerError::AppFatal {
                                app: self.name.clone(),
                            })
                        }
                        Control::Close(_) => {
                            log::warn!("timer returned Close; no client to close");
                        }
                        Control::Continue => {}
                    }
                    self.flush_updates();
                    next_timer = Some(Instant::now() + interval);
                }
            }

            // Idle protocol: announce sleep, re-scan every ring, then
            // block. A producer publishing after the re-scan observes
            // ASLEEP and signals the eventfd.
            self.links.wake.sleep.fall_asleep();
            if self.shutdown.load(Ordering::Acquire) || self.inbound_pending() {
                self.links.wake.sleep.wake_up();
                continue;
            }
            let timeout = next_timer.map(|d| d.saturating_duration_since(Instant::now()));
            let waited = self.links.wake.eventfd.wait(timeout);
            self.links.wake.sleep.wake_up();
            if let Err(e) = waited {
                return Err(ServerError::WakeFd { source: e });
            }
        }

        self.flush_updates();
        log::info!("app down");
        Ok(())
    }

    /// True when any inbound ring has published data.
    fn inbound_pending(&mut self) -> bool {
        self.links.inbound.iter_mut().any(|cons| !cons.is_empty())
    }

    fn flush_updates(&mut self) {
        self.updates.flush(
            &self.links.outbound,
            &self.links.inbound,
            &self.links.worker_wakes,
        );
    }

    /// Run a peer-less hook (init or timer).
    fn run_hook(&mut self, hook: Hook) -> Result<Control, ServerError> {
        let max = self.max_ws_msg_size;
        let wbuf_init = self.wbuf_initial_size;
        let Self {
            handler,
            links,
            updates,
            wbuf,
            partition,
            ..
        } = &mut *self;
        let mut ctx = AppContext::new(
            &mut links.outbound,
            updates,
            &links.worker_wakes,
            wbuf,
            partition,
            None,
            max,
            wbuf_init,
        );
        let control = match hook {
            Hook::Init => handler.init(&mut ctx),
            Hook::Timer => handler.timer(&mut ctx),
        };
        if let Some(err) = ctx.take_failure() {
            return Err(err);
        }
        Ok(control)
    }

    /// Drain every worker's inbound ring, invoking callbacks per
    /// record, then announce consumption.
    fn drain_all(&mut self) -> Result<(), ServerError> {
        let max = self.max_ws_msg_size;
        let wbuf_init = self.wbuf_initial_size;
        let name = self.name.clone();
        let Self {
            handler,
            links,
            updates,
            wbuf,
            partition,
            ..
        } = &mut *self;
        let AppLinks {
            inbound,
            outbound,
            worker_wakes,
            ..
        } = links;

        for (w, cons) in inbound.iter_mut().enumerate() {
            cons.refresh();
            let mut drained = false;
            loop {
                let chunk = cons.readable();
                if chunk.is_empty() {
                    break;
                }
                let mut consumed = 0;
                while consumed < chunk.len() {
                    let (record, used) =
                        msg::parse_inbound(&chunk[consumed..]).map_err(|e| ServerError::Thread {
                            name: format!("app {}", name),
                            reason: format!("inbound ring corrupt: {}", e),
                        })?;

                    let (client, control) = {
                        let cur = match record {
                            InboundRecord::Open { peer }
                            | InboundRecord::Read { peer, .. }
                            | InboundRecord::Close { peer, .. } => {
                                ClientId::from_parts(w as u32, peer)
                            }
                        };
                        let mut ctx = AppContext::new(
                            outbound,
                            updates,
                            worker_wakes,
                            wbuf,
                            partition,
                            Some(cur),
                            max,
                            wbuf_init,
                        );
                        let control = match record {
                            InboundRecord::Open { .. } => handler.open(&mut ctx, cur),
                            InboundRecord::Read {
                                is_text, payload, ..
                            } => handler.read(&mut ctx, cur, Message { is_text, payload }),
                            InboundRecord::Close { code, .. } => handler.close(&mut ctx, cur, code),
                        };
                        if let Some(err) = ctx.take_failure() {
                            return Err(err);
                        }
                        (cur, control)
                    };

                    match control {
                        Control::Continue => {}
                        Control::Close(code) => {
                            let code = if frame::is_app_close_code(code) {
                                code
                            } else {
                                log::warn!(
                                    "close code {} outside [4000, 4899]; clamped",
                                    code
                                );
                                code.clamp(frame::CLOSE_APP_MIN, frame::CLOSE_APP_MAX)
                            };
                            let mut ctx = AppContext::new(
                                outbound,
                                updates,
                                worker_wakes,
                                wbuf,
                                partition,
                                None,
                                max,
                                wbuf_init,
                            );
                            ctx.send_close(client, code);
                            if let Some(err) = ctx.take_failure() {
                                return Err(err);
                            }
                        }
                        Control::Fatal => {
                            return Err(ServerError::AppFatal { app: name });
                        }
                    }
                    consumed += used;
                }
                cons.consume(consumed);
                drained = true;
            }
            if drained {
                updates.enqueue(w as u32, cons.position(), false)?;
            }
        }
        Ok(())
    }
}

enum Hook {
    Init,
    Timer,
}
