// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server assembly: ring mesh, thread spawn, cooperative shutdown.
//!
//! Threads are shared-nothing except the rings and wake states built
//! here. Workers and apps both stop at their next safe point once the
//! shutdown flag is set and every sleeper has been woken.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::app::event_loop::App;
use crate::app::AppHandler;
use crate::config::Config;
use crate::error::ServerError;
use crate::peer::tls;
use crate::ring::pair;
use crate::ring::wake::WakeState;
use crate::worker::{ListenerBinding, Worker};

/// A running server: worker and app threads plus their wake handles.
pub struct Server {
    shutdown: Arc<AtomicBool>,
    worker_wakes: Vec<Arc<WakeState>>,
    app_wakes: Vec<Arc<WakeState>>,
    threads: Vec<JoinHandle<Result<(), ServerError>>>,
}

impl Server {
    /// Validate the config, build the ring mesh, and spawn every
    /// thread. `handlers[i]` serves `config.apps[i]`.
    pub fn start(
        config: Config,
        handlers: Vec<Box<dyn AppHandler>>,
    ) -> Result<Server, ServerError> {
        config.validate()?;
        if handlers.len() != config.apps.len() {
            return Err(ServerError::InvalidConfig {
                reason: format!(
                    "{} handlers supplied for {} configured apps",
                    handlers.len(),
                    config.apps.len()
                ),
            });
        }

        // TLS materials load once and are shared by every worker.
        let mut tls_configs = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            tls_configs.push(match &listener.tls {
                Some(tls_cfg) => Some(tls::load_server_config(tls_cfg)?),
                None => None,
            });
        }

        let (worker_links, app_links) = pair::build_mesh(
            config.worker_count,
            config.apps.len(),
            config.outbound_ring_size,
            config.inbound_ring_size,
            config.growth_multiplier,
        )
        .map_err(|source| ServerError::WakeFd { source })?;

        let worker_wakes: Vec<_> = worker_links.iter().map(|l| Arc::clone(&l.wake)).collect();
        let app_wakes: Vec<_> = app_links.iter().map(|l| Arc::clone(&l.wake)).collect();
        let shutdown = Arc::new(AtomicBool::new(false));

        // Build every worker before spawning anything, so bind and
        // registration failures surface with no threads to unwind.
        let mut workers = Vec::with_capacity(config.worker_count);
        for (w, links) in worker_links.into_iter().enumerate() {
            let bindings = config
                .listeners
                .iter()
                .zip(&tls_configs)
                .map(|(cfg, tls)| ListenerBinding {
                    cfg: cfg.clone(),
                    tls: tls.clone(),
                })
                .collect();
            workers.push(Worker::new(
                w as u32,
                &config,
                bindings,
                links,
                Arc::clone(&shutdown),
            )?);
        }

        let mut threads = Vec::with_capacity(config.worker_count + config.apps.len());

        for ((app_config, handler), links) in
            config.apps.iter().zip(handlers).zip(app_links)
        {
            let app = App::new(&config, app_config, handler, links, Arc::clone(&shutdown));
            let handle = thread::Builder::new()
                .name(format!("ringhub-app-{}", app_config.name))
                .spawn(move || app.run())
                .map_err(|e| ServerError::Thread {
                    name: format!("app {}", app_config.name),
                    reason: e.to_string(),
                })?;
            threads.push(handle);
        }

        for (w, worker) in workers.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("ringhub-worker-{}", w))
                .spawn(move || worker.run())
                .map_err(|e| ServerError::Thread {
                    name: format!("worker {}", w),
                    reason: e.to_string(),
                })?;
            threads.push(handle);
        }

        log::info!(
            "server started: {} workers, {} apps, {} listeners",
            config.worker_count,
            config.apps.len(),
            config.listeners.len()
        );

        Ok(Server {
            shutdown,
            worker_wakes,
            app_wakes,
            threads,
        })
    }

    /// Request cooperative shutdown: set the flag and wake every
    /// sleeper so each loop reaches its safe point.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for wake in self.worker_wakes.iter().chain(&self.app_wakes) {
            wake.eventfd.signal();
        }
    }

    /// Wait for every thread; the first failure wins.
    pub fn join(self) -> Result<(), ServerError> {
        let mut first_error = None;
        for handle in self.threads {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("thread failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    log::error!("thread panicked");
                    first_error.get_or_insert(ServerError::Thread {
                        name: "unknown".to_string(),
                        reason: "panicked".to_string(),
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shutdown and join.
    pub fn stop(self) -> Result<(), ServerError> {
        self.shutdown();
        self.join()
    }
}
