// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring mesh construction.
//!
//! Each (worker, app) link owns one I/O pair: an outbound ring written
//! by the app and read by the worker, and an inbound ring written by
//! the worker and read by the app. Every ring is strictly SPSC. The
//! mesh hands each thread exactly its own halves plus the wake states
//! of the threads it publishes to.

use std::io;
use std::sync::Arc;

use crate::ring::buffer::{self, RingConsumer, RingProducer};
use crate::ring::wake::WakeState;

/// A worker thread's side of the mesh. Vectors are indexed by app id.
pub struct WorkerLinks {
    /// Outbound rings (app -> this worker), consumer halves.
    pub outbound: Vec<RingConsumer>,

    /// Inbound rings (this worker -> app), producer halves.
    pub inbound: Vec<RingProducer>,

    /// Wake states of every app thread.
    pub app_wakes: Vec<Arc<WakeState>>,

    /// This worker's own wake state (registered with its poll).
    pub wake: Arc<WakeState>,
}

/// An app thread's side of the mesh. Vectors are indexed by worker id.
pub struct AppLinks {
    /// Outbound rings (this app -> worker), producer halves.
    pub outbound: Vec<RingProducer>,

    /// Inbound rings (worker -> this app), consumer halves.
    pub inbound: Vec<RingConsumer>,

    /// Wake states of every worker thread.
    pub worker_wakes: Vec<Arc<WakeState>>,

    /// This app's own wake state (blocked on between drains).
    pub wake: Arc<WakeState>,
}

/// Build the full (worker x app) ring mesh.
pub fn build_mesh(
    worker_count: usize,
    app_count: usize,
    outbound_size: usize,
    inbound_size: usize,
    multiplier: f64,
) -> io::Result<(Vec<WorkerLinks>, Vec<AppLinks>)> {
    let worker_wakes: Vec<Arc<WakeState>> = (0..worker_count)
        .map(|_| WakeState::new().map(Arc::new))
        .collect::<io::Result<_>>()?;
    let app_wakes: Vec<Arc<WakeState>> = (0..app_count)
        .map(|_| WakeState::new().map(Arc::new))
        .collect::<io::Result<_>>()?;

    let mut workers: Vec<WorkerLinks> = Vec::with_capacity(worker_count);
    let mut app_outbound: Vec<Vec<RingProducer>> =
        (0..app_count).map(|_| Vec::with_capacity(worker_count)).collect();
    let mut app_inbound: Vec<Vec<RingConsumer>> =
        (0..app_count).map(|_| Vec::with_capacity(worker_count)).collect();

    for w in 0..worker_count {
        let mut outbound = Vec::with_capacity(app_count);
        let mut inbound = Vec::with_capacity(app_count);
        for a in 0..app_count {
            let (out_prod, out_cons) = buffer::channel(outbound_size, multiplier);
            let (in_prod, in_cons) = buffer::channel(inbound_size, multiplier);
            outbound.push(out_cons);
            inbound.push(in_prod);
            app_outbound[a].push(out_prod);
            app_inbound[a].push(in_cons);
        }
        workers.push(WorkerLinks {
            outbound,
            inbound,
            app_wakes: app_wakes.clone(),
            wake: Arc::clone(&worker_wakes[w]),
        });
    }

    let apps = app_outbound
        .into_iter()
        .zip(app_inbound)
        .enumerate()
        .map(|(a, (outbound, inbound))| AppLinks {
            outbound,
            inbound,
            worker_wakes: worker_wakes.clone(),
            wake: Arc::clone(&app_wakes[a]),
        })
        .collect();

    Ok((workers, apps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_dimensions() {
        let (workers, apps) = build_mesh(3, 2, 1024, 1024, 1.5).unwrap();
        assert_eq!(workers.len(), 3);
        assert_eq!(apps.len(), 2);
        for w in &workers {
            assert_eq!(w.outbound.len(), 2);
            assert_eq!(w.inbound.len(), 2);
            assert_eq!(w.app_wakes.len(), 2);
        }
        for a in &apps {
            assert_eq!(a.outbound.len(), 3);
            assert_eq!(a.inbound.len(), 3);
            assert_eq!(a.worker_wakes.len(), 3);
        }
    }

    #[test]
    fn test_mesh_links_are_paired() {
        let (mut workers, mut apps) = build_mesh(2, 1, 256, 256, 1.5).unwrap();

        // App 0 -> worker 1, outbound direction.
        let prod = &mut apps[0].outbound[1];
        let buf = prod.reserve(3);
        buf.copy_from_slice(b"abc");
        prod.advance(3);
        prod.publish();

        let cons = &mut workers[1].outbound[0];
        cons.refresh();
        assert_eq!(cons.readable(), b"abc");

        // Worker 0 -> app 0, inbound direction.
        let prod = &mut workers[0].inbound[0];
        let buf = prod.reserve(2);
        buf.copy_from_slice(b"hi");
        prod.advance(2);
        prod.publish();

        let cons = &mut apps[0].inbound[0];
        cons.refresh();
        assert_eq!(cons.readable(), b"hi");
    }
}
