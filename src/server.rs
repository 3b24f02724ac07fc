//! The server value owned by `main`: shared state for every thread plus
//! the orchestration of startup and ordered shutdown.
//!
//! Startup holds a countdown barrier so no listener opens before every
//! dynamic asset has first content. Shutdown happens in two stages:
//! `shutdown` stops the producers, then `terminate` releases the claim
//! consumer to drain the queue and exit.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};

use anyhow::Context;
use log::{info, warn};

use crate::assets::Assets;
use crate::claims::ClaimQueue;
use crate::clock::{self, NowCache, unix_parts};
use crate::config::Config;
use crate::http::worker::{self, WorkerSlot};
use crate::ingest;
use crate::lifecycle::{self, Lifecycle};
use crate::recent::{self, RecentSignal};
use crate::score;
use crate::stats::{Counters, Gauge};
use crate::supervise;

/// Helper threads arriving at the startup barrier: five score
/// regenerators, the recent regenerator, the claim consumer, and the
/// now worker.
pub const HELPERS: usize = 8;

/// Everything the worker and helper threads share.
pub struct Server {
    pub config: Config,
    pub lifecycle: Lifecycle,
    pub stats: Counters,
    pub connections: Gauge,
    pub claims: ClaimQueue,
    pub assets: Assets,
    pub nowish: NowCache,
    pub recent: RecentSignal,
    pub workers: Vec<WorkerSlot>,
    pub started: Instant,
    pub started_unix: i64,
}

impl Server {
    /// Load the static assets and assemble shared state. Fails when the
    /// working directory is missing its files.
    pub fn new(config: Config) -> anyhow::Result<Arc<Server>> {
        let assets = Assets::load(&config.data_dir)?;
        let workers = (0..config.workers).map(|_| WorkerSlot::default()).collect();
        let (started_unix, _) = unix_parts(SystemTime::now());
        Ok(Arc::new(Server {
            config,
            lifecycle: Lifecycle::new(HELPERS),
            stats: Counters::default(),
            connections: Gauge::default(),
            claims: ClaimQueue::new(),
            assets,
            nowish: NowCache::new(),
            recent: RecentSignal::new(),
            workers,
            started: Instant::now(),
            started_unix,
        }))
    }

    /// Milliseconds since the server value was created; worker slots
    /// timestamp their reads on this clock.
    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Fire shutdown: producers stop, queue and recent waiters wake.
    pub fn request_shutdown(&self) {
        self.lifecycle.shutdown.notify();
        self.claims.interrupt();
        self.recent.interrupt();
    }

    /// Fire termination: the claim consumer drains and exits.
    pub fn request_terminate(&self) {
        self.lifecycle.terminate.notify();
        self.claims.interrupt();
    }

    /// Send the cancellation signal to every worker that has not yet
    /// exited its loop.
    pub fn cancel_live_workers(&self) {
        for slot in &self.workers {
            if !slot.shutdown.load(Ordering::Relaxed) {
                lifecycle::cancel_thread(slot.thread_id.load(Ordering::Relaxed));
            }
        }
    }

    /// Spawn helpers and workers, supervise until shutdown, then take
    /// everything down in order. Blocks the calling thread for the
    /// lifetime of the server.
    pub fn run(self: &Arc<Server>) -> anyhow::Result<()> {
        lifecycle::install_cancel_handler().context("install cancellation handler")?;

        // helpers first; every dynamic asset gets content before any
        // listener opens
        let mut helpers: Vec<JoinHandle<()>> = Vec::new();
        for job in &score::JOBS {
            let server = Arc::clone(self);
            helpers.push(
                thread::Builder::new()
                    .name(job.name.to_string())
                    .spawn(move || score::run(server, job))
                    .context("spawn score worker")?,
            );
        }
        {
            let server = Arc::clone(self);
            helpers.push(
                thread::Builder::new()
                    .name("RecentWorker".to_string())
                    .spawn(move || recent::run(server))
                    .context("spawn recent worker")?,
            );
        }
        {
            let server = Arc::clone(self);
            helpers.push(
                thread::Builder::new()
                    .name("NowWorker".to_string())
                    .spawn(move || clock::run(server))
                    .context("spawn now worker")?,
            );
        }
        let claimer = {
            let server = Arc::clone(self);
            thread::Builder::new()
                .name("ClaimWorker".to_string())
                .spawn(move || ingest::run(server))
                .context("spawn claim worker")?
        };

        self.lifecycle.ready.arrive();
        self.lifecycle.ready.wait();
        info!("Online");

        // bind every listener before spawning so a taken port is a boot
        // failure, not a half-started pool
        let mut listeners = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers {
            match worker::bind_listener(&self.config) {
                Ok(listener) => listeners.push(listener),
                Err(err) => {
                    self.request_shutdown();
                    self.request_terminate();
                    for handle in helpers {
                        let _ = handle.join();
                    }
                    let _ = claimer.join();
                    return Err(err);
                }
            }
        }
        let mut pool = Vec::with_capacity(self.config.workers);
        for (id, listener) in listeners.into_iter().enumerate() {
            let server = Arc::clone(self);
            pool.push(
                thread::Builder::new()
                    .name(format!("HTTP #{id}"))
                    .spawn(move || worker::run(server, id, listener))
                    .context("spawn http worker")?,
            );
        }
        info!("Ready");

        supervise::run(self);

        info!("Interrupting workers...");
        self.cancel_live_workers();
        info!("Waiting for workers to finish...");
        for handle in pool {
            let _ = handle.join();
        }
        info!("Waiting for helpers to finish...");
        for handle in helpers {
            let _ = handle.join();
        }

        info!("Waiting for queue to empty...");
        self.request_terminate();
        let _ = claimer.join();
        if !self.claims.is_empty() {
            warn!("{} claims left undrained", self.claims.len());
        }

        info!("Goodbye");
        Ok(())
    }
}
