//! Supervisor loop: admission control under load and hot reload of the
//! disk-backed assets.
//!
//! Keepalive stays permissive until worker slots get scarce. At that
//! point connections that are either chatty or stuck mid-read get their
//! worker's blocked i/o cancelled, which reads as a failed read and
//! closes them.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::lifecycle;
use crate::server::Server;

/// How often assets are re-stat'ed and load is checked, milliseconds.
pub const SUPERVISE_MS: u64 = 1000;
/// Connected fraction of the pool that triggers a meltdown.
pub const PANIC_LOAD: f64 = 0.85;
/// Messages per connection tolerated during a meltdown.
pub const PANIC_MSGS: i32 = 10;
/// Read age that counts as stuck during a meltdown, milliseconds.
pub const MELTALIVE_MS: u64 = 2000;

/// Cancel every connection that is chatty or stuck. One sweep counts as
/// one meltdown.
pub fn meltdown(server: &Server) {
    server.stats.meltdowns.bump();
    warn!(
        "panicking because {} out of {} workers are connected",
        server.connections.get(),
        server.config.workers
    );
    let now_ms = server.uptime_ms();
    let mut marks = 0;
    for slot in &server.workers {
        if slot.connected.load(Ordering::Relaxed)
            && (slot.msgcount.load(Ordering::Relaxed) > PANIC_MSGS
                || now_ms.saturating_sub(slot.start_read_ms.load(Ordering::Relaxed))
                    >= MELTALIVE_MS)
        {
            lifecycle::cancel_thread(slot.thread_id.load(Ordering::Relaxed));
            marks += 1;
        }
    }
    info!("melted down {marks} connections");
}

/// Run on the caller's thread until shutdown.
pub fn run(server: &Server) {
    let mut deadline = Instant::now();
    loop {
        deadline += Duration::from_millis(SUPERVISE_MS);
        if server.lifecycle.shutdown.wait_until(deadline) {
            break;
        }
        let connections = server.connections.get();
        if server.config.workers > 1
            && connections as f64 / server.config.workers as f64 > PANIC_LOAD
        {
            meltdown(server);
        }
        server.assets.reload_statics(&server.stats);
    }
}
