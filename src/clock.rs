//! Cached wall-clock state shared by every response.
//!
//! Breaking the clock down to UTC fields is expensive enough to matter
//! at high request rates, so a dedicated worker refreshes the cache
//! every 500 ms and responses copy the preformatted `Date` value under
//! a shared lock.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;

use crate::lifecycle;
use crate::server::Server;

/// How often the cached date header is recomputed.
pub const DATE_UPDATE_MS: u64 = 500;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a unix timestamp as a 29-byte HTTP date.
pub fn format_http_date(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

/// Parse an HTTP date (e.g. `If-Modified-Since`) into unix seconds.
pub fn parse_http_date(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(s).ok().map(|t| t.timestamp())
}

/// Split a wall-clock instant into the `[secs, nanos]` pair published
/// in the JSON snapshots.
pub fn unix_parts(at: SystemTime) -> (i64, u32) {
    let since = at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (since.as_secs() as i64, since.subsec_nanos())
}

struct NowState {
    unix_secs: i64,
    date: String,
}

/// Process-wide cached time: unix seconds plus the HTTP `Date` header
/// value they format to.
pub struct NowCache {
    state: RwLock<NowState>,
}

impl NowCache {
    pub fn new() -> NowCache {
        let cache = NowCache {
            state: RwLock::new(NowState {
                unix_secs: 0,
                date: String::new(),
            }),
        };
        cache.update();
        cache
    }

    /// Recompute the cache from the wall clock.
    pub fn update(&self) {
        let (secs, _) = unix_parts(SystemTime::now());
        let date = format_http_date(secs);
        let mut state = self.state.write();
        state.unix_secs = secs;
        state.date = date;
    }

    /// Current unix seconds, at cache granularity.
    pub fn unix_seconds(&self) -> i64 {
        self.state.read().unix_secs
    }

    /// Copy of the cached `Date` header value.
    pub fn date(&self) -> String {
        self.state.read().date.clone()
    }
}

impl Default for NowCache {
    fn default() -> NowCache {
        NowCache::new()
    }
}

/// Worker loop: refresh the cache every [`DATE_UPDATE_MS`] until
/// shutdown.
pub fn run(server: Arc<Server>) {
    lifecycle::block_all_signals();
    info!("NowWorker started");
    server.nowish.update();
    lifecycle::pin_to_cpu(0);
    server.lifecycle.ready.arrive();
    let mut deadline = Instant::now();
    loop {
        deadline += Duration::from_millis(DATE_UPDATE_MS);
        if server.lifecycle.shutdown.wait_until(deadline) {
            break;
        }
        server.nowish.update();
    }
    info!("NowWorker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_the_canonical_29_byte_date() {
        let date = format_http_date(0);
        assert_eq!(date, "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(date.len(), 29);
        assert_eq!(format_http_date(1_666_000_000), "Mon, 17 Oct 2022 09:46:40 GMT");
    }

    #[test]
    fn parses_what_it_formats() {
        for secs in [0, 1_000_000_000, 1_666_000_000] {
            let formatted = format_http_date(secs);
            assert_eq!(parse_http_date(&formatted), Some(secs));
        }
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn cache_tracks_the_clock() {
        let cache = NowCache::new();
        let secs = cache.unix_seconds();
        assert!(secs > 1_600_000_000, "clock reads as a plausible present");
        assert_eq!(cache.date().len(), 29);
    }
}
