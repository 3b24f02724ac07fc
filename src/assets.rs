//! Servable assets: versioned (raw, gzip) payload pairs behind a
//! shared/exclusive lock, plus the disk-backed load and hot-reload
//! paths.
//!
//! A publish swaps the entire generation at once; readers either see the
//! whole old generation or the whole new one, never a mix.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use log::{info, warn};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::clock::{format_http_date, unix_parts};
use crate::db::GenError;
use crate::gzip;
use crate::stats::Counters;

/// Cache-Control freshness for the disk-backed HTML pages, seconds.
const HTML_CASH: i32 = 900;
/// Cache-Control freshness for the favicon, seconds.
const FAVICON_CASH: i32 = 86_400;

/// One fully-formed servable generation.
pub struct AssetContent {
    pub raw: Vec<u8>,
    pub gzip: Vec<u8>,
    pub mtime: SystemTime,
    /// `mtime` at second precision, for `If-Modified-Since` checks.
    pub mtime_unix: i64,
    /// Preformatted `Last-Modified` value.
    pub last_modified: String,
    pub content_type: &'static str,
    /// Cache-Control max-age, seconds.
    pub cash: i32,
}

impl Default for AssetContent {
    fn default() -> AssetContent {
        AssetContent {
            raw: Vec::new(),
            gzip: Vec::new(),
            mtime: SystemTime::UNIX_EPOCH,
            mtime_unix: 0,
            last_modified: format_http_date(0),
            content_type: "application/octet-stream",
            cash: 0,
        }
    }
}

/// Assemble a dynamically generated JSON generation stamped with its
/// creation time.
pub fn json_content(raw: Vec<u8>, cash: i32, created: SystemTime) -> Result<AssetContent, GenError> {
    let gzip = gzip::compress(&raw)?;
    let (secs, _) = unix_parts(created);
    Ok(AssetContent {
        raw,
        gzip,
        mtime: created,
        mtime_unix: secs,
        last_modified: format_http_date(secs),
        content_type: "application/json",
        cash,
    })
}

/// One atomically swappable asset cell. Readers take the shared lock
/// for exactly as long as it takes to copy a response together.
pub struct Asset {
    path: Option<PathBuf>,
    state: RwLock<AssetContent>,
}

impl Asset {
    /// A cell with no backing file, filled later by a regenerator.
    pub fn empty() -> Asset {
        Asset {
            path: None,
            state: RwLock::new(AssetContent::default()),
        }
    }

    /// Slurp a static file and pre-compress it. Missing files are fatal
    /// at boot.
    pub fn load(path: PathBuf, content_type: &'static str, cash: i32) -> anyhow::Result<Asset> {
        let content = read_disk(&path, content_type, cash)
            .with_context(|| format!("load static asset {}", path.display()))?;
        Ok(Asset {
            path: Some(path),
            state: RwLock::new(content),
        })
    }

    /// Shared-locked view for response composition.
    pub fn read(&self) -> RwLockReadGuard<'_, AssetContent> {
        self.state.read()
    }

    /// Swap in a fully-formed new generation. The old buffers are
    /// dropped only after the exclusive section releases.
    pub fn publish(&self, new: AssetContent) {
        let mut guard = self.state.write();
        let old = std::mem::replace(&mut *guard, new);
        drop(guard);
        drop(old);
    }

    /// Re-stat the backing file and republish iff its mtime advanced.
    /// Returns true when a new generation was published.
    pub fn reload_if_modified(&self) -> Result<bool, GenError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let disk_mtime = fs::metadata(path)?.modified()?;
        let (content_type, cash, cell_mtime) = {
            let state = self.state.read();
            (state.content_type, state.cash, state.mtime)
        };
        if disk_mtime <= cell_mtime {
            return Ok(false);
        }
        let content = read_disk(path, content_type, cash)?;
        self.publish(content);
        Ok(true)
    }
}

fn read_disk(path: &Path, content_type: &'static str, cash: i32) -> Result<AssetContent, GenError> {
    let mtime = fs::metadata(path)?.modified()?;
    let raw = fs::read(path)?;
    let gzip = gzip::compress(&raw)?;
    let (secs, _) = unix_parts(mtime);
    Ok(AssetContent {
        raw,
        gzip,
        mtime,
        mtime_unix: secs,
        last_modified: format_http_date(secs),
        content_type,
        cash,
    })
}

/// The fixed record of named cells served by the HTTP workers.
pub struct Assets {
    pub index: Asset,
    pub about: Asset,
    pub user: Asset,
    pub favicon: Asset,
    pub score: Asset,
    pub score_hour: Asset,
    pub score_day: Asset,
    pub score_week: Asset,
    pub score_month: Asset,
    pub recent: Asset,
}

impl Assets {
    /// Load the disk-backed statics into memory; dynamic cells start
    /// empty and receive first content before the startup barrier
    /// releases.
    pub fn load(data_dir: &Path) -> anyhow::Result<Assets> {
        let html = "text/html; charset=utf-8";
        Ok(Assets {
            index: Asset::load(data_dir.join("index.html"), html, HTML_CASH)?,
            about: Asset::load(data_dir.join("about.html"), html, HTML_CASH)?,
            user: Asset::load(data_dir.join("user.html"), html, HTML_CASH)?,
            favicon: Asset::load(
                data_dir.join("favicon.ico"),
                "image/vnd.microsoft.icon",
                FAVICON_CASH,
            )?,
            score: Asset::empty(),
            score_hour: Asset::empty(),
            score_day: Asset::empty(),
            score_week: Asset::empty(),
            score_month: Asset::empty(),
            recent: Asset::empty(),
        })
    }

    /// Hot-reload every disk-backed cell whose file changed.
    pub fn reload_statics(&self, counters: &Counters) {
        for (name, asset) in [
            ("index.html", &self.index),
            ("about.html", &self.about),
            ("user.html", &self.user),
            ("favicon.ico", &self.favicon),
        ] {
            match asset.reload_if_modified() {
                Ok(true) => info!("reloaded {name}"),
                Ok(false) => {}
                Err(err) => {
                    counters.count_gen_error(&err);
                    warn!("reload {name}: {err}");
                }
            }
        }
    }
}
