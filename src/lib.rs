//! Internet-facing game server where players claim IPv4 /24 blocks by
//! pinging `/claim` under a chosen nickname.
//!
//! The crate is organized around a [`server::Server`] value owned by
//! `main`: a pool of HTTP worker threads ingests claims into a bounded
//! deadline-aware queue, a single consumer drains them into SQLite in
//! batched transactions, and a family of periodic regenerators publishes
//! pre-compressed JSON snapshots that workers serve under a shared lock.

pub mod assets;
pub mod claims;
pub mod clock;
pub mod config;
pub mod db;
pub mod gzip;
pub mod http;
pub mod ingest;
pub mod lifecycle;
pub mod net;
pub mod recent;
pub mod score;
pub mod server;
pub mod stats;
pub mod supervise;
