//! Runtime configuration derived from the command line.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_PORT: u16 = 8080;
/// Size of the HTTP worker thread pool. The historical deployment ran
/// 9001 threads; the default here stays inside ordinary fd limits and
/// `-w` scales it back up.
pub const DEFAULT_WORKERS: usize = 64;
/// Max time to keep an idle connection open, in milliseconds.
pub const DEFAULT_KEEPALIVE_MS: u64 = 60_000;
/// Directory holding the static assets and the claim database.
pub const WORKING_DIR: &str = "/opt/turfwar";

/// Command line surface: `turfwar [-d] [-v] [-p PORT] [-w WORKERS] [-k KEEPALIVE_MS]`.
#[derive(Debug, Parser)]
#[command(name = "turfwar", about = "turf war game server", disable_version_flag = true)]
pub struct Cli {
    /// Daemonize: detach from the terminal and log to turfwar.log.
    #[arg(short = 'd')]
    pub daemonize: bool,

    /// Raise log verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Listening port.
    #[arg(short = 'p', value_name = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of HTTP worker threads.
    #[arg(short = 'w', value_name = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Keepalive and socket timeout in milliseconds.
    #[arg(short = 'k', value_name = "KEEPALIVE_MS", default_value_t = DEFAULT_KEEPALIVE_MS)]
    pub keepalive_ms: u64,
}

/// Resolved server configuration shared by every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub workers: usize,
    pub keepalive_ms: u64,
    /// Directory holding `index.html` and friends plus `db.sqlite3`.
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Config {
        Config {
            port: cli.port,
            workers: cli.workers.max(1),
            keepalive_ms: cli.keepalive_ms.max(1),
            data_dir: PathBuf::from(WORKING_DIR),
        }
    }

    /// Keepalive as a socket timeout.
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(crate::db::DB_FILE)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
            data_dir: PathBuf::from(WORKING_DIR),
        }
    }
}
