//! turfwar server binary: CLI, daemonization, and shutdown-signal
//! routing around [`turfwar::server::Server`].

use std::ffi::CString;
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, bail};
use clap::Parser;
use clap::error::ErrorKind;
use log::{error, info};
use nix::sys::signal::{SigSet, Signal};

use turfwar::config::{Cli, Config, WORKING_DIR};
use turfwar::lifecycle;
use turfwar::server::Server;

const BANNER: &str = r"
 |               _|
 __| |   |  __| | \ \  \   / _` |  __|
 |   |   | |    __|\ \  \ / (   | |
\__|\__,_|_|   _|   \_/\_/ \__,_|_|
";

/// Exit code for a malformed command line.
const EX_USAGE: i32 = 64;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == ErrorKind::DisplayHelp => {
            let _ = err.print();
            return;
        }
        Err(err) => {
            let _ = err.print();
            process::exit(EX_USAGE);
        }
    };

    println!("{BANNER}");

    if let Err(err) = run(cli) {
        error!("fatal: {err:#}");
        eprintln!("turfwar: {err:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    std::env::set_current_dir(WORKING_DIR)
        .with_context(|| format!("chdir {WORKING_DIR}"))?;

    if cli.daemonize {
        daemonize().context("daemonize")?;
    }
    init_logging(cli.verbosity);

    // every thread inherits a fully blocked mask; the signal thread
    // routes shutdown signals, workers selectively unmask SIGUSR1
    lifecycle::block_all_signals();
    lifecycle::install_cancel_handler().context("install cancellation handler")?;

    let config = Config::from_cli(&cli);
    let server = Server::new(config)?;

    {
        let server = Arc::clone(&server);
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || signal_thread(server))
            .context("spawn signal thread")?;
    }

    server.run()
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

/// Route SIGINT/SIGTERM/SIGHUP. The first one fires shutdown; repeats
/// send another SIGUSR1 volley to workers still stuck in i/o.
fn signal_thread(server: Arc<Server>) {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGHUP);
    loop {
        let Ok(signal) = signals.wait() else {
            continue;
        };
        if !server.lifecycle.shutdown.is_notified() {
            info!("received {signal:?}, shutting down...");
            server.request_shutdown();
        } else {
            info!("received {signal:?} again, sending another volley...");
            server.cancel_live_workers();
        }
    }
}

/// Double-fork into the background: new session, `umask(0)`, stdio to
/// `/dev/null`, stderr appended to `turfwar.log` in the working
/// directory. Must run before any thread is spawned.
fn daemonize() -> anyhow::Result<()> {
    let devnull = CString::new("/dev/null").expect("static path");
    let logfile = CString::new("turfwar.log").expect("static path");
    unsafe {
        match libc::fork() {
            -1 => bail!("first fork failed"),
            0 => {}
            _ => process::exit(0),
        }
        if libc::setsid() == -1 {
            bail!("setsid failed");
        }
        match libc::fork() {
            -1 => bail!("second fork failed"),
            0 => {}
            _ => process::exit(0),
        }
        libc::umask(0);
        libc::close(0);
        libc::close(1);
        libc::close(2);
        if libc::open(devnull.as_ptr(), libc::O_RDWR) != 0 {
            bail!("reopen stdin failed");
        }
        if libc::dup(0) != 1 {
            bail!("reopen stdout failed");
        }
        if libc::open(logfile.as_ptr(), libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND, 0o644)
            != 2
        {
            bail!("open turfwar.log failed");
        }
    }
    Ok(())
}
