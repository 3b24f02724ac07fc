//! HTTP worker threads.
//!
//! Each worker owns one SO_REUSEPORT listener (the kernel balances
//! accepts across the pool) and runs a keepalive accept/serve loop.
//! Blocked `accept`/`read` calls are cancellable: the supervisor or the
//! shutdown path delivers SIGUSR1, the no-op handler makes the syscall
//! fail with EINTR, and the worker treats that as a failed read.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::claims::{self, Claim};
use crate::config::Config;
use crate::lifecycle;
use crate::server::Server;
use crate::stats;

use super::request::{HttpRequest, Method, list_has};
use super::response::Response;

/// How long `/claim` may block when the queue is full, milliseconds.
pub const CLAIM_DEADLINE_MS: u64 = 50;

const INBUF_SIZE: usize = 4096;

/// 1x1 transparent GIF served for image-flavored claims.
pub const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff,
    0xff, 0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Per-worker slot shared with the supervisor.
#[derive(Default)]
pub struct WorkerSlot {
    /// pthread identity, for SIGUSR1 cancellation. Zero until started.
    pub thread_id: AtomicU64,
    /// Messages served on the current connection.
    pub msgcount: AtomicI32,
    /// Set once the worker's loop has exited.
    pub shutdown: AtomicBool,
    /// A client is currently connected.
    pub connected: AtomicBool,
    /// Milliseconds since server start when the pending read began.
    pub start_read_ms: AtomicU64,
}

/// Create one listener for the shared port: SO_REUSEADDR + SO_REUSEPORT,
/// socket timeouts equal to the keepalive, fast-open and quick-ack
/// hints. A taken port surfaces here, at boot.
pub fn bind_listener(config: &Config) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("create listener socket")?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_read_timeout(Some(config.keepalive()))?;
    socket.set_write_timeout(Some(config.keepalive()))?;
    set_tcp_hints(&socket);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind port {}", config.port))?;
    socket.listen(1).context("listen")?;
    Ok(socket.into())
}

#[cfg(target_os = "linux")]
fn set_tcp_hints(socket: &Socket) {
    use std::os::fd::AsRawFd;
    let yes: libc::c_int = 1;
    let len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let fd = socket.as_raw_fd();
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            (&raw const yes).cast(),
            len,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            (&raw const yes).cast(),
            len,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_hints(_socket: &Socket) {}

/// Worker thread body: accept loop until shutdown.
pub fn run(server: Arc<Server>, id: usize, listener: TcpListener) {
    lifecycle::block_all_signals();
    lifecycle::avoid_first_cpus(2);
    let slot = &server.workers[id];
    slot.thread_id
        .store(lifecycle::current_thread_id(), Ordering::Relaxed);

    let mut inbuf = vec![0u8; INBUF_SIZE];

    while !server.lifecycle.shutdown.is_notified() {
        // this accept may be cancelled by SIGUSR1
        lifecycle::allow_cancel_signal();
        let (mut stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) => {
                // spinning on the listener's receive timeout is normal
                if !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                    server.stats.acceptfails.bump();
                }
                continue;
            }
        };
        lifecycle::block_all_signals();
        let SocketAddr::V4(peer) = peer else {
            continue;
        };
        let peer_ip = u32::from(*peer.ip());
        let _ = stream.set_read_timeout(Some(server.config.keepalive()));
        let _ = stream.set_write_timeout(Some(server.config.keepalive()));

        slot.connected.store(true, Ordering::Relaxed);
        slot.msgcount.store(0, Ordering::Relaxed);
        server.stats.accepts.bump();
        server.connections.inc();

        serve_connection(&server, slot, &mut stream, peer_ip, &mut inbuf);

        drop(stream);
        server.connections.dec();
        slot.connected.store(false, Ordering::Relaxed);
    }

    debug!("HTTP #{id} exiting");
    slot.shutdown.store(true, Ordering::Relaxed);
}

/// Keepalive message loop for one connection. Assumes a well-behaved
/// frontend: each read should carry exactly one message, and anything
/// short, pipelined, or payload-bearing ends the connection.
fn serve_connection(
    server: &Server,
    slot: &WorkerSlot,
    stream: &mut TcpStream,
    peer_ip: u32,
    inbuf: &mut [u8],
) {
    loop {
        // this read may be cancelled by SIGUSR1
        lifecycle::allow_cancel_signal();
        slot.start_read_ms
            .store(server.uptime_ms(), Ordering::Relaxed);
        let got = match stream.read(inbuf) {
            Ok(0) | Err(_) => {
                server.stats.readfails.bump();
                return;
            }
            Ok(n) => n,
        };
        lifecycle::block_all_signals();

        let Some(req) = HttpRequest::parse(&inbuf[..got]) else {
            server.stats.parsefails.bump();
            return;
        };
        server.stats.messages.bump();
        slot.msgcount.fetch_add(1, Ordering::Relaxed);

        let (ip, ipv6) = effective_ip(server, &req, peer_ip);
        let ip_str = Ipv4Addr::from(ip).to_string();
        let date = server.nowish.date();

        if req.minor_version != 1 {
            info!("{ip_str} used unsupported http/1.{}", req.minor_version);
            server.stats.badversions.bump();
            let body = b"HTTP Version Not Supported\n";
            let buf = Response::new("505 HTTP Version Not Supported", &date)
                .header("Content-Type", "text/plain")
                .header("Connection", "close")
                .payload(body, true);
            let _ = stream.write_all(&buf);
            return;
        }

        info!("{ip_str:>16} {} {}", req.method_name, req.target);

        let (buf, close) = dispatch(server, &req, ip, ipv6, &ip_str, &date);
        let sent_ok = stream.write_all(&buf).is_ok();

        let keep = sent_ok
            && !close
            && got == req.len
            && !req.has_header("Content-Length")
            && !req.has_header("Transfer-Encoding")
            && matches!(req.method, Method::Get | Method::Head)
            && !server.lifecycle.shutdown.is_notified();
        if !keep {
            return;
        }
    }
}

/// Route one request and compose its response. Returns the response
/// bytes and whether the connection must close afterwards.
fn dispatch(
    server: &Server,
    req: &HttpRequest<'_>,
    ip: u32,
    ipv6: bool,
    ip_str: &str,
    date: &str,
) -> (Vec<u8>, bool) {
    let target = req.target;

    if target == "/statusz" {
        return (serve_statusz(server, date), true);
    }

    let asset = if target == "/" || target.starts_with("/index.html") {
        Some(&server.assets.index)
    } else if target.starts_with("/favicon.ico") {
        Some(&server.assets.favicon)
    } else if target.starts_with("/about.html") {
        Some(&server.assets.about)
    } else if target.starts_with("/user.html") {
        Some(&server.assets.user)
    } else if target.starts_with("/score/hour") {
        Some(&server.assets.score_hour)
    } else if target.starts_with("/score/day") {
        Some(&server.assets.score_day)
    } else if target.starts_with("/score/week") {
        Some(&server.assets.score_week)
    } else if target.starts_with("/score/month") {
        Some(&server.assets.score_month)
    } else if target.starts_with("/score") {
        Some(&server.assets.score)
    } else if target.starts_with("/recent") {
        Some(&server.assets.recent)
    } else {
        None
    };

    if let Some(asset) = asset {
        return (serve_asset(server, req, asset, date), false);
    }

    if target.starts_with("/ip") {
        server.stats.iprequests.bump();
        if ipv6 {
            return (need_ipv4(req, ip_str, date), true);
        }
        let buf = Response::new("200 OK", date)
            .header("Vary", "Accept")
            .header("Content-Type", "text/plain")
            .header("Cache-Control", "max-age=3600, private")
            .payload(ip_str.as_bytes(), true);
        return (buf, false);
    }

    if target.starts_with("/claim") {
        return serve_claim(server, req, ip, ipv6, ip_str, date);
    }

    server.stats.notfounds.bump();
    info!("{ip_str}: 404 not found {target}");
    let body = b"<!doctype html>\r\n<title>404 not found</title>\r\n<h1>404 not found</h1>\r\n";
    let buf = Response::new("404 Not Found", date)
        .header("Content-Type", "text/html; charset=utf-8")
        .payload(body, true);
    (buf, false)
}

/// Compute the effective client address. `X-Forwarded-For` is honored
/// only from loopback, private, or CDN peers; the boolean says whether
/// the effective address turned out IPv6-only.
fn effective_ip(server: &Server, req: &HttpRequest<'_>, peer_ip: u32) -> (u32, bool) {
    match req.header_str("X-Forwarded-For") {
        None => {
            server.stats.unproxied.bump();
            (peer_ip, false)
        }
        Some(value) => {
            if !crate::net::is_trusted_proxy(peer_ip) {
                warn!(
                    "got X-Forwarded-For from untrusted client address {}",
                    Ipv4Addr::from(peer_ip)
                );
                server.stats.unproxied.bump();
                (peer_ip, false)
            } else if let Some(forwarded) = crate::net::parse_forwarded(value) {
                server.stats.proxied.bump();
                (forwarded, false)
            } else {
                server.stats.ipv6forwards.bump();
                server.stats.proxied.bump();
                (peer_ip, true)
            }
        }
    }
}

/// Serve one asset cell: 304 against `If-Modified-Since` at second
/// precision, otherwise 200 with content negotiation for gzip. The
/// response is copied together under the shared lock and written after
/// it releases.
fn serve_asset(server: &Server, req: &HttpRequest<'_>, asset: &crate::assets::Asset, date: &str) -> Vec<u8> {
    server.stats.assetrequests.bump();
    let accepts_gzip = req
        .header_str("Accept-Encoding")
        .is_some_and(|v| list_has(v, "gzip"));
    let modified_since = req
        .header_str("If-Modified-Since")
        .and_then(crate::clock::parse_http_date);

    let cell = asset.read();
    let cache_control = format!("max-age={}, must-revalidate", cell.cash);
    if modified_since.is_some_and(|since| cell.mtime_unix <= since) {
        return Response::new("304 Not Modified", date)
            .header("Vary", "Accept-Encoding")
            .header("Last-Modified", &cell.last_modified)
            .header("Content-Type", cell.content_type)
            .header("Cache-Control", &cache_control)
            .finish();
    }

    let compressed = accepts_gzip && cell.gzip.len() < cell.raw.len();
    let body = if compressed { &cell.gzip } else { &cell.raw };
    let mut response = Response::new("200 OK", date)
        .header("Vary", "Accept-Encoding")
        .header("Last-Modified", &cell.last_modified)
        .header("Content-Type", cell.content_type)
        .header("Cache-Control", &cache_control);
    if compressed {
        response = response.header("Content-Encoding", "gzip");
    }
    response.payload(body, req.method != Method::Head)
}

/// `/claim`: validate, enqueue with the 50 ms budget, then answer in
/// whatever shape the `Accept` header asks for.
fn serve_claim(
    server: &Server,
    req: &HttpRequest<'_>,
    ip: u32,
    ipv6: bool,
    ip_str: &str,
    date: &str,
) -> (Vec<u8>, bool) {
    server.stats.claimrequests.bump();
    if ipv6 {
        return (need_ipv4(req, ip_str, date), true);
    }

    let Some(nick) = claims::nick_from_query(req.query) else {
        server.stats.invalidnames.bump();
        info!("{ip_str}: 400 invalid name");
        let buf = Response::new("400 Invalid Name", date)
            .header("Content-Type", "text/plain")
            .header("Cache-Control", "private")
            .header("Connection", "close")
            .payload(b"invalid name", true);
        return (buf, true);
    };

    let claim = Claim {
        ip,
        nick: nick.clone(),
        created: server.nowish.unix_seconds(),
    };
    let deadline = Instant::now() + Duration::from_millis(CLAIM_DEADLINE_MS);
    if !server
        .claims
        .enqueue(claim, deadline, &server.lifecycle.shutdown)
    {
        server.stats.queuefulls.bump();
        info!("{ip_str}: 502 claims queue full");
        let buf = Response::new("502 Claims Queue Full", date)
            .header("Content-Type", "text/plain")
            .header("Connection", "close")
            .payload(b"Claims Queue Full\n", true);
        return (buf, true);
    }

    debug!("{ip_str} claimed by {nick}");
    let accept = req.header_str("Accept");
    let buf = match accept {
        Some(value) if list_has(value, "image/*") || list_has(value, "image/gif") => {
            server.stats.imageclaims.bump();
            Response::new("200 OK", date)
                .header("Vary", "Accept")
                .header("Cache-Control", "private")
                .header("Content-Type", "image/gif")
                .payload(&PIXEL_GIF, true)
        }
        Some(value) if list_has(value, "text/plain") && !list_has(value, "text/html") => {
            server.stats.plainclaims.bump();
            let body = format!("The land at {ip_str} was claimed for {nick}\n");
            Response::new("200 OK", date)
                .header("Vary", "Accept")
                .header("Cache-Control", "private")
                .header("Content-Type", "text/plain")
                .payload(body.as_bytes(), true)
        }
        None => html_claim(server, ip_str, &nick, date),
        Some(value)
            if list_has(value, "text/html")
                || list_has(value, "text/*")
                || list_has(value, "*/*") =>
        {
            html_claim(server, ip_str, &nick, date)
        }
        Some(_) => {
            server.stats.emptyclaims.bump();
            Response::new("204 No Content", date)
                .header("Vary", "Accept")
                .header("Cache-Control", "private")
                .header("Content-Length", "0")
                .finish()
        }
    };
    (buf, false)
}

fn html_claim(server: &Server, ip_str: &str, nick: &str, date: &str) -> Vec<u8> {
    server.stats.htmlclaims.bump();
    let body = format!(
        "<!doctype html>\n\
         <title>The land at {ip_str} was claimed for {nick}.</title>\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         The land at {ip_str} was claimed for <a href=\"/user.html?name={nick}\">{nick}</a>.\n\
         <p>\n\
         <a href=/>Back to homepage</a>\n"
    );
    Response::new("200 OK", date)
        .header("Vary", "Accept")
        .header("Cache-Control", "private")
        .header("Content-Type", "text/html")
        .payload(body.as_bytes(), true)
}

fn need_ipv4(req: &HttpRequest<'_>, ip_str: &str, date: &str) -> Vec<u8> {
    debug!(
        "{:?} via {ip_str}: 400 need ipv4",
        req.header_str("X-Forwarded-For")
    );
    let body = b"IPv4 Games only supports IPv4 right now";
    Response::new("400 Need IPv4", date)
        .header("Vary", "Accept")
        .header("Content-Type", "text/plain")
        .header("Cache-Control", "private")
        .header("Connection", "close")
        .payload(body, true)
}

fn serve_statusz(server: &Server, date: &str) -> Vec<u8> {
    server.stats.statuszrequests.bump();
    let body = stats::render_statusz(
        server.started_unix,
        server.nowish.unix_seconds(),
        server.connections.get(),
        server.config.workers,
        &server.stats,
    );
    Response::new("200 OK", date)
        .header("Content-Type", "text/plain")
        .header("Cache-Control", "max-age=0, must-revalidate")
        .header("Connection", "close")
        .payload(body.as_bytes(), true)
}
