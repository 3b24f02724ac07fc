//! Client address classification: which peers may speak for others via
//! `X-Forwarded-For`, and extraction of the forwarded IPv4 address.

use std::net::Ipv4Addr;

/// One CIDR block as (network, prefix length).
type Range = (u32, u32);

const fn net(a: u8, b: u8, c: u8, d: u8, bits: u32) -> Range {
    (u32::from_be_bytes([a, b, c, d]), bits)
}

/// CDN edge ranges trusted to proxy for clients (Cloudflare's published
/// IPv4 space). Kept behind `is_trusted_proxy` so the list can change
/// without touching the request path.
const CDN_RANGES: &[Range] = &[
    net(103, 21, 244, 0, 22),
    net(103, 22, 200, 0, 22),
    net(103, 31, 4, 0, 22),
    net(104, 16, 0, 0, 13),
    net(104, 24, 0, 0, 14),
    net(108, 162, 192, 0, 18),
    net(131, 0, 72, 0, 22),
    net(141, 101, 64, 0, 18),
    net(162, 158, 0, 0, 15),
    net(172, 64, 0, 0, 13),
    net(173, 245, 48, 0, 20),
    net(188, 114, 96, 0, 20),
    net(190, 93, 240, 0, 20),
    net(197, 234, 240, 0, 22),
    net(198, 41, 128, 0, 17),
];

fn in_range(ip: u32, range: Range) -> bool {
    let (network, bits) = range;
    (ip ^ network) >> (32 - bits) == 0
}

pub fn is_loopback(ip: u32) -> bool {
    ip >> 24 == 127
}

pub fn is_private(ip: u32) -> bool {
    in_range(ip, net(10, 0, 0, 0, 8))
        || in_range(ip, net(172, 16, 0, 0, 12))
        || in_range(ip, net(192, 168, 0, 0, 16))
}

pub fn is_cdn(ip: u32) -> bool {
    CDN_RANGES.iter().any(|&range| in_range(ip, range))
}

/// A peer may supply `X-Forwarded-For` iff it is loopback, RFC1918
/// private, or a known CDN edge.
pub fn is_trusted_proxy(ip: u32) -> bool {
    is_loopback(ip) || is_private(ip) || is_cdn(ip)
}

/// First IPv4 element of an `X-Forwarded-For` value. `None` means the
/// header only carries IPv6 hops (or nothing parseable).
pub fn parse_forwarded(value: &str) -> Option<u32> {
    for part in value.split(',') {
        let part = part.trim();
        // tolerate a :port suffix on dotted-quad elements
        let host = match part.find(':') {
            Some(colon) if part.contains('.') => &part[..colon],
            _ => part,
        };
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Some(u32::from(addr));
        }
    }
    None
}
