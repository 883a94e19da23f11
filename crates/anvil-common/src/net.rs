//! MAC and IP helpers shared by the hardware store, the renderer and the
//! worker index.

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;

static MAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").unwrap());

/// Normalize a MAC address to lowercase with colons.
pub fn normalize_mac(mac: &str) -> String {
    mac.to_lowercase().replace('-', ":")
}

/// Whether the string is a MAC address (colon or dash separated).
pub fn is_mac(s: &str) -> bool {
    MAC_RE.is_match(s)
}

/// Whether the string is an IPv4 or IPv6 address.
pub fn is_ip(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Canonical form of a worker address: MACs are normalized, IPs kept as-is.
pub fn normalize_worker_addr(addr: &str) -> String {
    if is_mac(addr) {
        normalize_mac(addr)
    } else {
        addr.to_string()
    }
}
