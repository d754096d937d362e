//! Outbound network policy.
//!
//! `fetch()` and `EventSource` targets are checked against an SSRF policy:
//! loopback, private and link-local destinations are denied unless the
//! engine is configured to allow them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use url::Url;

fn ipv4_is_forbidden(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // Carrier-grade NAT, 100.64.0.0/10.
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn ipv6_is_forbidden(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return ipv4_is_forbidden(mapped);
    }
    ip.is_loopback()
        || ip.is_unspecified()
        // Unique-local fc00::/7 and link-local fe80::/10.
        || (ip.segments()[0] & 0xfe00) == 0xfc00
        || (ip.segments()[0] & 0xffc0) == 0xfe80
}

fn ip_is_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ipv4_is_forbidden(v4),
        IpAddr::V6(v6) => ipv6_is_forbidden(v6),
    }
}

/// Validate an outbound target. Resolves the host and rejects any address in
/// a forbidden range unless `allow_private` is set. http/https only.
pub fn ensure_public_target(raw_url: &str, allow_private: bool) -> Result<Url, String> {
    let url = Url::parse(raw_url).map_err(|e| format!("invalid URL '{raw_url}': {e}"))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}'")),
    }

    let host = url
        .host_str()
        .ok_or_else(|| format!("URL '{raw_url}' has no host"))?;

    if allow_private {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") || host.ends_with(".localhost") {
        return Err(format!("access to '{host}' is not allowed"));
    }

    // IP literal: check directly without resolving.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if ip_is_forbidden(ip) {
            return Err(format!("access to address '{ip}' is not allowed"));
        }
        return Ok(url);
    }

    // Hostname: every resolved address must be public.
    let port = url.port_or_known_default().unwrap_or(443);
    let resolved = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("could not resolve '{host}': {e}"))?;
    for addr in resolved {
        if ip_is_forbidden(addr.ip()) {
            return Err(format!(
                "host '{host}' resolves to forbidden address '{}'",
                addr.ip()
            ));
        }
    }

    Ok(url)
}
