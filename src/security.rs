use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Parses the original client IP from X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Parses allowlist entries, each either a single address or a CIDR subnet
pub fn parse_allowlist(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.trim();
            entry
                .parse::<IpAddr>()
                .map(IpNet::from)
                .or_else(|_| entry.parse::<IpNet>())
                .map_err(|_| anyhow!("Invalid IP address or CIDR in allowed_proxy_ips: {entry}"))
        })
        .collect()
}

/// Checks if a proxy IP address is allowed based on the configured allowlist
/// Returns true if no allowlist is configured (allow all) or if IP matches any entry
#[must_use]
pub fn is_proxy_ip_allowed(proxy_ip: IpAddr, allowed: Option<&[IpNet]>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };

    // IPv4 peers can show up as IPv4-mapped IPv6 on dual-stack listeners
    let proxy_ip = match proxy_ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(proxy_ip, IpAddr::V4),
        IpAddr::V4(_) => proxy_ip,
    };

    allowed.iter().any(|net| net.contains(&proxy_ip))
}
