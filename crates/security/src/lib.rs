//! SSRF Guard (spec §4.B): reject hostnames that resolve to private,
//! loopback, or link-local addresses before the gateway connects to them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SsrfError {
    #[error("hostname {0:?} is not a permitted target")]
    Blocked(String),
    #[error("address {0} is not publicly routable")]
    PrivateAddress(String),
    #[error("dns resolution failed for {0}: {1}")]
    ResolutionFailed(String, String),
}

/// Normalize a hostname the way the guard expects it: lowercase, strip a
/// trailing dot (FQDN form) and surrounding `[ ]` (IPv6 literal brackets).
fn normalize(host: &str) -> String {
    let mut h = host.trim().to_lowercase();
    if let Some(stripped) = h.strip_prefix('[') {
        h = stripped.to_string();
    }
    if let Some(stripped) = h.strip_suffix(']') {
        h = stripped.to_string();
    }
    if let Some(stripped) = h.strip_suffix('.') {
        h = stripped.to_string();
    }
    h
}

fn is_blocked_literal(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "local"
        || host.ends_with(".local")
        || host == "internal"
        || host.ends_with(".internal")
        || host == "metadata.google.internal"
}

pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_unspecified()
        || octets[0] == 0 // 0.0.0.0/8
        || octets[0] == 10 // 10/8
        || octets[0] == 127 // 127/8
        || (octets[0] == 169 && octets[1] == 254) // 169.254/16
        || (octets[0] == 172 && (16..=31).contains(&octets[1])) // 172.16/12
        || (octets[0] == 192 && octets[1] == 168) // 192.168/16
        || (octets[0] == 100 && (64..=127).contains(&octets[1])) // 100.64/10
}

pub fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(v4);
    }
    let segments = ip.segments();
    // fc00::/7 (unique local)
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // fe80::/10 (link-local)
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    // fec0::/10 (deprecated site-local)
    if (segments[0] & 0xffc0) == 0xfec0 {
        return true;
    }
    false
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Synchronous, pre-connect check: normalization, literal blocklist, and
/// (if `host` parses as a bare IP literal) range rejection. Does not
/// perform DNS resolution — see [`assert_resolves_public`] for that.
pub fn assert_public_hostname(host: &str) -> Result<(), SsrfError> {
    let normalized = normalize(host);

    if is_blocked_literal(&normalized) {
        return Err(SsrfError::Blocked(normalized));
    }

    if let Ok(ip) = normalized.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(SsrfError::PrivateAddress(ip.to_string()));
        }
    }

    Ok(())
}

/// Full guard: run [`assert_public_hostname`], then (for non-IP-literal
/// hosts) resolve all DNS records and reject if any resolved address is
/// private. `port` is only used to satisfy `lookup_host`'s `ToSocketAddrs`
/// requirement and carries no semantic weight here.
pub async fn assert_resolves_public(host: &str, port: u16) -> Result<(), SsrfError> {
    assert_public_hostname(host)?;

    let normalized = normalize(host);
    if normalized.parse::<IpAddr>().is_ok() {
        // Already checked as a literal above.
        return Ok(());
    }

    let addrs = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| SsrfError::ResolutionFailed(normalized.clone(), e.to_string()))?;

    let mut saw_any = false;
    for addr in addrs {
        saw_any = true;
        if is_private_ip(addr.ip()) {
            tracing::warn!(host = %normalized, ip = %addr.ip(), "SSRF guard rejected resolved address");
            return Err(SsrfError::PrivateAddress(addr.ip().to_string()));
        }
    }

    if !saw_any {
        return Err(SsrfError::ResolutionFailed(
            normalized,
            "no records".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_localhost_variants() {
        assert!(assert_public_hostname("localhost").is_err());
        assert!(assert_public_hostname("LOCALHOST").is_err());
        assert!(assert_public_hostname("foo.localhost").is_err());
        assert!(assert_public_hostname("foo.internal").is_err());
        assert!(assert_public_hostname("metadata.google.internal").is_err());
    }

    #[test]
    fn strips_trailing_dot_and_brackets() {
        assert!(assert_public_hostname("localhost.").is_err());
        assert!(assert_public_hostname("[::1]").is_err());
    }

    #[test]
    fn rejects_private_ipv4_ranges() {
        for ip in ["10.0.0.1", "127.0.0.1", "169.254.1.1", "172.16.0.1", "192.168.1.1", "100.64.0.1", "0.0.0.0"] {
            assert!(assert_public_hostname(ip).is_err(), "{ip} should be rejected");
        }
    }

    #[test]
    fn allows_public_ipv4() {
        assert!(assert_public_hostname("93.184.216.34").is_ok());
        assert!(assert_public_hostname("8.8.8.8").is_ok());
    }

    #[test]
    fn rejects_private_ipv6() {
        for ip in ["::1", "::", "fc00::1", "fe80::1", "fec0::1"] {
            assert!(assert_public_hostname(ip).is_err(), "{ip} should be rejected");
        }
    }

    #[test]
    fn rejects_ipv4_mapped_ipv6_private() {
        assert!(assert_public_hostname("::ffff:127.0.0.1").is_err());
    }

    #[test]
    fn allows_public_ipv6() {
        assert!(assert_public_hostname("2001:4860:4860::8888").is_ok());
    }

    #[test]
    fn allows_ordinary_hostname_pending_dns_check() {
        assert!(assert_public_hostname("example.com").is_ok());
    }
}
