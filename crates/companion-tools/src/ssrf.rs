//! SSRF protection for outbound URL fetches.
//!
//! Every hop of a fetch is validated: scheme, hostname denylist, and every
//! resolved address. DNS failures fail closed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum SsrfError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("scheme '{0}' is not allowed; only http and https")]
    SchemeNotAllowed(String),

    #[error("hostname '{0}' is blocked")]
    HostBlocked(String),

    #[error("address {0} is in a blocked range")]
    AddressBlocked(IpAddr),

    #[error("DNS resolution failed for '{0}'")]
    ResolutionFailed(String),

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),
}

pub type Result<T> = std::result::Result<T, SsrfError>;

pub const MAX_REDIRECTS: u32 = 5;

const BLOCKED_HOST_SUFFIXES: &[&str] = &[
    ".local",
    ".localhost",
    ".internal",
    ".lan",
    ".home",
    ".corp",
    ".intranet",
];

fn ipv4_blocked(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_multicast()
        // 0.0.0.0/8 current network
        || octets[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
        // 192.0.0.0/24 IETF protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (octets[1] == 18 || octets[1] == 19))
        // 240.0.0.0/4 reserved
        || octets[0] >= 240
}

fn ipv6_blocked(ip: Ipv6Addr) -> bool {
    // An IPv4-mapped address is judged by its embedded IPv4.
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return ipv4_blocked(mapped);
    }
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
}

/// True when the address must never be fetched.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ipv4_blocked(v4),
        IpAddr::V6(v6) => ipv6_blocked(v6),
    }
}

/// Validates URLs before (and during) a fetch.
#[derive(Debug, Clone, Default)]
pub struct UrlGuard;

impl UrlGuard {
    pub fn new() -> Self {
        Self
    }

    /// Full validation of one URL: scheme, hostname, and every address the
    /// hostname resolves to.
    pub async fn validate(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(SsrfError::SchemeNotAllowed(other.to_string())),
        }

        let host = url
            .host_str()
            .ok_or_else(|| SsrfError::InvalidUrl("missing host".to_string()))?
            .to_ascii_lowercase();

        if host == "localhost" || BLOCKED_HOST_SUFFIXES.iter().any(|s| host.ends_with(s)) {
            return Err(SsrfError::HostBlocked(host));
        }

        // IP literals skip DNS.
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            if is_blocked_ip(ip) {
                return Err(SsrfError::AddressBlocked(ip));
            }
            return Ok(url);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|_| SsrfError::ResolutionFailed(host.clone()))?
            .map(|addr| addr.ip())
            .collect();
        if addrs.is_empty() {
            // Fail closed: an unresolvable host is not fetchable anyway,
            // and an empty answer may be a resolver game.
            return Err(SsrfError::ResolutionFailed(host));
        }
        for ip in addrs {
            if is_blocked_ip(ip) {
                return Err(SsrfError::AddressBlocked(ip));
            }
        }
        Ok(url)
    }

    /// GET with manual redirect following: every hop re-validates its
    /// target, bounded at `MAX_REDIRECTS`.
    pub async fn fetch(&self, client: &reqwest::Client, raw: &str) -> Result<reqwest::Response> {
        let mut url = self.validate(raw).await?;
        for _ in 0..=MAX_REDIRECTS {
            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;

            if !response.status().is_redirection() {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| SsrfError::InvalidUrl("redirect without location".to_string()))?;
            let next = url
                .join(location)
                .map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;
            url = self.validate(next.as_str()).await?;
        }
        Err(SsrfError::TooManyRedirects(MAX_REDIRECTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_private_and_special_ipv4_ranges() {
        let blocked = [
            "10.0.0.1",
            "172.16.5.5",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "224.0.0.1",
            "240.0.0.1",
            "255.255.255.255",
        ];
        for ip in blocked {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
        assert!(!is_blocked_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_blocked_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn blocks_special_ipv6_ranges() {
        let blocked = ["::1", "::", "fc00::1", "fd12:3456::1", "fe80::1", "ff02::1"];
        for ip in blocked {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
        // IPv4-mapped private is judged by the embedded address.
        assert!(is_blocked_ip("::ffff:10.0.0.1".parse().unwrap()));
        assert!(is_blocked_ip("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_blocked_ip("2606:2800:220:1::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn rejects_bad_schemes() {
        let guard = UrlGuard::new();
        let error = guard.validate("file:///etc/passwd").await.unwrap_err();
        assert!(matches!(error, SsrfError::SchemeNotAllowed(_)));
        let error = guard.validate("ftp://example.com/x").await.unwrap_err();
        assert!(matches!(error, SsrfError::SchemeNotAllowed(_)));
    }

    #[tokio::test]
    async fn rejects_blocked_hostnames() {
        let guard = UrlGuard::new();
        for url in [
            "http://localhost/admin",
            "http://printer.local/",
            "https://db.internal/creds",
        ] {
            let error = guard.validate(url).await.unwrap_err();
            assert!(matches!(error, SsrfError::HostBlocked(_)), "{url}");
        }
    }

    #[tokio::test]
    async fn rejects_ip_literal_urls_in_blocked_ranges() {
        let guard = UrlGuard::new();
        let error = guard.validate("http://10.0.0.1/admin").await.unwrap_err();
        assert!(matches!(error, SsrfError::AddressBlocked(_)));
        let error = guard.validate("http://[::1]:8080/").await.unwrap_err();
        assert!(matches!(error, SsrfError::AddressBlocked(_)));
    }
}
