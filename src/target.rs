//! Target validation
//!
//! A target is either an IP literal or a URL with a non-empty host. Validation
//! is purely syntactic; no name resolution happens here.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};
use url::{Host, Url};

use crate::error::{Result, ScannerError};

/// A validated scan target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    Ip(IpAddr),
    Url(Url),
}

impl Target {
    /// Validate a host, IP or URL string
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ScannerError::invalid_target(input, "empty target"));
        }

        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        let url = Url::parse(&candidate)
            .map_err(|e| ScannerError::invalid_target(input, e.to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ScannerError::invalid_target(input, "missing host"))?;

        // The URL parser expands shorthand such as "10.1" or "0x7f.1" into a
        // different address; only a full dotted quad is taken as IPv4.
        if matches!(url.host(), Some(Host::Ipv4(_)))
            && typed_host(&candidate).parse::<Ipv4Addr>().is_err()
        {
            return Err(ScannerError::invalid_target(input, "malformed IPv4 address"));
        }

        // Hosts are handed to the probe tool as a bare argument.
        if host.starts_with('-') {
            return Err(ScannerError::invalid_target(input, "host must not start with '-'"));
        }

        Ok(Self::Url(url))
    }

    /// Host as handed to the probe tool
    pub fn probe_host(&self) -> String {
        match self {
            Self::Ip(ip) => ip.to_string(),
            Self::Url(url) => url
                .host_str()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
                .unwrap_or_default(),
        }
    }

    /// HTTP endpoint used by the WAF detector
    pub fn http_url(&self) -> Result<Url> {
        match self {
            Self::Ip(IpAddr::V4(ip)) => Ok(Url::parse(&format!("http://{}/", ip))?),
            Self::Ip(IpAddr::V6(ip)) => Ok(Url::parse(&format!("http://[{}]/", ip))?),
            Self::Url(url) if matches!(url.scheme(), "http" | "https") => Ok(url.clone()),
            Self::Url(url) => {
                let mut http = Url::parse(&format!("http://{}/", url.host_str().unwrap_or_default()))?;
                http.set_port(url.port())
                    .map_err(|_| ScannerError::invalid_target(url.as_str(), "cannot carry port"))?;
                Ok(http)
            }
        }
    }

    /// File-system friendly rendering used in result folder names
    pub fn sanitized(&self) -> String {
        let raw = match self {
            Self::Ip(ip) => ip.to_string(),
            Self::Url(url) => match url.port() {
                Some(port) => format!("{}_{}", self.probe_host(), port),
                None => self.probe_host(),
            },
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}

/// Host text as written, without scheme, credentials, port or path
fn typed_host(candidate: &str) -> &str {
    let rest = candidate.split_once("://").map_or(candidate, |(_, r)| r);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    host_port.split(':').next().unwrap_or_default()
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{}", ip),
            Self::Url(url) => write!(f, "{}", url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_literals_accepted() {
        for input in ["192.168.1.1", "10.0.0.254", "::1", "fe80::1", "2001:db8::8a2e:370:7334"] {
            let target = Target::parse(input).unwrap();
            assert!(matches!(target, Target::Ip(_)), "{} should be an IP", input);
        }
    }

    #[test]
    fn test_hosts_default_to_http() {
        let target = Target::parse("example.com").unwrap();
        assert_eq!(target.probe_host(), "example.com");
        assert_eq!(target.http_url().unwrap().as_str(), "http://example.com/");

        let target = Target::parse("https://example.com:8443/login").unwrap();
        assert_eq!(target.probe_host(), "example.com");
        assert_eq!(target.http_url().unwrap().as_str(), "https://example.com:8443/login");
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        for input in [
            "",
            "   ",
            "http://",
            "999.999.999.999",
            "not a host",
            "http://exa mple.com",
            "-oX",
            "192.168.1",
            "10",
            "0x7f.1",
            "127.1",
            "http://0x7f.0.0.1/",
            "https://user@10.1:8443/",
        ] {
            let err = Target::parse(input).unwrap_err();
            assert_eq!(err.code(), "INVALID_TARGET", "{:?} should be rejected", input);
        }
    }

    #[test]
    fn test_dotted_quad_in_url_accepted() {
        let target = Target::parse("https://admin@192.168.1.20:8443/login").unwrap();
        assert_eq!(target.probe_host(), "192.168.1.20");
        assert_eq!(typed_host("https://admin@192.168.1.20:8443/login"), "192.168.1.20");
    }

    #[test]
    fn test_ipv6_http_url() {
        let target = Target::parse("::1").unwrap();
        assert_eq!(target.http_url().unwrap().as_str(), "http://[::1]/");
        assert_eq!(target.sanitized(), "__1");
    }

    #[test]
    fn test_sanitized_name() {
        let target = Target::parse("http://scan.example.org:8080").unwrap();
        assert_eq!(target.sanitized(), "scan_example_org_8080");
    }
}
