//! Centralized validation functions for egressguard.
//!
//! Every value that ends up in a firewall command passes through here first:
//! - IPv4 addresses (strict dotted quad, as returned by resolvers)
//! - IPv4 CIDR ranges (configuration entries and provider ranges)
//! - Hostnames and `*.domain` wildcard patterns
//! - Ports and probe URLs

use anyhow::{bail, Context, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Maximum length of a fully qualified domain name (RFC 1035).
const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Validate a strict dotted-quad IPv4 address.
///
/// Exactly four decimal octets of one to three ASCII digits each; anything a
/// resolver might print besides a plain address (CNAME targets, IPv6,
/// trailing junk) is rejected.
///
/// # Examples
/// ```
/// use egressguard::validation::validate_ipv4;
/// assert!(validate_ipv4("203.0.113.5").is_ok());
/// assert!(validate_ipv4("cdn.example.net.").is_err());
/// assert!(validate_ipv4("1.2.3").is_err());
/// ```
pub fn validate_ipv4(s: &str) -> Result<Ipv4Addr> {
    let octets: Vec<&str> = s.split('.').collect();
    if octets.len() != 4 {
        bail!("Invalid IPv4 address: {}", s);
    }

    for octet in &octets {
        if octet.is_empty() || octet.len() > 3 || !octet.bytes().all(|b| b.is_ascii_digit()) {
            bail!("Invalid IPv4 address: {}", s);
        }
    }

    s.parse()
        .map_err(|_| anyhow::anyhow!("Invalid IPv4 address: {}", s))
}

/// Validate an IPv4 address or CIDR range and return the parsed network.
///
/// A plain address becomes a /32. Host bits are cleared, so `10.1.2.3/8`
/// normalizes to `10.0.0.0/8`.
///
/// # Examples
/// ```
/// use egressguard::validation::validate_ipv4_cidr;
/// assert_eq!(validate_ipv4_cidr("203.0.113.5").unwrap().to_string(), "203.0.113.5/32");
/// assert_eq!(validate_ipv4_cidr("10.1.2.3/8").unwrap().to_string(), "10.0.0.0/8");
/// assert!(validate_ipv4_cidr("10.0.0.0/33").is_err());
/// ```
pub fn validate_ipv4_cidr(s: &str) -> Result<Ipv4Net> {
    let s = s.trim();
    match s.split_once('/') {
        Some((addr, prefix)) => {
            let addr = validate_ipv4(addr)
                .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", s))?;
            if prefix.is_empty() || prefix.len() > 2 || !prefix.bytes().all(|b| b.is_ascii_digit())
            {
                bail!("Invalid CIDR: {}", s);
            }
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", s))?;
            let net = Ipv4Net::new(addr, prefix)
                .map_err(|_| anyhow::anyhow!("Invalid CIDR prefix length: {}", s))?;
            Ok(net.trunc())
        }
        None => Ok(Ipv4Net::from(validate_ipv4(s)?)),
    }
}

/// Whether a string is a syntactically valid IPv6 address or range.
pub fn is_ipv6_cidr(s: &str) -> bool {
    let s = s.trim();
    s.parse::<Ipv6Net>().is_ok() || s.parse::<Ipv6Addr>().is_ok()
}

/// Validate a hostname and return its normalized (lowercase, no trailing
/// dot) form.
///
/// # Examples
/// ```
/// use egressguard::validation::validate_hostname;
/// assert_eq!(validate_hostname("API.Example.org.").unwrap(), "api.example.org");
/// assert!(validate_hostname("bad host").is_err());
/// ```
pub fn validate_hostname(s: &str) -> Result<String> {
    let host = s.trim().trim_end_matches('.').to_ascii_lowercase();

    if host.is_empty() {
        bail!("Hostname cannot be empty");
    }
    if !host.is_ascii() {
        bail!("Invalid hostname '{}': only ASCII characters allowed", s);
    }
    if host.len() > MAX_HOSTNAME_LEN {
        bail!("Invalid hostname '{}': longer than {} characters", s, MAX_HOSTNAME_LEN);
    }

    for label in host.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            bail!("Invalid hostname '{}': bad label length", s);
        }
        if label.starts_with('-') || label.ends_with('-') {
            bail!("Invalid hostname '{}': label cannot start or end with '-'", s);
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            bail!("Invalid hostname '{}': contains invalid characters", s);
        }
    }

    Ok(host)
}

/// A configured host entry after wildcard normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    /// The concrete domain that will be resolved
    pub domain: String,
    /// Whether the entry was written as `*.domain`
    pub wildcard: bool,
}

/// Normalize a host entry, stripping a leading `*.` wildcard label.
///
/// The wildcard is widened to its base domain, which must still have at
/// least two labels: `*.com` is rejected rather than turned into `com`.
pub fn normalize_host_pattern(s: &str) -> Result<HostPattern> {
    let trimmed = s.trim();
    match trimmed.strip_prefix("*.") {
        Some(rest) => {
            if rest.contains('*') {
                bail!("Invalid host pattern '{}': only a leading '*.' is supported", s);
            }
            let domain = validate_hostname(rest)?;
            if !domain.contains('.') {
                bail!("Invalid host pattern '{}': wildcard would cover a whole TLD", s);
            }
            Ok(HostPattern {
                domain,
                wildcard: true,
            })
        }
        None => {
            if trimmed.contains('*') {
                bail!("Invalid host pattern '{}': only a leading '*.' is supported", s);
            }
            Ok(HostPattern {
                domain: validate_hostname(trimmed)?,
                wildcard: false,
            })
        }
    }
}

/// Validate a TCP/UDP port number (0 is not a usable destination port).
pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        bail!("Invalid port 0");
    }
    Ok(port)
}

/// Validate a verification probe URL.
pub fn validate_probe_url(url: &str) -> Result<()> {
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        bail!("Probe URL must use http or https: {}", url);
    }
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("Probe URL contains whitespace or control characters: {:?}", url);
    }
    Ok(())
}

/// Host (lowercase, no trailing dot) and port a verification URL connects to.
pub fn target_endpoint(url: &str) -> Result<(String, u16)> {
    validate_probe_url(url)?;
    let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid probe URL: {}", url))?;
    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h.trim_end_matches('.').to_ascii_lowercase(),
        _ => bail!("Probe URL has no host: {}", url),
    };
    let port = match parsed.port_or_known_default() {
        Some(p) => p,
        None => bail!("Probe URL has no port: {}", url),
    };
    Ok((host, port))
}
