//! Policy source resolution: built-in defaults merged with user configuration.
//!
//! The merge is a set union, so declaration order and duplicates never change
//! the resulting [`PolicySpec`].

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

use crate::config::{Config, DefaultPolicy, ProviderConfig, VerifyConfig};
use crate::error::Warning;
use crate::validation::{normalize_host_pattern, target_endpoint, validate_ipv4_cidr, validate_port};

/// DNS is always reachable; nothing resolves without it.
pub const DNS_PORT: u16 = 53;

/// Hosts every sandbox needs (package registry, model API, telemetry).
pub const DEFAULT_HOSTS: &[&str] = &[
    "registry.npmjs.org",
    "api.anthropic.com",
    "sentry.io",
    "statsig.anthropic.com",
    "statsig.com",
];

/// SSH (git), DNS, HTTPS.
pub const DEFAULT_PORTS: &[u16] = &[22, DNS_PORT, 443];

/// Built-in allow-list entries merged into every policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub hosts: Vec<String>,
    pub ports: Vec<u16>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            hosts: DEFAULT_HOSTS.iter().map(|h| h.to_string()).collect(),
            ports: DEFAULT_PORTS.to_vec(),
        }
    }
}

/// The fully merged, validated egress policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySpec {
    pub enabled: bool,
    pub default_policy: DefaultPolicy,
    pub log_blocked: bool,
    /// Never empty: always contains [`DNS_PORT`]
    pub allowed_ports: BTreeSet<u16>,
    pub allowed_hosts: BTreeSet<String>,
    pub allowed_cidrs: BTreeSet<Ipv4Net>,
    pub provider_ranges_enabled: bool,
    pub block_ipv6: bool,
    pub provider: ProviderConfig,
    pub verify: VerifyConfig,
}

/// Result of policy resolution.
#[derive(Debug)]
pub enum PolicyOutcome {
    /// No configuration, or `enabled` is not true: leave egress unrestricted
    Disabled,
    Enforce {
        spec: PolicySpec,
        warnings: Vec<Warning>,
    },
}

/// Merge built-in defaults with the user configuration.
///
/// Invalid hosts, IPs or ports are configuration errors and abort before any
/// network or firewall work happens.
pub fn resolve_policy(defaults: &Defaults, config: Option<&Config>) -> Result<PolicyOutcome> {
    let config = match config {
        Some(c) if c.security().enabled => c,
        Some(_) => {
            debug!("network.security.enabled is not true, policy disabled");
            return Ok(PolicyOutcome::Disabled);
        }
        None => {
            debug!("No configuration present, policy disabled");
            return Ok(PolicyOutcome::Disabled);
        }
    };
    let security = config.security();
    let mut warnings = Vec::new();

    let mut allowed_ports = BTreeSet::from([DNS_PORT]);
    let declared_ports = defaults
        .ports
        .iter()
        .chain(security.allowed_ports.iter())
        .chain(config.ports.values());
    for &port in declared_ports {
        allowed_ports.insert(validate_port(port)?);
    }

    let mut allowed_hosts = BTreeSet::new();
    for entry in defaults.hosts.iter().chain(security.allowed_hosts.iter()) {
        let pattern = normalize_host_pattern(entry)
            .with_context(|| format!("Invalid entry in allowed_hosts: {}", entry))?;
        if pattern.wildcard {
            warn!(
                "Wildcard {} is broadened to the whole {} domain",
                entry.trim(),
                pattern.domain
            );
            let warning = Warning::WildcardBroadened {
                pattern: entry.trim().to_string(),
                domain: pattern.domain.clone(),
            };
            if !warnings.contains(&warning) {
                warnings.push(warning);
            }
        }
        allowed_hosts.insert(pattern.domain);
    }

    let mut allowed_cidrs = BTreeSet::new();
    for entry in &security.allowed_ips {
        let net = validate_ipv4_cidr(entry)
            .with_context(|| format!("Invalid entry in allowed_ips: {}", entry))?;
        allowed_cidrs.insert(net);
    }

    debug!(
        "Policy merged: {} hosts, {} CIDRs, {} ports",
        allowed_hosts.len(),
        allowed_cidrs.len(),
        allowed_ports.len()
    );

    let spec = PolicySpec {
        enabled: true,
        default_policy: security.default_policy,
        log_blocked: security.log_blocked,
        allowed_ports,
        allowed_hosts,
        allowed_cidrs,
        provider_ranges_enabled: security.provider_ranges,
        block_ipv6: security.block_ipv6,
        provider: security.provider.clone(),
        verify: security.verify.clone(),
    };
    if spec.verify.enabled {
        check_verify_targets(&spec)?;
    }

    Ok(PolicyOutcome::Enforce { spec, warnings })
}

/// The blocked target must be off the allow-list and, without provider
/// ranges, the allowed targets must be on it.
fn check_verify_targets(spec: &PolicySpec) -> Result<()> {
    let (host, _) = target_endpoint(&spec.verify.blocked)?;
    if spec.allows_host(&host) {
        anyhow::bail!(
            "verify.blocked target {} is allow-listed; it would never be blocked",
            spec.verify.blocked
        );
    }

    if !spec.provider_ranges_enabled {
        for url in &spec.verify.allowed {
            let (host, _) = target_endpoint(url)?;
            if !spec.allows_host(&host) {
                anyhow::bail!(
                    "verify.allowed target {} is not in allowed_hosts or allowed_ips (provider_ranges is off)",
                    url
                );
            }
        }
    }
    Ok(())
}

impl PolicySpec {
    /// Whether a host name or IPv4 literal is named by the allow-list.
    ///
    /// Provider ranges are not consulted.
    pub fn allows_host(&self, host: &str) -> bool {
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => self.allowed_cidrs.iter().any(|net| net.contains(&ip)),
            Err(_) => self.allowed_hosts.contains(host),
        }
    }
}
