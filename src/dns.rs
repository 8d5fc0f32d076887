//! Name resolution stage: hostnames to single-address IPv4 ranges.
//!
//! A host that fails to resolve is skipped with a warning; it simply stays
//! unreachable. Every answer is re-validated as a dotted quad before it is
//! trusted, whatever resolver produced it.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Warning;
use crate::validation::validate_ipv4;

/// Default DNS resolution timeout in seconds
pub const DNS_TIMEOUT_SECS: u64 = 5;

/// Maximum lookups in flight at once
const MAX_CONCURRENT_LOOKUPS: usize = 8;

/// Source of A records.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Raw A-record answers for `host`, exactly as the resolver reported them.
    async fn lookup_a(&self, host: &str) -> Result<Vec<String>>;
}

/// Resolver backed by the system's getaddrinfo, bounded by a timeout.
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DNS_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup_a(&self, host: &str) -> Result<Vec<String>> {
        let name = host.to_string();
        let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_host(&name));

        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Ok(addrs))) => Ok(addrs
                .into_iter()
                .filter(IpAddr::is_ipv4)
                .map(|a| a.to_string())
                .collect()),
            Ok(Ok(Err(e))) => Err(anyhow::anyhow!("{}", e)),
            Ok(Err(e)) => Err(anyhow::anyhow!("lookup task failed: {}", e)),
            Err(_) => Err(anyhow::anyhow!(
                "timed out after {}s",
                self.timeout.as_secs()
            )),
        }
    }
}

/// Addresses found for each host, plus the problems met along the way.
#[derive(Debug, Default, Clone)]
pub struct HostResolution {
    /// Every host considered, with the addresses it resolved to (possibly none)
    pub addresses: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    pub warnings: Vec<Warning>,
}

impl HostResolution {
    /// All resolved addresses as /32 networks.
    pub fn nets(&self) -> BTreeSet<Ipv4Net> {
        self.addresses
            .values()
            .flatten()
            .map(|ip| Ipv4Net::from(*ip))
            .collect()
    }

    /// Hosts that contributed at least one address.
    pub fn resolved_hosts(&self) -> usize {
        self.addresses.values().filter(|a| !a.is_empty()).count()
    }
}

/// Resolve every host, tolerating individual failures.
pub async fn resolve_hosts(resolver: &dyn HostResolver, hosts: &BTreeSet<String>) -> HostResolution {
    let mut lookups: Vec<(String, Result<Vec<String>>)> = stream::iter(hosts.iter().map(|host| async move {
        debug!("Resolving {}...", host);
        (host.clone(), resolver.lookup_a(host).await)
    }))
    .buffer_unordered(MAX_CONCURRENT_LOOKUPS)
    .collect()
    .await;

    // Completion order is arbitrary; sort so warnings come out the same every run
    lookups.sort_by(|a, b| a.0.cmp(&b.0));

    let mut resolution = HostResolution::default();

    for (host, result) in lookups {
        let mut addrs = BTreeSet::new();
        match result {
            Ok(answers) => {
                for answer in answers {
                    match validate_ipv4(answer.trim()) {
                        Ok(ip) => {
                            addrs.insert(ip);
                        }
                        Err(_) => {
                            warn!("Discarding invalid DNS answer for {}: {:?}", host, answer);
                            resolution.warnings.push(Warning::InvalidAnswer {
                                host: host.clone(),
                                answer,
                            });
                        }
                    }
                }
                if addrs.is_empty() {
                    warn!("Failed to resolve {}: no A records", host);
                    resolution.warnings.push(Warning::HostUnresolved {
                        host: host.clone(),
                        reason: "no A records".to_string(),
                    });
                } else {
                    info!("Resolved {} -> {} address(es)", host, addrs.len());
                }
            }
            Err(e) => {
                warn!("Failed to resolve {}: {}", host, e);
                resolution.warnings.push(Warning::HostUnresolved {
                    host: host.clone(),
                    reason: e.to_string(),
                });
            }
        }
        resolution.addresses.insert(host, addrs);
    }

    resolution
}
