//! Host network detection.
//!
//! The sandbox keeps talking to its host (port forwards, the container
//! runtime's services), so the /24 around the default gateway is allowed in
//! both directions.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::debug;

use crate::cmd_abstraction::{args_to_strings, run_checked, CommandExecutor};
use crate::validation::validate_ipv4;

const PROC_ROUTE: &str = "/proc/net/route";

/// Prefix length of the permitted host network
pub const HOST_NETWORK_PREFIX: u8 = 24;

/// Source of the default gateway address.
pub trait GatewaySource: Send + Sync {
    fn default_gateway(&self) -> Result<Ipv4Addr>;
}

/// Reads the kernel routing table, falling back to `ip route`.
pub struct RouteTable<E: CommandExecutor> {
    executor: E,
    route_file: PathBuf,
}

impl<E: CommandExecutor> RouteTable<E> {
    pub fn new(executor: E) -> Self {
        Self::with_route_file(executor, PROC_ROUTE)
    }

    pub fn with_route_file(executor: E, route_file: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            route_file: route_file.into(),
        }
    }

    fn from_ip_route(&self) -> Result<Ipv4Addr> {
        let output = run_checked(
            &self.executor,
            "ip",
            &args_to_strings(&["-4", "route", "show", "default"]),
        )?;
        parse_ip_route(&output)
    }
}

impl<E: CommandExecutor> GatewaySource for RouteTable<E> {
    fn default_gateway(&self) -> Result<Ipv4Addr> {
        match std::fs::read_to_string(&self.route_file) {
            Ok(content) => {
                if let Some(gw) = parse_proc_route(&content) {
                    return Ok(gw);
                }
                debug!(
                    "No default route in {}, trying ip route",
                    self.route_file.display()
                );
            }
            Err(e) => debug!("Cannot read {}: {}", self.route_file.display(), e),
        }
        self.from_ip_route()
            .context("Failed to detect the default gateway")
    }
}

/// Find the default route's gateway in `/proc/net/route` content.
///
/// The gateway column is the address as a native-endian u32 in hex.
pub fn parse_proc_route(content: &str) -> Option<Ipv4Addr> {
    content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        let gw = Ipv4Addr::from(raw.to_ne_bytes());
        if gw.is_unspecified() {
            None
        } else {
            Some(gw)
        }
    })
}

/// Parse `ip route show default` output: `default via 172.17.0.1 dev eth0`.
pub fn parse_ip_route(output: &str) -> Result<Ipv4Addr> {
    for line in output.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("default") {
            continue;
        }
        while let Some(word) = words.next() {
            if word == "via" {
                let gw = words.next().unwrap_or_default();
                return validate_ipv4(gw)
                    .with_context(|| format!("Invalid gateway in route: {}", line.trim()));
            }
        }
    }
    anyhow::bail!("No default route found")
}

/// The /24 containing the gateway.
pub fn host_network(gateway: Ipv4Addr) -> Result<Ipv4Net> {
    Ok(Ipv4Net::new(gateway, HOST_NETWORK_PREFIX)?.trunc())
}

/// Detect the permitted host network.
pub fn detect_host_network(source: &dyn GatewaySource) -> Result<Ipv4Net> {
    let gateway = source.default_gateway()?;
    let net = host_network(gateway)?;
    debug!("Host network detected as {} (gateway {})", net, gateway);
    Ok(net)
}
