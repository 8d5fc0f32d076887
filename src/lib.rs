//! # egressguard - outbound egress policy engine
//!
//! Computes and enforces a default-deny firewall allow-list for a sandboxed
//! container. Static defaults, user configuration, live DNS answers and a
//! provider's published IP ranges are merged into one policy, which is
//! rebuilt from scratch on every run.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       egressguard                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap): apply, verify, status, disable                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml) -> policy::resolve_policy -> PolicySpec│
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  dns (dns-lookup, futures)   │  fetcher (reqwest + rustls)  │
//! │    hostnames -> /32s         │    GitHub meta -> aggregator │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  hostnet: default gateway -> permitted /24                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  rules: ResolvedAllowSet -> CompiledRuleSet                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  enforcer (FirewallHandle trait)                            │
//! │    └── IptablesHandle (iptables, ip6tables, ipset)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  verify: blocked / allowed probes, lockdown on failure      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use egressguard::cmd_abstraction::RealCommandExecutor;
//! use egressguard::config::Config;
//! use egressguard::dns::SystemResolver;
//! use egressguard::enforcer::{check_root, IptablesHandle};
//! use egressguard::fetcher::Fetcher;
//! use egressguard::hostnet::RouteTable;
//! use egressguard::pipeline::{run_cycle, CycleOptions, Pipeline};
//! use egressguard::policy::Defaults;
//! use egressguard::verify::HttpProber;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     check_root()?;
//!     let config = Config::load("/etc/egressguard/config.yaml")?;
//!
//!     let mut pipeline = Pipeline::new(
//!         Box::new(SystemResolver::new()),
//!         Box::new(Fetcher::new(&Default::default())?),
//!         Box::new(RouteTable::new(RealCommandExecutor::new())),
//!         Box::new(HttpProber::new(Duration::from_secs(5))?),
//!         IptablesHandle::new(),
//!     );
//!     run_cycle(&Defaults::default(), config.as_ref(), &mut pipeline, CycleOptions::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`policy`] - Merge defaults and configuration into a `PolicySpec`
//! - [`dns`] - Hostname resolution with timeout and answer validation
//! - [`fetcher`] - Provider range download and validation
//! - [`aggregator`] - CIDR aggregation with coverage check
//! - [`hostnet`] - Host network detection from the default route
//! - [`rules`] - Rule compiler
//! - [`enforcer`] - Packet filter handle and enforcement state machine
//! - [`verify`] - Post-enforcement probes
//! - [`pipeline`] - One enforcement cycle, stage by stage
//! - [`lock`] - Run lock
//! - [`signal`] - SIGINT/SIGTERM handling

pub mod aggregator;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod dns;
pub mod enforcer;
pub mod error;
pub mod fetcher;
pub mod hostnet;
pub mod lock;
pub mod pipeline;
pub mod policy;
pub mod rules;
pub mod signal;
pub mod utils;
pub mod validation;
pub mod verify;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::{FatalError, Warning};
