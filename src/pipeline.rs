//! One enforcement cycle, start to finish.
//!
//! ```text
//! policy -> (dns || provider ranges) -> host network -> rules -> enforce -> verify
//! ```
//!
//! Every stage short-circuits on a [`FatalError`]. Recoverable problems are
//! collected as [`Warning`]s and returned in the [`CycleReport`]. Nothing is
//! written to the packet filter before the rule set is fully compiled.

use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::{error, info, warn};

use crate::config::{Config, DefaultPolicy};
use crate::dns::{resolve_hosts, HostResolver};
use crate::enforcer::{Enforcer, FirewallHandle};
use crate::error::{FatalError, Warning};
use crate::fetcher::{fetch_provider_ranges, ProviderRanges, RangeSource};
use crate::hostnet::{detect_host_network, GatewaySource};
use crate::policy::{resolve_policy, Defaults, PolicyOutcome, PolicySpec};
use crate::rules::{compile, CompiledRuleSet, ResolvedAllowSet, RuleOptions};
use crate::signal::ShutdownToken;
use crate::verify::{verify, Prober, VerificationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOptions {
    /// Compile and report, but leave the packet filter alone
    pub dry_run: bool,
    /// Run the live probes after enforcement
    pub verify: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verify: true,
        }
    }
}

/// Provider range counts for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSummary {
    pub fetched: usize,
    pub installed: usize,
    pub skipped_ipv6: usize,
}

/// Everything a cycle computed and did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Every domain considered, with the addresses it resolved to
    pub hosts: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    pub provider: Option<ProviderSummary>,
    pub allow_set: ResolvedAllowSet,
    pub rules: CompiledRuleSet,
    pub verification: Option<VerificationResult>,
    pub warnings: Vec<Warning>,
}

impl CycleReport {
    pub fn resolved_hosts(&self) -> usize {
        self.hosts.values().filter(|a| !a.is_empty()).count()
    }

    pub fn unresolved_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|(_, a)| a.is_empty())
            .map(|(h, _)| h.as_str())
            .collect()
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Policy disabled; nothing was touched
    Disabled,
    DryRun(CycleReport),
    Enforced(CycleReport),
}

/// The collaborators of one cycle and the enforcer they feed.
pub struct Pipeline<H: FirewallHandle> {
    resolver: Box<dyn HostResolver>,
    ranges: Box<dyn RangeSource>,
    gateway: Box<dyn GatewaySource>,
    prober: Box<dyn Prober>,
    enforcer: Enforcer<H>,
    shutdown: ShutdownToken,
}

impl<H: FirewallHandle> Pipeline<H> {
    pub fn new(
        resolver: Box<dyn HostResolver>,
        ranges: Box<dyn RangeSource>,
        gateway: Box<dyn GatewaySource>,
        prober: Box<dyn Prober>,
        handle: H,
    ) -> Self {
        Self {
            resolver,
            ranges,
            gateway,
            prober,
            enforcer: Enforcer::new(handle),
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn enforcer(&self) -> &Enforcer<H> {
        &self.enforcer
    }

    fn check_shutdown(&self) -> Result<(), FatalError> {
        if self.shutdown.is_cancelled() {
            warn!("Shutdown requested, aborting before enforcement");
            return Err(FatalError::Interrupted);
        }
        Ok(())
    }

    /// Resolve, fetch and compile. Reads the firewall but never changes it.
    pub async fn compile(
        &self,
        spec: &PolicySpec,
        mut warnings: Vec<Warning>,
    ) -> Result<CycleReport, FatalError> {
        self.check_shutdown()?;

        info!("Domains considered: {}", spec.allowed_hosts.len());
        let fetch = async {
            if spec.provider_ranges_enabled {
                Some(fetch_provider_ranges(&*self.ranges).await)
            } else {
                info!("Provider ranges disabled");
                None
            }
        };
        let (resolution, fetched) = tokio::join!(
            resolve_hosts(&*self.resolver, &spec.allowed_hosts),
            fetch
        );
        let provider: Option<ProviderRanges> = fetched.transpose().map_err(FatalError::ProviderFetch)?;

        self.check_shutdown()?;

        let host_network = detect_host_network(&*self.gateway).map_err(FatalError::HostNetwork)?;
        let nat = self
            .enforcer
            .capture_foreign_nat()
            .await
            .map_err(FatalError::Enforcement)?;

        warnings.extend(resolution.warnings.iter().cloned());

        let mut ip_ranges: BTreeSet<Ipv4Net> = resolution.nets();
        ip_ranges.extend(spec.allowed_cidrs.iter().copied());
        let summary = provider.map(|p| {
            warnings.extend(p.warnings.iter().cloned());
            info!("Provider ranges added: {}", p.ranges.len());
            let installed = p.ranges.len();
            ip_ranges.extend(p.ranges);
            ProviderSummary {
                fetched: p.raw_count,
                installed,
                skipped_ipv6: p.skipped_ipv6,
            }
        });

        let allow_set = ResolvedAllowSet::new(ip_ranges, spec.allowed_ports.clone(), host_network);
        let options = RuleOptions {
            default_policy: spec.default_policy,
            log_blocked: spec.log_blocked,
            block_ipv6: spec.block_ipv6,
        };
        let rules = compile(&allow_set, options, nat);
        info!(
            "Compiled {} rules: {} allowed ranges, {} ports",
            rules.rules().len(),
            allow_set.ip_ranges().len(),
            allow_set.tcp_ports().len()
        );

        Ok(CycleReport {
            hosts: resolution.addresses,
            provider: summary,
            allow_set,
            rules,
            verification: None,
            warnings,
        })
    }

    /// Run a full cycle for an already resolved policy.
    pub async fn run(
        &mut self,
        spec: &PolicySpec,
        warnings: Vec<Warning>,
        options: CycleOptions,
    ) -> Result<CycleOutcome, FatalError> {
        let mut report = self.compile(spec, warnings).await?;
        if options.dry_run {
            return Ok(CycleOutcome::DryRun(report));
        }

        // Last point where a signal aborts cleanly
        self.check_shutdown()?;

        self.enforcer
            .enforce(&report.rules)
            .await
            .map_err(FatalError::Enforcement)?;
        info!("Firewall rules applied");

        if !options.verify || !spec.verify.enabled {
            info!("Verification skipped");
            return Ok(CycleOutcome::Enforced(report));
        }
        if spec.default_policy == DefaultPolicy::Accept {
            warn!("Default policy is ACCEPT, nothing is blocked; verification skipped");
            return Ok(CycleOutcome::Enforced(report));
        }

        let result = verify(&*self.prober, &spec.verify).await;
        if !result.passed() {
            let mut failures = result.failures();
            error!("Verification failed, locking the firewall down");
            if let Err(e) = self.enforcer.lockdown(report.rules.nat().clone()).await {
                error!("Lockdown failed: {:#}", e);
                failures.push(format!("lockdown also failed: {:#}", e));
            }
            return Err(FatalError::Verification(failures));
        }
        report.verification = Some(result);
        Ok(CycleOutcome::Enforced(report))
    }
}

/// Resolve the policy and, unless it is disabled, run a cycle.
pub async fn run_cycle<H: FirewallHandle>(
    defaults: &Defaults,
    config: Option<&Config>,
    pipeline: &mut Pipeline<H>,
    options: CycleOptions,
) -> Result<CycleOutcome, FatalError> {
    match resolve_policy(defaults, config).map_err(FatalError::Config)? {
        PolicyOutcome::Disabled => {
            info!("Egress policy disabled, leaving network unrestricted");
            Ok(CycleOutcome::Disabled)
        }
        PolicyOutcome::Enforce { spec, warnings } => pipeline.run(&spec, warnings, options).await,
    }
}
