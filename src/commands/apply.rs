//! Apply command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::aggregator::count_ips;
use crate::enforcer::check_root;
use crate::error::FatalError;
use crate::lock::LockGuard;
use crate::pipeline::{CycleOptions, CycleOutcome, CycleReport};
use crate::policy::{resolve_policy, Defaults, PolicyOutcome};
use crate::signal::ShutdownGuard;
use crate::utils::{format_count, format_count_with_separator, plural};

use super::{build_pipeline, load_config};

/// Run the apply command
pub async fn run(config_path: &Path, dry_run: bool, skip_verify: bool) -> Result<()> {
    match apply(config_path, dry_run, skip_verify).await {
        Ok(()) => Ok(()),
        Err(e) => {
            println!();
            println!("[FAIL] {} stage: {}", e.stage(), e);
            Err(e.into())
        }
    }
}

async fn apply(config_path: &Path, dry_run: bool, skip_verify: bool) -> Result<(), FatalError> {
    let config = load_config(config_path).map_err(FatalError::Config)?;
    let defaults = Defaults::default();

    let (spec, warnings) = match resolve_policy(&defaults, config.as_ref()).map_err(FatalError::Config)? {
        PolicyOutcome::Disabled => {
            println!("[OK] Egress policy disabled, network left unrestricted");
            return Ok(());
        }
        PolicyOutcome::Enforce { spec, warnings } => (spec, warnings),
    };

    check_root().map_err(FatalError::Enforcement)?;
    let _lock = LockGuard::acquire().map_err(FatalError::Lock)?;
    let _signals = ShutdownGuard::new();

    info!(
        "Applying egress policy (default {}, {})",
        spec.default_policy,
        if dry_run { "dry run" } else { "live" }
    );

    let mut pipeline = build_pipeline(&spec).map_err(FatalError::Config)?;
    let options = CycleOptions {
        dry_run,
        verify: !skip_verify,
    };

    match pipeline.run(&spec, warnings, options).await? {
        CycleOutcome::Disabled => {
            println!("[OK] Egress policy disabled, network left unrestricted");
        }
        CycleOutcome::DryRun(report) => {
            print!("{}", report.rules.render());
            print_report(&report);
            println!("[OK] Dry run: firewall left unchanged");
        }
        CycleOutcome::Enforced(report) => {
            print_report(&report);
            println!("[OK] Egress policy enforced");
        }
    }
    Ok(())
}

/// Human summary of a cycle on stdout.
fn print_report(report: &CycleReport) {
    println!();
    println!("Domains considered: {}", report.hosts.len());
    for (host, addrs) in &report.hosts {
        if addrs.is_empty() {
            println!("  [WARN] {}: not resolved, skipped", host);
        } else {
            println!("  [OK] {} ({})", host, plural(addrs.len(), "address"));
        }
    }

    if let Some(provider) = &report.provider {
        println!(
            "Provider ranges: {} added ({} fetched, {} IPv6 skipped)",
            format_count(provider.installed),
            format_count(provider.fetched),
            provider.skipped_ipv6
        );
    }

    let ranges: Vec<_> = report.allow_set.ip_ranges().iter().copied().collect();
    let ports: Vec<String> = report
        .allow_set
        .tcp_ports()
        .iter()
        .map(|p| p.to_string())
        .collect();
    println!(
        "Allowed: {} ({} addresses), {} resolved of {}",
        plural(ranges.len(), "range"),
        format_count_with_separator(count_ips(&ranges)),
        report.resolved_hosts(),
        plural(report.hosts.len(), "domain")
    );
    println!("Ports: {} ({})", ports.len(), ports.join(", "));
    println!("Host network: {}", report.allow_set.host_network());

    if !report.warnings.is_empty() {
        println!("Warnings: {}", report.warnings.len());
        for warning in &report.warnings {
            println!("  [WARN] {}", warning);
        }
    }

    match &report.verification {
        Some(result) => {
            println!(
                "Verification: [OK] {} blocked, {} reachable",
                result.blocked_target,
                plural(result.allowed_probes_passed.len(), "target")
            );
        }
        None => println!("Verification: skipped"),
    }
    println!();
}
