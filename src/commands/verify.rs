//! Verify command implementation.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use crate::policy::{resolve_policy, Defaults, PolicyOutcome};
use crate::verify::{verify, HttpProber};

use super::load_config;

/// Run the verify command
///
/// Probes only. Unlike a failed `apply`, a failure here does not lock the
/// firewall down.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let spec = match resolve_policy(&Defaults::default(), config.as_ref())? {
        PolicyOutcome::Disabled => {
            println!("[OK] Egress policy disabled, nothing to verify");
            return Ok(());
        }
        PolicyOutcome::Enforce { spec, .. } => spec,
    };

    let prober = HttpProber::new(Duration::from_secs(spec.verify.timeout_secs))?;
    let result = verify(&prober, &spec.verify).await;

    println!();
    let blocked = if result.blocked_probe_passed { "[OK]" } else { "[FAIL]" };
    println!("{} {} blocked", blocked, result.blocked_target);
    for (target, ok) in &result.allowed_probes_passed {
        let mark = if *ok { "[OK]" } else { "[FAIL]" };
        println!("{} {} reachable", mark, target);
    }
    println!();

    if !result.passed() {
        anyhow::bail!("Verification failed: {}", result.failures().join("; "));
    }
    println!("[OK] Egress policy verified");
    Ok(())
}
