//! Status command implementation.

use anyhow::Result;

use crate::enforcer::{check_root, FirewallHandle, IptablesHandle};
use crate::rules::ALLOW_SET;
use crate::utils::format_count;

/// Run the status command
pub async fn run() -> Result<()> {
    check_root()?;

    let status = IptablesHandle::new().status().await?;

    println!();
    let state = if status.is_restricted() {
        "RESTRICTED"
    } else {
        "UNRESTRICTED"
    };
    println!("Egress: {}", state);
    for (chain, verdict) in &status.policies {
        println!("  {} policy: {}", chain, verdict);
    }
    println!("Rules: {}", status.rule_count);
    match status.allow_set_entries {
        Some(n) => println!("Allow set {}: {} entries", ALLOW_SET, format_count(n)),
        None => println!("Allow set {}: not present", ALLOW_SET),
    }
    println!();

    Ok(())
}
