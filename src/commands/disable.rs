//! Disable command implementation.

use anyhow::Result;
use tracing::info;

use crate::enforcer::{check_root, Enforcer, IptablesHandle};
use crate::lock::LockGuard;

/// Run the disable command
///
/// Flushes everything egressguard installed and resets the chain policies
/// to ACCEPT. Container DNS NAT rules are kept.
pub async fn run() -> Result<()> {
    check_root()?;
    let _lock = LockGuard::acquire()?;

    info!("Removing egress restrictions...");

    let mut enforcer = Enforcer::new(IptablesHandle::new());
    let nat = enforcer.capture_foreign_nat().await?;
    enforcer.release(nat).await?;

    println!("[OK] Egress restrictions removed (config preserved)");
    Ok(())
}
