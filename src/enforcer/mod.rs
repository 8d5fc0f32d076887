//! Enforcement engine: replays a compiled rule set onto the live packet filter.
//!
//! Every enforcement is a full rebuild of both families. egressguard owns
//! only its `EGRESSGUARD-*` chains, the hooks into them and the allow set;
//! those are removed, then missing container DNS NAT rules, the allow set,
//! the owned chains and their rules, the hooks and the chain policies are
//! installed in that order. Foreign chains and tables are left alone.
//! There is no partial rollback:
//! a failed step leaves the filter [`EnforcementState::Untrusted`] and the
//! next cycle starts from scratch again.

mod iptables;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::fmt;
use tracing::{debug, info};

pub use iptables::IptablesHandle;

use crate::rules::{Chain, CompiledRuleSet, Family, ForeignNatRules, Hook, Policy, Rule, ALLOW_SET};

/// Snapshot of the live filter, for `status`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FirewallStatus {
    /// `(chain, verdict)` for each built-in IPv4 filter chain
    pub policies: Vec<(String, String)>,
    /// Rules in egressguard's IPv4 chains
    pub rule_count: usize,
    /// Entries in the allow set, `None` when the set does not exist
    pub allow_set_entries: Option<usize>,
}

impl FirewallStatus {
    /// Whether the filter looks like an egressguard policy is active.
    pub fn is_restricted(&self) -> bool {
        self.policies.iter().any(|(_, verdict)| verdict != "ACCEPT")
    }
}

/// Low-level access to the packet filter.
#[async_trait]
pub trait FirewallHandle: Send + Sync {
    /// Read the container runtime's DNS NAT rules.
    async fn capture_foreign_nat(&self) -> Result<ForeignNatRules>;

    /// Remove egressguard's hooks and owned chains for the given families,
    /// and the allow set with IPv4. Nothing else is touched.
    async fn flush(&self, families: &[Family]) -> Result<()>;

    /// Re-add the preserved NAT rules that are not present.
    async fn restore_nat(&self, nat: &ForeignNatRules) -> Result<()>;

    /// Create the allow set and fill it with `members`.
    async fn load_allow_set(&self, name: &str, members: &[Ipv4Net]) -> Result<()>;

    async fn create_chain(&self, family: Family, chain: Chain) -> Result<()>;

    async fn append(&self, rule: &Rule) -> Result<()>;

    async fn hook(&self, hook: &Hook) -> Result<()>;

    async fn set_policy(&self, policy: &Policy) -> Result<()>;

    async fn status(&self) -> Result<FirewallStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementState {
    /// Nothing installed by this process yet
    Unconfigured,
    /// A compiled policy is fully installed
    Enforcing,
    /// Fail-closed lockdown installed
    Locked,
    /// An installation step failed; the live state is unknown
    Untrusted,
}

impl fmt::Display for EnforcementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnforcementState::Unconfigured => "unconfigured",
            EnforcementState::Enforcing => "enforcing",
            EnforcementState::Locked => "locked",
            EnforcementState::Untrusted => "untrusted",
        };
        write!(f, "{}", s)
    }
}

/// Owns the packet filter for one environment.
pub struct Enforcer<H: FirewallHandle> {
    handle: H,
    state: EnforcementState,
}

impl<H: FirewallHandle> Enforcer<H> {
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            state: EnforcementState::Unconfigured,
        }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn state(&self) -> EnforcementState {
        self.state
    }

    /// Capture the foreign NAT rules that must survive the flush.
    pub async fn capture_foreign_nat(&self) -> Result<ForeignNatRules> {
        self.handle
            .capture_foreign_nat()
            .await
            .context("Failed to read existing NAT rules")
    }

    /// Install a compiled policy, replacing whatever is there.
    pub async fn enforce(&mut self, rules: &CompiledRuleSet) -> Result<()> {
        self.transition(rules, EnforcementState::Enforcing).await
    }

    /// Install the fail-closed lockdown rule set.
    pub async fn lockdown(&mut self, nat: ForeignNatRules) -> Result<()> {
        let rules = CompiledRuleSet::lockdown(nat);
        self.transition(&rules, EnforcementState::Locked).await
    }

    /// Remove all restrictions.
    pub async fn release(&mut self, nat: ForeignNatRules) -> Result<()> {
        let rules = CompiledRuleSet::open(nat);
        self.transition(&rules, EnforcementState::Unconfigured).await
    }

    async fn transition(&mut self, rules: &CompiledRuleSet, target: EnforcementState) -> Result<()> {
        match self.install(rules).await {
            Ok(()) => {
                info!("Firewall state: {} -> {}", self.state, target);
                self.state = target;
                Ok(())
            }
            Err(e) => {
                self.state = EnforcementState::Untrusted;
                Err(e)
            }
        }
    }

    async fn install(&self, rules: &CompiledRuleSet) -> Result<()> {
        let h = &self.handle;

        h.flush(rules.families())
            .await
            .context("Step 'flush' failed")?;

        h.restore_nat(rules.nat())
            .await
            .context("Step 'restore container DNS NAT rules' failed")?;
        debug!("Checked {} container DNS NAT rules", rules.nat().rules.len());

        if let Some(members) = rules.allow_set() {
            h.load_allow_set(ALLOW_SET, members)
                .await
                .context("Step 'load allow set' failed")?;
            debug!("Loaded {} entries into {}", members.len(), ALLOW_SET);
        }

        for &(family, chain) in rules.chains() {
            h.create_chain(family, chain)
                .await
                .with_context(|| format!("Step 'create chain {}' failed", chain))?;
        }

        for rule in rules.rules() {
            h.append(rule)
                .await
                .with_context(|| format!("Step 'append rule' failed: {}", rule))?;
        }

        for hook in rules.hooks() {
            h.hook(hook)
                .await
                .with_context(|| format!("Step 'hook chain' failed: {}", hook))?;
        }

        for policy in rules.policies() {
            h.set_policy(policy)
                .await
                .with_context(|| format!("Step 'set policy' failed: {}", policy))?;
        }

        Ok(())
    }
}

/// Check if running as root (effective UID == 0)
///
/// Changing the packet filter needs CAP_NET_ADMIN; UID 0 covers the usual
/// case of a container entrypoint or `sudo`.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() is a simple syscall that reads the effective user ID.
    // It has no preconditions, never fails, and doesn't modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has the CAP_NET_ADMIN capability."
        )
    }
    Ok(())
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records every operation as a line of text; can be told to fail.
    #[derive(Default)]
    pub struct RecordingHandle {
        pub ops: Mutex<Vec<String>>,
        pub nat: ForeignNatRules,
        /// Fail the first operation whose text starts with this prefix
        pub fail_on: Option<String>,
    }

    impl RecordingHandle {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_on(prefix: &str) -> Self {
            Self {
                fail_on: Some(prefix.to_string()),
                ..Self::default()
            }
        }

        pub fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: String) -> Result<()> {
            if let Some(prefix) = &self.fail_on {
                if op.starts_with(prefix.as_str()) {
                    anyhow::bail!("simulated failure: {}", op);
                }
            }
            self.ops.lock().unwrap().push(op);
            Ok(())
        }
    }

    #[async_trait]
    impl FirewallHandle for RecordingHandle {
        async fn capture_foreign_nat(&self) -> Result<ForeignNatRules> {
            Ok(self.nat.clone())
        }

        async fn flush(&self, families: &[Family]) -> Result<()> {
            let names: Vec<&str> = families.iter().map(|f| f.binary()).collect();
            self.record(format!("flush {}", names.join(" ")))
        }

        async fn restore_nat(&self, nat: &ForeignNatRules) -> Result<()> {
            for rule in &nat.rules {
                self.record(format!("nat {}", rule.join(" ")))?;
            }
            Ok(())
        }

        async fn load_allow_set(&self, name: &str, members: &[Ipv4Net]) -> Result<()> {
            self.record(format!("ipset {} {}", name, members.len()))
        }

        async fn create_chain(&self, family: Family, chain: Chain) -> Result<()> {
            self.record(format!("{} -N {}", family.binary(), chain))
        }

        async fn append(&self, rule: &Rule) -> Result<()> {
            self.record(rule.to_string())
        }

        async fn hook(&self, hook: &Hook) -> Result<()> {
            self.record(hook.to_string())
        }

        async fn set_policy(&self, policy: &Policy) -> Result<()> {
            self.record(policy.to_string())
        }

        async fn status(&self) -> Result<FirewallStatus> {
            Ok(FirewallStatus::default())
        }
    }
}
