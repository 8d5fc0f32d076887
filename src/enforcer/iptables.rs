//! iptables + ipset handle.
//!
//! Only egressguard's own chains, their hooks and the allow set are ever
//! removed. Rules that other tools keep in the built-in chains, and the nat
//! and mangle tables, are left as found.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::debug;

use super::{FirewallHandle, FirewallStatus};
use crate::cmd_abstraction::{args_to_strings, run_checked, CommandExecutor, RealCommandExecutor};
use crate::rules::{Chain, Family, ForeignNatRules, Hook, Policy, Rule, ALLOW_SET};

/// Upper bound on duplicate hooks removed from one built-in chain
const MAX_HOOK_COPIES: usize = 16;

/// stderr fragments meaning the rule or chain is already gone
const ABSENT_MARKERS: &[&str] = &[
    "Bad rule",
    "does a matching rule exist",
    "No chain/target/match",
    "No such file or directory",
];

fn is_absent(stderr: &str) -> bool {
    ABSENT_MARKERS.iter().any(|m| stderr.contains(m))
}

/// Packet filter driven through the iptables, ip6tables and ipset binaries.
pub struct IptablesHandle<E: CommandExecutor = RealCommandExecutor> {
    executor: E,
}

impl IptablesHandle<RealCommandExecutor> {
    pub fn new() -> Self {
        Self {
            executor: RealCommandExecutor::new(),
        }
    }
}

impl Default for IptablesHandle<RealCommandExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CommandExecutor> IptablesHandle<E> {
    pub fn with_executor(executor: E) -> Self {
        Self { executor }
    }

    fn run(&self, cmd: &str, args: &[&str]) -> Result<String> {
        run_checked(&self.executor, cmd, &args_to_strings(args))
    }

    /// Run a command whose failure is fine when the target is already absent.
    fn run_if_present(&self, cmd: &str, args: &[String]) -> Result<bool> {
        let output = self.executor.execute(cmd, args)?;
        if output.success {
            Ok(true)
        } else if is_absent(&output.stderr) {
            Ok(false)
        } else {
            anyhow::bail!("{} {} failed: {}", cmd, args.join(" "), output.stderr.trim())
        }
    }

    /// Delete every copy of a hook from its built-in chain.
    fn unhook(&self, hook: &Hook) -> Result<()> {
        let binary = hook.family.binary();
        let args = hook.delete_args();
        for _ in 0..MAX_HOOK_COPIES {
            if !self.run_if_present(binary, &args)? {
                return Ok(());
            }
        }
        anyhow::bail!("{} still hooked after {} deletions", hook.chain, MAX_HOOK_COPIES)
    }

    fn remove_owned_chains(&self, family: Family) -> Result<()> {
        let binary = family.binary();
        // Flush all before deleting any: the port chains jump to the allow chain
        for chain in Chain::OWNED {
            self.run_if_present(binary, &args_to_strings(&["-F", chain.as_str()]))?;
        }
        for chain in Chain::OWNED {
            self.run_if_present(binary, &args_to_strings(&["-X", chain.as_str()]))?;
        }
        Ok(())
    }

    fn destroy_allow_set(&self) -> Result<()> {
        let output = self
            .executor
            .execute("ipset", &args_to_strings(&["destroy", ALLOW_SET]))?;
        if output.success || output.stderr.contains("does not exist") {
            Ok(())
        } else {
            anyhow::bail!("ipset destroy {} failed: {}", ALLOW_SET, output.stderr.trim())
        }
    }

    /// Whether a nat rule is already installed, via `iptables -C`.
    fn nat_rule_present(&self, rule: &[String]) -> Result<bool> {
        let mut args = args_to_strings(&["-t", "nat"]);
        args.extend(
            rule.iter()
                .enumerate()
                .map(|(i, token)| if i == 0 && token == "-A" { "-C".to_string() } else { token.clone() }),
        );
        let output = self.executor.execute("iptables", &args)?;
        Ok(output.success)
    }
}

#[async_trait]
impl<E: CommandExecutor> FirewallHandle for IptablesHandle<E> {
    async fn capture_foreign_nat(&self) -> Result<ForeignNatRules> {
        let saved = self.run("iptables-save", &["-t", "nat"])?;
        let nat = ForeignNatRules::from_save_output(&saved);
        debug!("Captured {} container DNS NAT rules", nat.rules.len());
        Ok(nat)
    }

    async fn flush(&self, families: &[Family]) -> Result<()> {
        for &family in families {
            for hook in Hook::all(family) {
                self.unhook(&hook)?;
            }
            self.remove_owned_chains(family)?;
            if family == Family::V4 {
                // The set can only go once no rule references it
                self.destroy_allow_set()?;
            }
        }
        Ok(())
    }

    async fn restore_nat(&self, nat: &ForeignNatRules) -> Result<()> {
        for chain in &nat.chains {
            let output = self
                .executor
                .execute("iptables", &args_to_strings(&["-t", "nat", "-N", chain.as_str()]))?;
            if !output.success && !output.stderr.contains("already exists") {
                anyhow::bail!("iptables -t nat -N {} failed: {}", chain, output.stderr.trim());
            }
        }
        let mut added = 0;
        for rule in &nat.rules {
            if self.nat_rule_present(rule)? {
                continue;
            }
            let mut args = args_to_strings(&["-t", "nat"]);
            args.extend(rule.iter().cloned());
            run_checked(&self.executor, "iptables", &args)?;
            added += 1;
        }
        debug!("Re-added {} of {} container DNS NAT rules", added, nat.rules.len());
        Ok(())
    }

    async fn load_allow_set(&self, name: &str, members: &[Ipv4Net]) -> Result<()> {
        let mut script = format!("create {} hash:net family inet\n", name);
        for net in members {
            script.push_str(&format!("add {} {}\n", name, net));
        }
        let output = self
            .executor
            .execute_with_stdin("ipset", &args_to_strings(&["restore", "-exist"]), &script)
            .context("Failed to run ipset restore")?;
        if !output.success {
            anyhow::bail!("ipset restore failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn create_chain(&self, family: Family, chain: Chain) -> Result<()> {
        self.run(family.binary(), &["-N", chain.as_str()])?;
        Ok(())
    }

    async fn append(&self, rule: &Rule) -> Result<()> {
        run_checked(&self.executor, rule.family.binary(), &rule.append_args())?;
        Ok(())
    }

    async fn hook(&self, hook: &Hook) -> Result<()> {
        run_checked(&self.executor, hook.family.binary(), &hook.insert_args())?;
        Ok(())
    }

    async fn set_policy(&self, policy: &Policy) -> Result<()> {
        let chain = policy.chain.builtin().unwrap_or("OUTPUT");
        self.run(policy.family.binary(), &["-P", chain, policy.verdict.as_str()])?;
        Ok(())
    }

    async fn status(&self) -> Result<FirewallStatus> {
        let listing = self.run("iptables", &["-S"])?;
        let mut status = parse_rule_listing(&listing);

        let set = self
            .executor
            .execute("ipset", &args_to_strings(&["list", "-t", ALLOW_SET]))?;
        if set.success {
            status.allow_set_entries = parse_entry_count(&set.stdout);
        }
        Ok(status)
    }
}

/// Parse `iptables -S` output into policies and the count of egressguard rules.
fn parse_rule_listing(listing: &str) -> FirewallStatus {
    let mut status = FirewallStatus::default();
    for line in listing.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["-P", chain, verdict, ..] => status
                .policies
                .push((chain.to_string(), verdict.to_string())),
            ["-A", chain, ..] if Chain::OWNED.iter().any(|c| c.as_str() == *chain) => status.rule_count += 1,
            _ => {}
        }
    }
    status
}

/// Parse the `Number of entries:` header of `ipset list -t`.
fn parse_entry_count(output: &str) -> Option<usize> {
    output
        .lines()
        .find_map(|l| l.strip_prefix("Number of entries:"))
        .and_then(|n| n.trim().parse().ok())
}
