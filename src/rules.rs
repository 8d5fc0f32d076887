//! Rule compiler: turns a resolved allow set into an ordered firewall rule set.
//!
//! The compiled set is pure data. Nothing here touches the host; the
//! enforcer replays it through a [`crate::enforcer::FirewallHandle`].
//!
//! Skeleton, in evaluation order:
//!
//! 1. preserved container DNS NAT rules (nat table)
//! 2. baseline accepts: loopback, DNS, established traffic, host network
//! 3. per-port jumps into the allow chain
//! 4. allow-set match accept (inside the allow chain)
//! 5. optional rate-limited LOG rules
//! 6. terminal DROP/REJECT rules, then chain policies
//!
//! A packet on an allowed port that does not match the allow set returns
//! from the allow chain and falls through to the terminal rules.
//!
//! Filter rules live only in chains egressguard creates (`EGRESSGUARD-*`),
//! hooked into the top of `INPUT`, `OUTPUT` and `FORWARD`. Foreign chains,
//! foreign rules below the hooks, and the nat and mangle tables are never
//! flushed.

use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::fmt;

use crate::config::DefaultPolicy;
use crate::policy::DNS_PORT;

/// Name of the ipset holding every allowed destination
pub const ALLOW_SET: &str = "egressguard-allow";

/// Chain reached from the per-port rules, matched against [`ALLOW_SET`]
pub const ALLOW_CHAIN: &str = "EGRESSGUARD-ALLOW";

pub const LOG_PREFIX: &str = "EGRESS-BLOCKED: ";
pub const LOG_RATE: &str = "5/min";

/// Embedded DNS server of the container runtime
pub const CONTAINER_DNS: &str = "127.0.0.11";

const BUILTIN_NAT_CHAINS: &[&str] = &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The binary driving this family's filter table.
    pub fn binary(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Chain {
    Input,
    Output,
    Forward,
    /// User chain holding the allow-set match
    Allow,
}

impl Chain {
    /// Chains hooked into the built-in chain of the same direction
    pub const BUILTIN: [Chain; 3] = [Chain::Input, Chain::Output, Chain::Forward];

    /// Every chain egressguard may own in a family's filter table
    pub const OWNED: [Chain; 4] = [Chain::Input, Chain::Output, Chain::Forward, Chain::Allow];

    /// Name of the owned chain.
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "EGRESSGUARD-INPUT",
            Chain::Output => "EGRESSGUARD-OUTPUT",
            Chain::Forward => "EGRESSGUARD-FORWARD",
            Chain::Allow => ALLOW_CHAIN,
        }
    }

    /// Built-in chain this chain is hooked into; `None` for the allow chain.
    pub fn builtin(&self) -> Option<&'static str> {
        match self {
            Chain::Input => Some("INPUT"),
            Chain::Output => Some("OUTPUT"),
            Chain::Forward => Some("FORWARD"),
            Chain::Allow => None,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Skeleton section a rule belongs to. Rules are emitted in section order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Baseline,
    Ports,
    AllowMatch,
    Logging,
    Terminal,
}

/// One rule appended to a filter-table chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub family: Family,
    pub chain: Chain,
    pub section: Section,
    /// Match and target arguments, without `-A CHAIN`
    pub args: Vec<String>,
}

impl Rule {
    fn new(family: Family, chain: Chain, section: Section, args: &[&str]) -> Self {
        Self {
            family,
            chain,
            section,
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Full argument list for the family's binary.
    pub fn append_args(&self) -> Vec<String> {
        let mut args = vec!["-A".to_string(), self.chain.as_str().to_string()];
        args.extend(self.args.iter().cloned());
        args
    }

    /// Target of the rule (`-j` argument).
    pub fn target(&self) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == "-j")
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family.binary(), shell_join(&self.append_args()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        }
    }
}

/// Jump from the top of a built-in chain into the owned chain of the same
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hook {
    pub family: Family,
    pub chain: Chain,
}

impl Hook {
    /// One hook per built-in chain.
    pub fn all(family: Family) -> [Hook; 3] {
        Chain::BUILTIN.map(|chain| Hook { family, chain })
    }

    fn builtin(&self) -> &'static str {
        self.chain.builtin().unwrap_or("OUTPUT")
    }

    /// Arguments inserting the jump as the first rule of the built-in chain.
    pub fn insert_args(&self) -> Vec<String> {
        ["-I", self.builtin(), "1", "-j", self.chain.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Arguments deleting one copy of the jump.
    pub fn delete_args(&self) -> Vec<String> {
        ["-D", self.builtin(), "-j", self.chain.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family.binary(), self.insert_args().join(" "))
    }
}

/// Default policy of a built-in chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub family: Family,
    pub chain: Chain,
    pub verdict: Verdict,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -P {} {}",
            self.family.binary(),
            self.chain.builtin().unwrap_or(self.chain.as_str()),
            self.verdict.as_str()
        )
    }
}

/// NAT rules installed by the container runtime for its embedded DNS.
///
/// The nat table is never flushed. These rules are captured every cycle and
/// re-added verbatim when missing; without them name resolution inside the
/// container stops working.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignNatRules {
    /// Non-builtin chains the rules live in or jump to
    pub chains: BTreeSet<String>,
    /// Each rule as `iptables-save` printed it, tokenized (starts with `-A`)
    pub rules: Vec<Vec<String>>,
}

impl ForeignNatRules {
    /// Extract the container DNS rules from `iptables-save -t nat` output.
    pub fn from_save_output(output: &str) -> Self {
        let mut declared = BTreeSet::new();
        let mut rules = Vec::new();

        for line in output.lines().map(str::trim) {
            if let Some(decl) = line.strip_prefix(':') {
                if let Some(name) = decl.split_whitespace().next() {
                    declared.insert(name.to_string());
                }
            } else if line.starts_with("-A ") && line.contains(CONTAINER_DNS) {
                rules.push(tokenize(line));
            }
        }

        let mut chains = BTreeSet::new();
        for rule in &rules {
            for (i, token) in rule.iter().enumerate() {
                if token == "-A" || token == "-j" {
                    if let Some(name) = rule.get(i + 1) {
                        if declared.contains(name) && !BUILTIN_NAT_CHAINS.contains(&name.as_str()) {
                            chains.insert(name.clone());
                        }
                    }
                }
            }
        }

        Self { chains, rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Split an `iptables-save` rule line, honouring double quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) || a.contains('"') {
                format!("\"{}\"", a.replace('"', "\\\""))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Every concrete destination and port to permit for one cycle.
///
/// Built once per cycle and never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAllowSet {
    ip_ranges: BTreeSet<Ipv4Net>,
    tcp_ports: BTreeSet<u16>,
    host_network: Ipv4Net,
}

impl ResolvedAllowSet {
    pub fn new(ip_ranges: BTreeSet<Ipv4Net>, tcp_ports: BTreeSet<u16>, host_network: Ipv4Net) -> Self {
        let mut tcp_ports = tcp_ports;
        tcp_ports.insert(DNS_PORT);
        Self {
            ip_ranges,
            tcp_ports,
            host_network,
        }
    }

    pub fn ip_ranges(&self) -> &BTreeSet<Ipv4Net> {
        &self.ip_ranges
    }

    pub fn tcp_ports(&self) -> &BTreeSet<u16> {
        &self.tcp_ports
    }

    pub fn host_network(&self) -> Ipv4Net {
        self.host_network
    }
}

/// Options of the compiled policy that do not come from the allow set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOptions {
    pub default_policy: DefaultPolicy,
    pub log_blocked: bool,
    pub block_ipv6: bool,
}

/// Ordered, fully materialized rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRuleSet {
    families: Vec<Family>,
    nat: ForeignNatRules,
    allow_set: Option<Vec<Ipv4Net>>,
    chains: Vec<(Family, Chain)>,
    rules: Vec<Rule>,
    hooks: Vec<Hook>,
    policies: Vec<Policy>,
}

impl CompiledRuleSet {
    /// Families whose owned chains this rule set replaces. Always both.
    pub fn families(&self) -> &[Family] {
        &self.families
    }

    pub fn nat(&self) -> &ForeignNatRules {
        &self.nat
    }

    /// Members of [`ALLOW_SET`], or `None` when the set is not used.
    pub fn allow_set(&self) -> Option<&[Ipv4Net]> {
        self.allow_set.as_deref()
    }

    /// Owned chains to create before any rule is appended.
    pub fn chains(&self) -> &[(Family, Chain)] {
        &self.chains
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Jumps inserted once every owned chain is filled.
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Rules of one family appended to one chain, in order.
    pub fn chain_rules(&self, family: Family, chain: Chain) -> impl Iterator<Item = &Rule> {
        self.rules
            .iter()
            .filter(move |r| r.family == family && r.chain == chain)
    }

    /// The exact command sequence the enforcer runs, one per line.
    ///
    /// Identical inputs always render byte-identical text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let families: Vec<&str> = self.families.iter().map(|f| f.binary()).collect();
        out.push_str(&format!("# remove egressguard chains: {}\n", families.join(" ")));

        for chain in &self.nat.chains {
            out.push_str(&format!("iptables -t nat -N {}\n", chain));
        }
        for rule in &self.nat.rules {
            out.push_str(&format!("iptables -t nat {}\n", shell_join(rule)));
        }
        if let Some(members) = &self.allow_set {
            out.push_str(&format!("ipset create {} hash:net\n", ALLOW_SET));
            for net in members {
                out.push_str(&format!("ipset add {} {}\n", ALLOW_SET, net));
            }
        }
        for (family, chain) in &self.chains {
            out.push_str(&format!("{} -N {}\n", family.binary(), chain));
        }
        for rule in &self.rules {
            out.push_str(&format!("{}\n", rule));
        }
        for hook in &self.hooks {
            out.push_str(&format!("{}\n", hook));
        }
        for policy in &self.policies {
            out.push_str(&format!("{}\n", policy));
        }
        out
    }

    /// Fail-closed rule set: loopback only, everything else dropped.
    pub fn lockdown(nat: ForeignNatRules) -> Self {
        let families = vec![Family::V4, Family::V6];
        let mut chains = Vec::new();
        let mut rules = Vec::new();
        let mut hooks = Vec::new();
        let mut policies = Vec::new();
        for &family in &families {
            chains.extend(Chain::BUILTIN.iter().map(|&c| (family, c)));
            rules.extend(loopback_rules(family));
            rules.extend(terminal_rules(family, DefaultPolicy::Drop));
            hooks.extend(Hook::all(family));
            policies.extend(builtin_policies(family, Verdict::Drop));
        }
        Self {
            families,
            nat,
            allow_set: None,
            chains,
            rules,
            hooks,
            policies,
        }
    }

    /// Unrestricted rule set: no owned chains, ACCEPT policies.
    pub fn open(nat: ForeignNatRules) -> Self {
        let families = vec![Family::V4, Family::V6];
        let policies = families
            .iter()
            .flat_map(|&f| builtin_policies(f, Verdict::Accept))
            .collect();
        Self {
            families,
            nat,
            allow_set: None,
            chains: Vec::new(),
            rules: Vec::new(),
            hooks: Vec::new(),
            policies,
        }
    }
}

fn loopback_rules(family: Family) -> [Rule; 2] {
    [
        Rule::new(family, Chain::Input, Section::Baseline, &["-i", "lo", "-j", "ACCEPT"]),
        Rule::new(family, Chain::Output, Section::Baseline, &["-o", "lo", "-j", "ACCEPT"]),
    ]
}

fn established_rules(family: Family) -> [Rule; 2] {
    let args = ["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"];
    [
        Rule::new(family, Chain::Input, Section::Baseline, &args),
        Rule::new(family, Chain::Output, Section::Baseline, &args),
    ]
}

fn builtin_policies(family: Family, verdict: Verdict) -> Vec<Policy> {
    Chain::BUILTIN
        .iter()
        .map(|&chain| Policy {
            family,
            chain,
            verdict,
        })
        .collect()
}

fn terminal_rules(family: Family, policy: DefaultPolicy) -> Vec<Rule> {
    let reject_with = match family {
        Family::V4 => "icmp-admin-prohibited",
        Family::V6 => "icmp6-adm-prohibited",
    };
    Chain::BUILTIN
        .iter()
        .filter_map(|&chain| match policy {
            DefaultPolicy::Drop => Some(Rule::new(family, chain, Section::Terminal, &["-j", "DROP"])),
            DefaultPolicy::Reject => Some(Rule::new(
                family,
                chain,
                Section::Terminal,
                &["-j", "REJECT", "--reject-with", reject_with],
            )),
            DefaultPolicy::Accept => None,
        })
        .collect()
}

fn policy_verdict(policy: DefaultPolicy) -> Verdict {
    match policy {
        DefaultPolicy::Accept => Verdict::Accept,
        DefaultPolicy::Drop | DefaultPolicy::Reject => Verdict::Drop,
    }
}

/// Compile the rule set for one cycle.
pub fn compile(allow: &ResolvedAllowSet, options: RuleOptions, nat: ForeignNatRules) -> CompiledRuleSet {
    let v4 = Family::V4;
    let mut rules = Vec::new();

    // (2) baseline
    rules.extend(loopback_rules(v4));
    let dns = DNS_PORT.to_string();
    rules.push(Rule::new(v4, Chain::Output, Section::Baseline, &["-p", "udp", "--dport", dns.as_str(), "-j", "ACCEPT"]));
    rules.push(Rule::new(v4, Chain::Input, Section::Baseline, &["-p", "udp", "--sport", dns.as_str(), "-j", "ACCEPT"]));
    rules.extend(established_rules(v4));
    let host_net = allow.host_network().to_string();
    rules.push(Rule::new(v4, Chain::Input, Section::Baseline, &["-s", host_net.as_str(), "-j", "ACCEPT"]));
    rules.push(Rule::new(v4, Chain::Output, Section::Baseline, &["-d", host_net.as_str(), "-j", "ACCEPT"]));

    // (3) ports: DNS over TCP goes anywhere, other ports only to the allow set
    for port in allow.tcp_ports() {
        let port = port.to_string();
        let target = if port == dns { "ACCEPT" } else { ALLOW_CHAIN };
        rules.push(Rule::new(
            v4,
            Chain::Output,
            Section::Ports,
            &["-p", "tcp", "--dport", port.as_str(), "-j", target],
        ));
    }

    // (4) allow-set match
    rules.push(Rule::new(
        v4,
        Chain::Allow,
        Section::AllowMatch,
        &["-m", "set", "--match-set", ALLOW_SET, "dst", "-j", "ACCEPT"],
    ));

    let denies = options.default_policy != DefaultPolicy::Accept;

    // (5) logging
    if options.log_blocked && denies {
        for chain in Chain::BUILTIN {
            rules.push(Rule::new(
                v4,
                chain,
                Section::Logging,
                &[
                    "-m", "limit", "--limit", LOG_RATE, "-j", "LOG", "--log-prefix", LOG_PREFIX,
                    "--log-level", "4",
                ],
            ));
        }
    }

    // (6) terminal
    rules.extend(terminal_rules(v4, options.default_policy));
    let mut policies = builtin_policies(v4, policy_verdict(options.default_policy));
    let mut chains: Vec<(Family, Chain)> = Chain::OWNED.iter().map(|&c| (v4, c)).collect();
    let mut hooks = Hook::all(v4).to_vec();

    let v6 = Family::V6;
    if options.block_ipv6 && denies {
        chains.extend(Chain::BUILTIN.iter().map(|&c| (v6, c)));
        rules.extend(loopback_rules(v6));
        rules.extend(established_rules(v6));
        rules.extend(terminal_rules(v6, options.default_policy));
        hooks.extend(Hook::all(v6));
        policies.extend(builtin_policies(v6, Verdict::Drop));
    } else {
        // IPv6 is still rebuilt, open
        policies.extend(builtin_policies(v6, Verdict::Accept));
    }

    CompiledRuleSet {
        families: vec![v4, v6],
        nat,
        allow_set: Some(allow.ip_ranges().iter().copied().collect()),
        chains,
        rules,
        hooks,
        policies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAT_SAVE: &str = "\
# Generated by iptables-save v1.8.7 on Tue Jan  2 10:00:00 2024
*nat
:PREROUTING ACCEPT [0:0]
:INPUT ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
:DOCKER_OUTPUT - [0:0]
:DOCKER_POSTROUTING - [0:0]
:UNRELATED - [0:0]
-A OUTPUT -d 127.0.0.11/32 -j DOCKER_OUTPUT
-A POSTROUTING -d 127.0.0.11/32 -j DOCKER_POSTROUTING
-A DOCKER_OUTPUT -d 127.0.0.11/32 -p tcp -m tcp --dport 53 -j DNAT --to-destination 127.0.0.11:37619
-A DOCKER_OUTPUT -d 127.0.0.11/32 -p udp -m udp --dport 53 -j DNAT --to-destination 127.0.0.11:45213
-A DOCKER_POSTROUTING -s 127.0.0.11/32 -p tcp -m tcp --sport 37619 -j SNAT --to-source :53
-A UNRELATED -d 10.0.0.0/8 -m comment --comment \"site nat\" -j MASQUERADE
COMMIT
";

    fn allow_set() -> ResolvedAllowSet {
        ResolvedAllowSet::new(
            BTreeSet::from(["203.0.113.5/32".parse().unwrap(), "140.82.112.0/20".parse().unwrap()]),
            BTreeSet::from([22, 443, 8443]),
            "172.17.0.0/24".parse().unwrap(),
        )
    }

    fn options(default_policy: DefaultPolicy, log_blocked: bool) -> RuleOptions {
        RuleOptions {
            default_policy,
            log_blocked,
            block_ipv6: true,
        }
    }

    // =========================================================================
    // Foreign NAT capture
    // =========================================================================

    #[test]
    fn test_foreign_nat_keeps_only_container_dns_rules() {
        let nat = ForeignNatRules::from_save_output(NAT_SAVE);
        assert_eq!(nat.rules.len(), 5);
        assert!(nat.rules.iter().all(|r| r[0] == "-A"));
        assert!(!nat.rules.iter().any(|r| r.contains(&"MASQUERADE".to_string())));
        assert_eq!(
            nat.chains,
            BTreeSet::from(["DOCKER_OUTPUT".to_string(), "DOCKER_POSTROUTING".to_string()])
        );
    }

    #[test]
    fn test_foreign_nat_empty() {
        let nat = ForeignNatRules::from_save_output("*nat\n:OUTPUT ACCEPT [0:0]\nCOMMIT\n");
        assert!(nat.is_empty());
        assert!(nat.chains.is_empty());
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"-A X -m comment --comment "a \"b\" c" -j DROP"#),
            vec!["-A", "X", "-m", "comment", "--comment", "a \"b\" c", "-j", "DROP"]
        );
        assert_eq!(tokenize(r#"--log-prefix """#), vec!["--log-prefix", ""]);
    }

    #[test]
    fn test_nat_rules_rendered_verbatim() {
        let nat = ForeignNatRules::from_save_output(NAT_SAVE);
        let text = compile(&allow_set(), options(DefaultPolicy::Drop, false), nat).render();
        assert!(text.contains("iptables -t nat -N DOCKER_OUTPUT\n"));
        assert!(text.contains(
            "iptables -t nat -A DOCKER_OUTPUT -d 127.0.0.11/32 -p udp -m udp --dport 53 -j DNAT --to-destination 127.0.0.11:45213\n"
        ));
    }

    // =========================================================================
    // Skeleton ordering
    // =========================================================================

    #[test]
    fn test_terminal_rule_is_last_on_every_chain() {
        for policy in [DefaultPolicy::Drop, DefaultPolicy::Reject] {
            let set = compile(&allow_set(), options(policy, true), ForeignNatRules::default());
            for family in [Family::V4, Family::V6] {
                for chain in Chain::BUILTIN {
                    let last = set.chain_rules(family, chain).last().unwrap();
                    assert_eq!(last.section, Section::Terminal, "{:?} {:?}", family, chain);
                }
            }
        }
    }

    #[test]
    fn test_sections_are_in_skeleton_order() {
        let set = compile(&allow_set(), options(DefaultPolicy::Reject, true), ForeignNatRules::default());
        for family in set.families() {
            let sections: Vec<Section> = set
                .rules()
                .iter()
                .filter(|r| r.family == *family)
                .map(|r| r.section)
                .collect();
            let mut sorted = sections.clone();
            sorted.sort();
            assert_eq!(sections, sorted);
        }
    }

    #[test]
    fn test_reject_uses_admin_prohibited() {
        let set = compile(&allow_set(), options(DefaultPolicy::Reject, false), ForeignNatRules::default());
        let out = set.chain_rules(Family::V4, Chain::Output).last().unwrap();
        assert_eq!(out.args, vec!["-j", "REJECT", "--reject-with", "icmp-admin-prohibited"]);
        let out6 = set.chain_rules(Family::V6, Chain::Output).last().unwrap();
        assert_eq!(out6.args, vec!["-j", "REJECT", "--reject-with", "icmp6-adm-prohibited"]);
        assert!(set.policies().iter().all(|p| p.verdict == Verdict::Drop));
    }

    #[test]
    fn test_accept_policy_has_no_terminal_or_logging() {
        let set = compile(&allow_set(), options(DefaultPolicy::Accept, true), ForeignNatRules::default());
        assert!(!set
            .rules()
            .iter()
            .any(|r| matches!(r.section, Section::Terminal | Section::Logging)));
        assert!(set.policies().iter().all(|p| p.verdict == Verdict::Accept));
        assert_eq!(set.families(), &[Family::V4, Family::V6]);
        assert!(set.hooks().iter().all(|h| h.family == Family::V4));
    }

    #[test]
    fn test_logging_before_terminal() {
        let set = compile(&allow_set(), options(DefaultPolicy::Drop, true), ForeignNatRules::default());
        let output: Vec<&Rule> = set.chain_rules(Family::V4, Chain::Output).collect();
        let n = output.len();
        assert_eq!(output[n - 2].target(), Some("LOG"));
        assert!(output[n - 2].args.contains(&LOG_RATE.to_string()));
        assert_eq!(output[n - 1].target(), Some("DROP"));
    }

    #[test]
    fn test_no_logging_when_disabled() {
        let set = compile(&allow_set(), options(DefaultPolicy::Drop, false), ForeignNatRules::default());
        assert!(!set.rules().iter().any(|r| r.target() == Some("LOG")));
    }

    // =========================================================================
    // Allow-list completeness
    // =========================================================================

    #[test]
    fn test_every_range_and_port_is_present() {
        let allow = allow_set();
        let set = compile(&allow, options(DefaultPolicy::Drop, false), ForeignNatRules::default());

        let members: BTreeSet<Ipv4Net> = set.allow_set().unwrap().iter().copied().collect();
        assert_eq!(&members, allow.ip_ranges());

        for port in allow.tcp_ports() {
            let port = port.to_string();
            assert!(
                set.chain_rules(Family::V4, Chain::Output)
                    .any(|r| r.section == Section::Ports && r.args.contains(&port)),
                "missing port {}",
                port
            );
        }
    }

    #[test]
    fn test_ports_jump_to_allow_chain_except_dns() {
        let set = compile(&allow_set(), options(DefaultPolicy::Drop, false), ForeignNatRules::default());
        for rule in set.rules().iter().filter(|r| r.section == Section::Ports) {
            if rule.args.contains(&"53".to_string()) {
                assert_eq!(rule.target(), Some("ACCEPT"));
            } else {
                assert_eq!(rule.target(), Some(ALLOW_CHAIN));
            }
        }
        assert!(set.chains().contains(&(Family::V4, Chain::Allow)));
        assert!(!set.chains().contains(&(Family::V6, Chain::Allow)));
        let allow_rules: Vec<&Rule> = set.chain_rules(Family::V4, Chain::Allow).collect();
        assert_eq!(allow_rules.len(), 1);
        assert!(allow_rules[0].args.contains(&ALLOW_SET.to_string()));
    }

    #[test]
    fn test_dns_port_always_present() {
        let allow = ResolvedAllowSet::new(BTreeSet::new(), BTreeSet::new(), "10.0.0.0/24".parse().unwrap());
        assert_eq!(allow.tcp_ports(), &BTreeSet::from([53]));
    }

    #[test]
    fn test_host_network_allowed_both_ways() {
        let set = compile(&allow_set(), options(DefaultPolicy::Drop, false), ForeignNatRules::default());
        assert!(set
            .chain_rules(Family::V4, Chain::Input)
            .any(|r| r.args == vec!["-s", "172.17.0.0/24", "-j", "ACCEPT"]));
        assert!(set
            .chain_rules(Family::V4, Chain::Output)
            .any(|r| r.args == vec!["-d", "172.17.0.0/24", "-j", "ACCEPT"]));
    }

    #[test]
    fn test_ipv6_left_alone_when_not_blocked() {
        let opts = RuleOptions {
            default_policy: DefaultPolicy::Drop,
            log_blocked: false,
            block_ipv6: false,
        };
        let set = compile(&allow_set(), opts, ForeignNatRules::default());
        assert_eq!(set.families(), &[Family::V4, Family::V6]);
        assert!(set.rules().iter().all(|r| r.family == Family::V4));
        assert!(set.chains().iter().all(|(f, _)| *f == Family::V4));
        assert!(set.hooks().iter().all(|h| h.family == Family::V4));
        let v6: Vec<&Policy> = set.policies().iter().filter(|p| p.family == Family::V6).collect();
        assert_eq!(v6.len(), 3);
        assert!(v6.iter().all(|p| p.verdict == Verdict::Accept));
    }

    #[test]
    fn test_filter_rules_only_in_owned_chains() {
        let set = compile(&allow_set(), options(DefaultPolicy::Drop, true), ForeignNatRules::default());
        for rule in set.rules() {
            assert!(rule.chain.as_str().starts_with("EGRESSGUARD-"), "{}", rule);
            assert!(set.chains().contains(&(rule.family, rule.chain)), "{}", rule);
        }
        assert_eq!(set.hooks().len(), 6);
    }

    #[test]
    fn test_hooks_installed_after_rules() {
        let text = compile(&allow_set(), options(DefaultPolicy::Drop, false), ForeignNatRules::default()).render();
        let lines: Vec<&str> = text.lines().collect();
        let hook = lines
            .iter()
            .position(|l| *l == "iptables -I OUTPUT 1 -j EGRESSGUARD-OUTPUT")
            .unwrap();
        let last_rule = lines.iter().rposition(|l| l.contains(" -A ")).unwrap();
        assert!(hook > last_rule);
        assert!(!lines.iter().any(|l| l.contains(" -F") || l.contains("-t mangle")));
    }

    #[test]
    fn test_hook_args() {
        let hook = Hook {
            family: Family::V6,
            chain: Chain::Input,
        };
        assert_eq!(hook.insert_args(), vec!["-I", "INPUT", "1", "-j", "EGRESSGUARD-INPUT"]);
        assert_eq!(hook.delete_args(), vec!["-D", "INPUT", "-j", "EGRESSGUARD-INPUT"]);
        assert_eq!(hook.to_string(), "ip6tables -I INPUT 1 -j EGRESSGUARD-INPUT");
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    #[test]
    fn test_render_is_deterministic() {
        let nat = ForeignNatRules::from_save_output(NAT_SAVE);
        let a = compile(&allow_set(), options(DefaultPolicy::Drop, true), nat.clone()).render();
        let b = compile(&allow_set(), options(DefaultPolicy::Drop, true), nat).render();
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_policies_last() {
        let text = compile(&allow_set(), options(DefaultPolicy::Drop, true), ForeignNatRules::default()).render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.last(), Some(&"ip6tables -P FORWARD DROP"));
        assert!(text.contains(
            "iptables -A EGRESSGUARD-OUTPUT -m limit --limit 5/min -j LOG --log-prefix \"EGRESS-BLOCKED: \" --log-level 4\n"
        ));
        assert!(text.contains("ipset add egressguard-allow 203.0.113.5/32\n"));
    }

    #[test]
    fn test_lockdown_is_loopback_only() {
        let set = CompiledRuleSet::lockdown(ForeignNatRules::default());
        assert!(set.allow_set().is_none());
        assert!(set
            .rules()
            .iter()
            .all(|r| r.args.contains(&"lo".to_string()) || r.section == Section::Terminal));
        assert_eq!(set.hooks().len(), 6);
        assert_eq!(set.policies().len(), 6);
        assert!(set.policies().iter().all(|p| p.verdict == Verdict::Drop));
    }

    #[test]
    fn test_open_accepts_everything() {
        let set = CompiledRuleSet::open(ForeignNatRules::default());
        assert!(set.rules().is_empty());
        assert!(set.chains().is_empty());
        assert!(set.hooks().is_empty());
        assert_eq!(set.families(), &[Family::V4, Family::V6]);
        assert!(set.policies().iter().all(|p| p.verdict == Verdict::Accept));
    }
}
