//! Post-enforcement verification with live probes.
//!
//! The blocked target must be unreachable and every allowed target must
//! answer. Any HTTP status counts as reachable; only a transport failure
//! (refused, reset, timeout) counts as blocked.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::VerifyConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Got an HTTP response with this status
    Reachable(u16),
    /// Transport-level failure
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable(_))
    }
}

/// Issues a single probe to a URL.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// HTTP prober with a per-request timeout and no redirects.
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("egressguard/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.client.get(url).send().await {
            Ok(response) => ProbeOutcome::Reachable(response.status().as_u16()),
            Err(e) if e.is_timeout() => ProbeOutcome::Unreachable("timed out".to_string()),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}

/// Outcome of one verification pass. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub blocked_target: String,
    /// True when the blocked target was indeed unreachable
    pub blocked_probe_passed: bool,
    /// Allowed target -> whether it was reachable
    pub allowed_probes_passed: BTreeMap<String, bool>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.blocked_probe_passed && self.allowed_probes_passed.values().all(|&ok| ok)
    }

    /// Human-readable description of every failed probe.
    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if !self.blocked_probe_passed {
            failures.push(format!("{} is reachable but should be blocked", self.blocked_target));
        }
        for (target, ok) in &self.allowed_probes_passed {
            if !ok {
                failures.push(format!("{} is unreachable but should be allowed", target));
            }
        }
        failures
    }
}

/// Run one verification pass. Probes run one after another, no retries.
pub async fn verify(prober: &dyn Prober, config: &VerifyConfig) -> VerificationResult {
    info!("Verifying firewall rules...");

    let blocked = prober.probe(&config.blocked).await;
    let blocked_probe_passed = !blocked.is_reachable();
    match &blocked {
        ProbeOutcome::Unreachable(reason) => {
            info!("[OK] {} blocked as expected ({})", config.blocked, reason)
        }
        ProbeOutcome::Reachable(status) => warn!(
            "[FAIL] {} answered with HTTP {} but should be blocked",
            config.blocked, status
        ),
    }

    let mut allowed_probes_passed = BTreeMap::new();
    for target in &config.allowed {
        let outcome = prober.probe(target).await;
        match &outcome {
            ProbeOutcome::Reachable(status) => {
                debug!("{} answered with HTTP {}", target, status);
                info!("[OK] {} reachable as expected", target);
            }
            ProbeOutcome::Unreachable(reason) => {
                warn!("[FAIL] {} unreachable: {}", target, reason)
            }
        }
        allowed_probes_passed.insert(target.clone(), outcome.is_reachable());
    }

    VerificationResult {
        blocked_target: config.blocked.clone(),
        blocked_probe_passed,
        allowed_probes_passed,
    }
}
