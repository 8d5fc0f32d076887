//! Error and warning types for egressguard.
//!
//! Fatal errors abort an enforcement cycle and map to a non-zero exit status.
//! Warnings are recoverable: they are logged and accumulated in the cycle
//! report, never silently dropped.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FatalError {
    #[error("Configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("Provider range fetch failed: {0:#}")]
    ProviderFetch(anyhow::Error),

    #[error("Host network detection failed: {0:#}")]
    HostNetwork(anyhow::Error),

    #[error("Enforcement failed: {0:#}")]
    Enforcement(anyhow::Error),

    #[error("Verification failed: {}", .0.join("; "))]
    Verification(Vec<String>),

    #[error("Interrupted before enforcement started, firewall left untouched")]
    Interrupted,

    #[error("Could not acquire the run lock: {0:#}")]
    Lock(anyhow::Error),
}

impl FatalError {
    /// Name of the pipeline stage that failed, for diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            FatalError::Config(_) => "policy",
            FatalError::ProviderFetch(_) => "provider-ranges",
            FatalError::HostNetwork(_) => "host-network",
            FatalError::Enforcement(_) => "enforcement",
            FatalError::Verification(_) => "verification",
            FatalError::Interrupted => "interrupted",
            FatalError::Lock(_) => "lock",
        }
    }
}

/// A recoverable problem encountered during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A hostname could not be resolved and contributes no addresses.
    HostUnresolved { host: String, reason: String },
    /// The resolver returned something that is not a dotted-quad IPv4 address.
    InvalidAnswer { host: String, answer: String },
    /// A `*.domain` pattern was widened to the whole domain.
    WildcardBroadened { pattern: String, domain: String },
    /// Range aggregation lost coverage, so the unaggregated ranges were used.
    AggregationFallback { ranges: usize },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::HostUnresolved { host, reason } => {
                write!(f, "Failed to resolve {}: {}", host, reason)
            }
            Warning::InvalidAnswer { host, answer } => {
                write!(f, "Discarded invalid DNS answer for {}: {:?}", host, answer)
            }
            Warning::WildcardBroadened { pattern, domain } => write!(
                f,
                "Wildcard {} allows all of {} (resolved as the base domain)",
                pattern, domain
            ),
            Warning::AggregationFallback { ranges } => write!(
                f,
                "Range aggregation dropped coverage, using {} unaggregated ranges",
                ranges
            ),
        }
    }
}
