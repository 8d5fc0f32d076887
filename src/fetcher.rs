//! Provider range fetcher (GitHub `meta` API).
//!
//! Unlike hostname resolution, every failure here is fatal: an unreachable
//! endpoint, a response missing a required field, or a single malformed
//! range aborts the cycle before the firewall is touched.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::aggregator::{aggregate, aggregate_checked_with, Aggregation};
use crate::config::ProviderConfig;
use crate::error::Warning;
use crate::utils::format_count;
use crate::validation::{is_ipv6_cidr, validate_ipv4_cidr};

const TIMEOUT_SECS: u64 = 8;

/// Maximum size of the provider document (5 MB)
/// The GitHub meta document is a few hundred KB
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// Source of the provider's published range document.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Fetch the raw JSON document.
    async fn fetch_document(&self) -> Result<String>;
}

/// HTTP client for the provider API
pub struct Fetcher {
    client: Client,
    config: ProviderConfig,
}

impl Fetcher {
    /// Create a new fetcher for the configured provider endpoint
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(TIMEOUT_SECS))
            .https_only(true)
            .user_agent(format!("egressguard/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

// Note: Default is intentionally not implemented for Fetcher
// because new() can fail and we want explicit error handling.

#[async_trait]
impl RangeSource for Fetcher {
    async fn fetch_document(&self) -> Result<String> {
        info!("Fetching provider ranges from {}...", self.config.url);

        let mut request = self
            .client
            .get(&self.config.url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = self.config.get_token() {
            debug!("Using provider API token");
            request = request.bearer_auth(token.as_str());
        }

        let mut response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.config.url))?;

        if !response.status().is_success() {
            anyhow::bail!("{} returned HTTP {}", self.config.url, response.status());
        }

        if let Some(content_length) = response.content_length() {
            if content_length as usize > MAX_RESPONSE_SIZE {
                anyhow::bail!(
                    "Response too large: {} bytes (max: {} bytes)",
                    content_length,
                    MAX_RESPONSE_SIZE
                );
            }
        }

        // Content-Length may be absent
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read response body")?
        {
            append_capped(&mut body, &chunk, MAX_RESPONSE_SIZE)?;
        }

        String::from_utf8(body).context("Provider response is not valid UTF-8")
    }
}

/// Append a downloaded chunk, failing as soon as the body exceeds `max` bytes.
fn append_capped(body: &mut Vec<u8>, chunk: &[u8], max: usize) -> Result<()> {
    if body.len() + chunk.len() > max {
        anyhow::bail!(
            "Downloaded content too large: {} bytes read (max: {} bytes)",
            body.len() + chunk.len(),
            max
        );
    }
    body.extend_from_slice(chunk);
    Ok(())
}

/// The fields of the meta document that are enforced. All three are required.
#[derive(Deserialize)]
struct GitHubMeta {
    web: Vec<String>,
    api: Vec<String>,
    git: Vec<String>,
}

/// Validated provider ranges, ready for the allow set.
#[derive(Debug, Clone)]
pub struct ProviderRanges {
    /// Aggregated (or fallback) IPv4 ranges
    pub ranges: Vec<Ipv4Net>,
    /// IPv4 entries in the document before aggregation
    pub raw_count: usize,
    /// IPv6 entries present but not enforced through the IPv4 allow set
    pub skipped_ipv6: usize,
    pub warnings: Vec<Warning>,
}

/// Parse and validate a provider document.
///
/// Missing `web`, `api` or `git` fields, or any entry that is neither an
/// IPv4 nor an IPv6 range, is an error.
pub fn parse_meta(content: &str) -> Result<(Vec<Ipv4Net>, usize)> {
    let meta: GitHubMeta = serde_json::from_str(content)
        .context("Provider response is missing required fields (web, api, git) or is not valid JSON")?;

    let mut v4 = Vec::new();
    let mut skipped_v6 = 0;
    let sections = [("web", &meta.web), ("api", &meta.api), ("git", &meta.git)];
    for (section, entries) in sections {
        for entry in entries {
            if is_ipv6_cidr(entry) {
                skipped_v6 += 1;
                continue;
            }
            let net = validate_ipv4_cidr(entry)
                .with_context(|| format!("Invalid range in provider field '{}': {:?}", section, entry))?;
            v4.push(net);
        }
    }

    Ok((v4, skipped_v6))
}

/// Fetch, validate and aggregate the provider's ranges.
pub async fn fetch_provider_ranges(source: &dyn RangeSource) -> Result<ProviderRanges> {
    let content = source.fetch_document().await?;
    ranges_from_document(&content, aggregate)
}

/// Validate and aggregate a fetched document using `merge` as the merge step.
fn ranges_from_document<F>(content: &str, merge: F) -> Result<ProviderRanges>
where
    F: FnOnce(&[Ipv4Net]) -> Vec<Ipv4Net>,
{
    let (ranges, skipped_ipv6) = parse_meta(content)?;
    let raw_count = ranges.len();

    if raw_count == 0 {
        anyhow::bail!("Provider response contains no IPv4 ranges");
    }
    debug!("Skipped {} IPv6 provider ranges", skipped_ipv6);

    let mut warnings = Vec::new();
    let ranges = match aggregate_checked_with(&ranges, merge) {
        Aggregation::Aggregated(merged) => {
            info!(
                "Provider ranges: {} entries -> {} aggregated",
                format_count(raw_count),
                format_count(merged.len())
            );
            merged
        }
        Aggregation::Fallback(unmerged) => {
            warn!(
                "Aggregation lost coverage, using {} unaggregated provider ranges",
                unmerged.len()
            );
            warnings.push(Warning::AggregationFallback {
                ranges: unmerged.len(),
            });
            unmerged
        }
    };

    Ok(ProviderRanges {
        ranges,
        raw_count,
        skipped_ipv6,
        warnings,
    })
}
