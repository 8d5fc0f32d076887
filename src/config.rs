//! Configuration parsing for egressguard.
//!
//! The configuration is the `network.security` section of the environment's
//! YAML file plus the top-level `ports` map. Parsing is a pure function of
//! the file contents ([`Config::from_yaml`]); [`Config::load`] only adds the
//! "missing file means disabled" rule on top of it.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::validation::validate_probe_url;

/// GitHub's published service ranges
pub const GITHUB_META_URL: &str = "https://api.github.com/meta";

/// Environment variable consulted for the provider API token by default
pub const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Secure string type that zeroizes memory on drop
/// Used for the provider API token
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Top-level configuration (only the keys this tool reads)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,

    /// Ports published by the environment; their values are allow-listed too
    #[serde(deserialize_with = "deserialize_ports")]
    pub ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub security: SecurityConfig,
}

/// The `network.security` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Master switch; anything but `true` leaves egress unrestricted
    pub enabled: bool,

    /// Verdict for traffic no rule accepts
    pub default_policy: DefaultPolicy,

    /// Log (rate-limited) packets that reach the terminal rule
    pub log_blocked: bool,

    /// Hostnames to resolve and allow; `*.domain` allows the base domain
    pub allowed_hosts: Vec<String>,

    /// Literal IPv4 addresses or CIDR ranges to allow
    pub allowed_ips: Vec<String>,

    /// Destination TCP ports allowed to any address
    pub allowed_ports: Vec<u16>,

    /// Allow the provider's published ranges (GitHub meta API)
    pub provider_ranges: bool,

    /// Apply the default policy to IPv6 as well
    pub block_ipv6: bool,

    pub provider: ProviderConfig,

    pub verify: VerifyConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_policy: DefaultPolicy::Drop,
            log_blocked: false,
            allowed_hosts: Vec::new(),
            allowed_ips: Vec::new(),
            allowed_ports: Vec::new(),
            provider_ranges: true,
            block_ipv6: true,
            provider: ProviderConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DefaultPolicy {
    #[default]
    #[serde(alias = "drop")]
    Drop,
    #[serde(alias = "reject")]
    Reject,
    #[serde(alias = "accept")]
    Accept,
}

impl DefaultPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultPolicy::Drop => "DROP",
            DefaultPolicy::Reject => "REJECT",
            DefaultPolicy::Accept => "ACCEPT",
        }
    }
}

impl std::fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub url: String,
    /// Environment variable holding an API token (optional)
    pub token_env: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: GITHUB_META_URL.to_string(),
            token_env: None,
        }
    }
}

impl ProviderConfig {
    /// Get the API token from the configured or default environment variable.
    /// Returns a SecureString that will be zeroed when dropped
    pub fn get_token(&self) -> Option<SecureString> {
        let name = self.token_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
        env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecureString::new)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    pub enabled: bool,
    /// Target that must NOT be reachable after enforcement
    pub blocked: String,
    /// Targets that must be reachable after enforcement (at least two)
    pub allowed: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked: "https://example.com".to_string(),
            allowed: vec![
                "https://api.github.com/zen".to_string(),
                "https://registry.npmjs.org".to_string(),
            ],
            timeout_secs: 5,
        }
    }
}

/// Keep the numeric `ports` values, written as numbers or numeric strings.
///
/// Anything else (`"8080:80"` mappings, service names) is not a port this
/// policy can allow and is skipped.
fn deserialize_ports<'de, D>(deserializer: D) -> Result<BTreeMap<String, u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, serde_yaml::Value> = BTreeMap::deserialize(deserializer)?;
    let mut ports = BTreeMap::new();

    for (name, value) in raw {
        let port = match &value {
            serde_yaml::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            serde_yaml::Value::String(s) => s.trim().parse::<u16>().ok(),
            _ => None,
        };
        match port {
            Some(p) => {
                ports.insert(name, p);
            }
            None => debug!("Skipping non-numeric port '{}': {:?}", name, value),
        }
    }

    Ok(ports)
}

impl Config {
    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    ///
    /// Returns `Ok(None)` when the file does not exist: no configuration
    /// means no policy.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file: {:?}", path))
            }
        };
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        Ok(Some(config))
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.network.security
    }

    /// Validate configuration values that do not depend on policy merging
    pub fn validate(&self) -> Result<()> {
        let security = self.security();
        if !security.enabled {
            return Ok(());
        }

        if security.provider_ranges && !security.provider.url.starts_with("https://") {
            anyhow::bail!(
                "Provider URL must use HTTPS: {}",
                security.provider.url
            );
        }

        if let Some(ref name) = security.provider.token_env {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                anyhow::bail!("Invalid token_env '{}': must be an environment variable name", name);
            }
        }

        if security.verify.enabled {
            if security.verify.allowed.len() < 2 {
                anyhow::bail!(
                    "verify.allowed needs at least two targets, got {}",
                    security.verify.allowed.len()
                );
            }
            validate_probe_url(&security.verify.blocked)?;
            for url in &security.verify.allowed {
                validate_probe_url(url)?;
            }
            if security.verify.timeout_secs == 0 || security.verify.timeout_secs > 60 {
                anyhow::bail!(
                    "verify.timeout_secs must be between 1 and 60, got {}",
                    security.verify.timeout_secs
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_disabled() {
        let config = Config::default();
        assert!(!config.security().enabled);
        assert_eq!(config.security().default_policy, DefaultPolicy::Drop);
        assert!(config.security().provider_ranges);
        assert!(config.security().block_ipv6);
        assert!(config.ports.is_empty());
    }

    #[test]
    fn test_parse_full_security_section() {
        let yaml = r#"
network:
  security:
    enabled: true
    default_policy: REJECT
    log_blocked: true
    allowed_hosts:
      - api.example.org
      - "*.example.com"
    allowed_ips:
      - 198.51.100.0/24
    allowed_ports: [8443, 8443]
ports:
  web: 3000
  api: "8080"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let security = config.security();
        assert!(security.enabled);
        assert_eq!(security.default_policy, DefaultPolicy::Reject);
        assert!(security.log_blocked);
        assert_eq!(security.allowed_hosts.len(), 2);
        assert_eq!(security.allowed_ips, vec!["198.51.100.0/24"]);
        assert_eq!(security.allowed_ports, vec![8443, 8443]);
        assert_eq!(config.ports.get("web"), Some(&3000));
        assert_eq!(config.ports.get("api"), Some(&8080));
    }

    #[test]
    fn test_default_policy_case_insensitive_aliases() {
        let yaml = "network:\n  security:\n    default_policy: drop\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.security().default_policy, DefaultPolicy::Drop);

        let yaml = "network:\n  security:\n    default_policy: ACCEPT\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.security().default_policy, DefaultPolicy::Accept);
    }

    #[test]
    fn test_invalid_default_policy_rejected() {
        let yaml = "network:\n  security:\n    default_policy: ALLOW_ALL\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unrelated_keys_ignored() {
        let yaml = r#"
name: my-environment
image: node:20
network:
  mode: bridge
  security:
    enabled: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(!config.security().enabled);
    }

    #[test]
    fn test_ports_skip_non_numeric() {
        let yaml = "ports:\n  web: \"8080:80\"\n  docs: http\n  big: 70000\n  api: \"9229\"\n  db: 5432\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports.get("api"), Some(&9229));
        assert_eq!(config.ports.get("db"), Some(&5432));
    }

    #[test]
    fn test_disabled_config_with_port_mapping_is_accepted() {
        let yaml = "network:\n  security:\n    enabled: false\nports:\n  web: \"8080:80\"\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(!config.security().enabled);
        assert!(config.ports.is_empty());
    }

    #[test]
    fn test_disabled_config_skips_provider_checks() {
        let yaml = r#"
network:
  security:
    enabled: false
    provider:
      url: "http://api.github.com/meta"
      token_env: "GITHUB TOKEN; echo"
"#;
        assert!(Config::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_provider_url_must_be_https() {
        let yaml = r#"
network:
  security:
    enabled: true
    provider:
      url: "http://api.github.com/meta"
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("HTTPS"));
    }

    #[test]
    fn test_provider_url_not_checked_when_ranges_disabled() {
        let yaml = r#"
network:
  security:
    enabled: true
    provider_ranges: false
    provider:
      url: "http://mirror.internal/meta"
"#;
        assert!(Config::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_verify_requires_two_allowed_targets() {
        let yaml = r#"
network:
  security:
    enabled: true
    verify:
      allowed: ["https://api.github.com/zen"]
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("at least two"));
    }

    #[test]
    fn test_verify_disabled_skips_target_checks() {
        let yaml = r#"
network:
  security:
    enabled: true
    verify:
      enabled: false
      allowed: []
"#;
        assert!(Config::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_invalid_token_env_rejected() {
        let yaml = r#"
network:
  security:
    enabled: true
    provider:
      token_env: "GITHUB TOKEN; echo"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_provider_token_from_env() {
        let config = ProviderConfig {
            url: GITHUB_META_URL.to_string(),
            token_env: Some("EGRESSGUARD_TEST_TOKEN_A".to_string()),
        };
        env::set_var("EGRESSGUARD_TEST_TOKEN_A", "ghp_secret");
        let token = config.get_token().unwrap();
        assert_eq!(token.as_str(), "ghp_secret");
        assert_eq!(format!("{:?}", token), "[REDACTED]");
        env::remove_var("EGRESSGUARD_TEST_TOKEN_A");
        assert!(config.get_token().is_none());
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(dir.path().join("absent.yaml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_load_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "network:\n  security:\n    enabled: true\n").unwrap();
        let config = Config::load(&path).unwrap().unwrap();
        assert!(config.security().enabled);
    }

    #[test]
    fn test_load_invalid_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "network: [unclosed").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.yaml"));
    }

    #[test]
    fn test_secure_string_redacted() {
        let secret = SecureString::from("token");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert!(!secret.is_empty());
        assert!(SecureString::default().is_empty());
    }
}
