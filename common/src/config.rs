use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use anyhow::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub enforcer: EnforcerConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    /// Cloud gateway settings keyed by provider kind ("aws", "azure", ...).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrent_accounts")]
    pub max_concurrent_accounts: usize,
    /// Bound on every single provider call (billing fetch, stop, terminate, metrics).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Bound on one whole remediation capability invocation.
    #[serde(default = "default_remediation_timeout_secs")]
    pub remediation_timeout_secs: u64,
    #[serde(default = "default_remediation_cap")]
    pub remediation_cap: usize,
    #[serde(default = "default_essential_tag")]
    pub essential_tag: String,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrent_accounts: default_max_concurrent_accounts(),
            call_timeout_secs: default_call_timeout_secs(),
            remediation_timeout_secs: default_remediation_timeout_secs(),
            remediation_cap: default_remediation_cap(),
            essential_tag: default_essential_tag(),
        }
    }
}

/// What the rule evaluator does when a rule cannot be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Treat the policy as not violated.
    Open,
    /// Treat the policy as violated.
    Closed,
}

impl Default for FailureMode {
    fn default() -> Self {
        FailureMode::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSourceKind {
    Database,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rule_source")]
    pub source: RuleSourceKind,
    #[serde(default = "default_rules_dir")]
    pub dir: String,
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            source: default_rule_source(),
            dir: default_rules_dir(),
            reload_interval_secs: default_reload_interval_secs(),
            failure_mode: FailureMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { timeout_secs: default_call_timeout_secs() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self { socket_path: default_socket_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub endpoint: String,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_interval_secs() -> u64 { 300 }
fn default_max_concurrent_accounts() -> usize { 8 }
fn default_call_timeout_secs() -> u64 { 10 }
fn default_remediation_timeout_secs() -> u64 { 60 }
fn default_remediation_cap() -> usize { 5 }
fn default_essential_tag() -> String { "Essential".to_string() }
fn default_rule_source() -> RuleSourceKind { RuleSourceKind::Database }
fn default_rules_dir() -> String { "./policies".to_string() }
fn default_reload_interval_secs() -> u64 { 30 }
fn default_db_path() -> String { "./finops.db".to_string() }
fn default_socket_path() -> String { "/run/finops/enforcer.sock".to_string() }

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn default_path() -> String {
        std::env::var("FINOPS_CONFIG")
            .unwrap_or_else(|_| "./config/default.toml".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.enforcer.interval_secs, 300);
        assert_eq!(config.enforcer.remediation_cap, 5);
        assert_eq!(config.enforcer.essential_tag, "Essential");
        assert_eq!(config.rules.reload_interval_secs, 30);
        assert_eq!(config.rules.failure_mode, FailureMode::Open);
        assert_eq!(config.notify.timeout_secs, 10);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn partial_sections_and_providers() {
        let config = Config::parse(
            r#"
            [enforcer]
            interval_secs = 60
            max_concurrent_accounts = 2

            [rules]
            source = "directory"
            failure_mode = "closed"

            [providers.aws]
            endpoint = "http://127.0.0.1:9100/aws"
            region = "us-east-1"

            [providers.gcp]
            endpoint = "http://127.0.0.1:9100/gcp"
            "#,
        )
        .unwrap();

        assert_eq!(config.enforcer.interval_secs, 60);
        assert_eq!(config.enforcer.max_concurrent_accounts, 2);
        assert_eq!(config.enforcer.call_timeout_secs, 10);
        assert_eq!(config.enforcer.remediation_timeout_secs, 60);
        assert_eq!(config.rules.source, RuleSourceKind::Directory);
        assert_eq!(config.rules.failure_mode, FailureMode::Closed);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers["aws"].region.as_deref(), Some("us-east-1"));
        assert!(config.providers["gcp"].region.is_none());
    }
}
