use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum PolicyType {
    MaxSpend,
    BlockInstanceType,
    AutoStopIdle,
    RequireTags,
    Other(String),
}

impl PolicyType {
    pub fn as_str(&self) -> &str {
        match self {
            PolicyType::MaxSpend => "max_spend",
            PolicyType::BlockInstanceType => "block_instance_type",
            PolicyType::AutoStopIdle => "auto_stop_idle",
            PolicyType::RequireTags => "require_tags",
            PolicyType::Other(s) => s,
        }
    }
}

impl FromStr for PolicyType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // dashed spellings show up in hand-written configs
        Ok(match s.replace('-', "_").as_str() {
            "max_spend" => PolicyType::MaxSpend,
            "block_instance_type" => PolicyType::BlockInstanceType,
            "auto_stop_idle" => PolicyType::AutoStopIdle,
            "require_tags" => PolicyType::RequireTags,
            _ => PolicyType::Other(s.to_string()),
        })
    }
}

impl TryFrom<String> for PolicyType {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PolicyType> for String {
    fn from(t: PolicyType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    Aws,
    Azure,
    Gcp,
    Oci,
    Ibm,
    Other(String),
}

impl ProviderKind {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Azure => "azure",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Oci => "oci",
            ProviderKind::Ibm => "ibm",
            ProviderKind::Other(s) => s,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "aws" => ProviderKind::Aws,
            "azure" => ProviderKind::Azure,
            "gcp" => ProviderKind::Gcp,
            "oci" => ProviderKind::Oci,
            "ibm" => ProviderKind::Ibm,
            _ => ProviderKind::Other(s.to_string()),
        })
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProviderKind> for String {
    fn from(k: ProviderKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => anyhow::bail!("unknown severity: {}", other),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ViolationStatus {
    Pending,
    Remediated,
    Ignored,
}

impl ViolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Pending => "pending",
            ViolationStatus::Remediated => "remediated",
            ViolationStatus::Ignored => "ignored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ViolationStatus::Pending)
    }
}

impl FromStr for ViolationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ViolationStatus::Pending),
            "remediated" => Ok(ViolationStatus::Remediated),
            "ignored" => Ok(ViolationStatus::Ignored),
            other => anyhow::bail!("unknown violation status: {}", other),
        }
    }
}

impl fmt::Display for ViolationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Slack,
    Discord,
    Teams,
    Generic,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookKind::Slack => "slack",
            WebhookKind::Discord => "discord",
            WebhookKind::Teams => "teams",
            WebhookKind::Generic => "generic",
        }
    }
}

impl FromStr for WebhookKind {
    type Err = std::convert::Infallible;

    /// Unrecognised channel kinds fall back to the generic payload.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "slack" => WebhookKind::Slack,
            "discord" => WebhookKind::Discord,
            "teams" => WebhookKind::Teams,
            _ => WebhookKind::Generic,
        })
    }
}


#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Policy {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: String,
    pub policy_type: PolicyType,
    pub enabled: bool,
    /// Rego module text; blank means "generate from type and config".
    pub rule_definition: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(|v| v.as_f64())
    }

    /// Severity stamped on this policy's violations. High unless the config
    /// carries a recognised `severity`.
    pub fn violation_severity(&self) -> Severity {
        self.config_str("severity")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::High)
    }
}


#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CloudAccount {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub account_id: Option<String>,
    pub subscription_id: Option<String>,
    pub project_id: Option<String>,
    pub tenancy_id: Option<String>,
    pub status: String,
    /// Opaque credential JSON, handed to the provider untouched.
    #[serde(skip_serializing)]
    pub credentials: String,
    pub monthly_spend: f64,
    pub connected_at: Option<DateTime<Utc>>,
}


#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Violation {
    pub id: String,
    pub policy_id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub provider: ProviderKind,
    pub message: String,
    pub severity: Severity,
    pub status: ViolationStatus,
    pub created_at: DateTime<Utc>,
    pub remediated_at: Option<DateTime<Utc>>,
}


#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActivityLogEntry {
    pub id: String,
    pub organization_id: String,
    pub r#type: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}


#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Webhook {
    pub id: String,
    pub organization_id: String,
    pub kind: WebhookKind,
    pub url: String,
    pub enabled: bool,
}
