//! Per-cloud capability set. Each provider kind registers one implementation;
//! the capped, exclusion-aware remediation capabilities are provided on top of
//! a handful of primitives so every provider enforces the same limits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use common::{CloudAccount, Config, ProviderKind};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EnforceError;

pub mod gateway;

pub use gateway::GatewayProvider;

/// Average CPU (percent) under which an instance counts as idle.
pub const IDLE_CPU_PERCENT: f64 = 5.0;

/// Billing snapshot for one account. `extra` carries any additional fields the
/// backend reports and is merged into the rule input document verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSnapshot {
    pub monthly_spend: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Limits applied to every remediation capability.
#[derive(Debug, Clone)]
pub struct RemediationLimits {
    /// Most resources acted on per invocation.
    pub cap: usize,
    /// Tag/label key whose value "true" exempts a resource.
    pub essential_tag: String,
}

impl Default for RemediationLimits {
    fn default() -> Self {
        Self {
            cap: 5,
            essential_tag: "Essential".to_string(),
        }
    }
}

/// What one remediation capability did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemediationOutcome {
    pub acted_on: Vec<String>,
    pub skipped_essential: Vec<String>,
    pub failed: Vec<String>,
}

impl RemediationOutcome {
    /// Every attempted action failed.
    pub fn all_failed(&self) -> bool {
        self.acted_on.is_empty() && !self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Stop,
    Terminate,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn fetch_billing(&self, account: &CloudAccount) -> Result<BillingSnapshot>;

    async fn list_running_instances(&self, account: &CloudAccount) -> Result<Vec<Instance>>;

    async fn stop_instance(&self, account: &CloudAccount, instance_id: &str) -> Result<()>;

    async fn terminate_instance(&self, account: &CloudAccount, instance_id: &str) -> Result<()>;

    /// Average CPU percent over the last `hours`, `None` when no datapoints exist.
    async fn average_cpu(&self, account: &CloudAccount, instance_id: &str, hours: f64) -> Result<Option<f64>>;

    /// Whether `instance` carries the essential marker.
    fn is_essential(&self, instance: &Instance, essential_tag: &str) -> bool {
        instance
            .tags
            .get(essential_tag)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn size_level(&self, instance_type: &str) -> u32 {
        size_level(instance_type)
    }

    async fn stop_non_essential(&self, account: &CloudAccount, limits: &RemediationLimits) -> Result<RemediationOutcome> {
        let instances = self.list_running_instances(account).await?;
        act_on(self, account, limits, instances, Action::Stop).await
    }

    async fn terminate_oversized(&self, account: &CloudAccount, limits: &RemediationLimits, max_level: u32) -> Result<RemediationOutcome> {
        let instances = self
            .list_running_instances(account)
            .await?
            .into_iter()
            .filter(|i| self.size_level(&i.instance_type) > max_level)
            .collect();
        act_on(self, account, limits, instances, Action::Terminate).await
    }

    async fn stop_idle(&self, account: &CloudAccount, limits: &RemediationLimits, idle_hours: f64) -> Result<RemediationOutcome> {
        let mut idle = Vec::new();
        for instance in self.list_running_instances(account).await? {
            if self.is_essential(&instance, &limits.essential_tag) {
                // checked again in act_on, but skip the metrics call
                idle.push(instance);
                continue;
            }
            match self.average_cpu(account, &instance.id, idle_hours).await {
                Ok(Some(avg)) if avg < IDLE_CPU_PERCENT => idle.push(instance),
                Ok(_) => {}
                Err(e) => warn!("No CPU metrics for {} on {}: {}", instance.id, account.id, e),
            }
        }
        act_on(self, account, limits, idle, Action::Stop).await
    }
}

/// Applies `action` to non-essential candidates until `limits.cap` actions
/// have succeeded. Individual failures are logged and do not count.
async fn act_on<P>(
    provider: &P,
    account: &CloudAccount,
    limits: &RemediationLimits,
    candidates: Vec<Instance>,
    action: Action,
) -> Result<RemediationOutcome>
where
    P: CloudProvider + ?Sized,
{
    let mut outcome = RemediationOutcome::default();

    for instance in candidates {
        if outcome.acted_on.len() >= limits.cap {
            break;
        }
        if provider.is_essential(&instance, &limits.essential_tag) {
            outcome.skipped_essential.push(instance.id);
            continue;
        }

        let result = match action {
            Action::Stop => provider.stop_instance(account, &instance.id).await,
            Action::Terminate => provider.terminate_instance(account, &instance.id).await,
        };
        match result {
            Ok(()) => {
                info!("{:?} {} ({}) on account {}", action, instance.id, instance.instance_type, account.id);
                outcome.acted_on.push(instance.id);
            }
            Err(e) => {
                error!("{:?} {} on account {} failed: {}", action, instance.id, account.id, e);
                outcome.failed.push(instance.id);
            }
        }
    }

    Ok(outcome)
}

/// Rough ordering of instance sizes from the type name.
pub fn size_level(instance_type: &str) -> u32 {
    let t = instance_type.to_ascii_lowercase();
    if t.contains("nano") || t.contains("micro") {
        1
    } else if t.contains("small") {
        2
    } else if t.contains("medium") {
        3
    } else if t.contains("8xlarge") {
        8
    } else if t.contains("4xlarge") {
        7
    } else if t.contains("2xlarge") {
        6
    } else if t.contains("xlarge") {
        5
    } else if t.contains("large") {
        4
    } else {
        9
    }
}

/// Provider implementations keyed by kind. Adding a cloud means registering here.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One gateway-backed provider per `[providers.<kind>]` table.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        let timeout = std::time::Duration::from_secs(config.enforcer.call_timeout_secs);
        for (kind, settings) in &config.providers {
            let kind: ProviderKind = kind.parse()?;
            registry.register(Arc::new(GatewayProvider::new(kind, settings, timeout)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: &ProviderKind) -> Result<Arc<dyn CloudProvider>, EnforceError> {
        self.providers
            .get(kind)
            .cloned()
            .ok_or_else(|| EnforceError::UnknownProvider(kind.clone()))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
