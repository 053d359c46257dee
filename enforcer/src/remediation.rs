use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CloudAccount, EnforcerConfig, Policy, PolicyType, Violation};
use log::{error, info, warn};
use serde::Serialize;

use crate::error::EnforceError;
use crate::ledger::ViolationLedger;
use crate::providers::{size_level, ProviderRegistry, RemediationLimits, RemediationOutcome};

const DEFAULT_MAX_SIZE_LEVEL: u32 = 4;
const DEFAULT_IDLE_HOURS: f64 = 24.0;

/// Corrective action chosen for a policy type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationPlan {
    StopNonEssential,
    TerminateOversized { max_level: u32 },
    StopIdle { idle_hours: f64 },
    /// No automatic action; the violation stays pending for a human.
    NotifyOnly,
}

impl RemediationPlan {
    pub fn for_policy(policy: &Policy) -> Self {
        match policy.policy_type {
            PolicyType::MaxSpend => RemediationPlan::StopNonEssential,
            PolicyType::BlockInstanceType => {
                let max_level = policy
                    .config_f64("maxSizeLevel")
                    .map(|l| l.max(0.0) as u32)
                    .or_else(|| policy.config_str("maxSize").map(size_level))
                    .unwrap_or(DEFAULT_MAX_SIZE_LEVEL);
                RemediationPlan::TerminateOversized { max_level }
            }
            PolicyType::AutoStopIdle => RemediationPlan::StopIdle {
                idle_hours: policy
                    .config_f64("idleHours")
                    .filter(|h| *h > 0.0)
                    .unwrap_or(DEFAULT_IDLE_HOURS),
            },
            PolicyType::RequireTags | PolicyType::Other(_) => RemediationPlan::NotifyOnly,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub plan: RemediationPlan,
    pub outcome: Option<RemediationOutcome>,
    pub remediated: bool,
}

/// Runs the corrective action for a new violation and marks it remediated
/// when the action succeeds. Failures leave the violation pending; there is
/// no retry.
#[derive(Clone)]
pub struct RemediationDispatcher {
    registry: ProviderRegistry,
    ledger: ViolationLedger,
    limits: RemediationLimits,
    timeout: Duration,
}

impl RemediationDispatcher {
    pub fn new(registry: ProviderRegistry, ledger: ViolationLedger, config: &EnforcerConfig) -> Self {
        Self {
            registry,
            ledger,
            limits: RemediationLimits {
                cap: config.remediation_cap,
                essential_tag: config.essential_tag.clone(),
            },
            timeout: Duration::from_secs(config.remediation_timeout_secs),
        }
    }

    pub async fn remediate(
        &self,
        policy: &Policy,
        account: &CloudAccount,
        violation: &mut Violation,
        now: DateTime<Utc>,
    ) -> Result<RemediationReport, EnforceError> {
        let plan = RemediationPlan::for_policy(policy);
        if plan == RemediationPlan::NotifyOnly {
            info!("Policy {} ({}) has no automatic remediation", policy.id, policy.policy_type);
            return Ok(RemediationReport { plan, outcome: None, remediated: false });
        }

        let outcome = match self.run(&plan, policy, account).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{}; violation {} stays pending", e, violation.id);
                return Err(e);
            }
        };

        if outcome.all_failed() {
            error!(
                "Every remediation action for policy {} failed; violation {} stays pending",
                policy.id, violation.id
            );
            return Err(EnforceError::Remediation {
                policy: policy.id.clone(),
                source: anyhow::anyhow!("all {} attempted actions failed", outcome.failed.len()),
            });
        }
        if outcome.acted_on.is_empty() {
            warn!("Policy {} remediation found nothing eligible on account {}", policy.id, account.id);
        }

        self.ledger
            .mark_remediated(policy, violation, now)
            .await
            .map_err(|source| EnforceError::Remediation { policy: policy.id.clone(), source })?;

        info!(
            "Remediated violation {} for policy {}: {} acted on, {} essential skipped",
            violation.id,
            policy.id,
            outcome.acted_on.len(),
            outcome.skipped_essential.len()
        );
        Ok(RemediationReport { plan, outcome: Some(outcome), remediated: true })
    }

    async fn run(
        &self,
        plan: &RemediationPlan,
        policy: &Policy,
        account: &CloudAccount,
    ) -> Result<RemediationOutcome, EnforceError> {
        let provider = self.registry.get(&account.provider)?;
        let limits = &self.limits;

        let action = async {
            match *plan {
                RemediationPlan::StopNonEssential => provider.stop_non_essential(account, limits).await,
                RemediationPlan::TerminateOversized { max_level } => {
                    provider.terminate_oversized(account, limits, max_level).await
                }
                RemediationPlan::StopIdle { idle_hours } => provider.stop_idle(account, limits, idle_hours).await,
                RemediationPlan::NotifyOnly => Ok(RemediationOutcome::default()),
            }
        };

        match tokio::time::timeout(self.timeout, action).await {
            Ok(result) => result.map_err(|source| EnforceError::Remediation { policy: policy.id.clone(), source }),
            Err(_) => Err(EnforceError::Timeout {
                operation: "remediation",
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::tests::FakeProvider;
    use crate::storage::fixtures::{account, policy};
    use crate::storage::Storage;
    use common::{ProviderKind, ViolationStatus};
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        storage: Storage,
        ledger: ViolationLedger,
        provider: Arc<FakeProvider>,
        dispatcher: RemediationDispatcher,
    }

    async fn harness(provider: FakeProvider) -> Harness {
        let storage = Storage::in_memory().await.unwrap();
        let ledger = ViolationLedger::new(storage.clone());
        let provider = Arc::new(provider);
        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let dispatcher = RemediationDispatcher::new(registry, ledger.clone(), &EnforcerConfig::default());
        Harness { storage, ledger, provider, dispatcher }
    }

    async fn violation_for(h: &Harness, p: &Policy, a: &CloudAccount) -> Violation {
        h.storage.insert_policy(p).await.unwrap();
        h.ledger.record_if_new(p, a, "breach", Utc::now()).await.unwrap().1
    }

    #[test]
    fn plans_follow_policy_type_and_config() {
        let spend = policy("p", "o", PolicyType::MaxSpend, json!({}));
        assert_eq!(RemediationPlan::for_policy(&spend), RemediationPlan::StopNonEssential);

        let sized = policy("p", "o", PolicyType::BlockInstanceType, json!({"maxSize": "medium"}));
        assert_eq!(RemediationPlan::for_policy(&sized), RemediationPlan::TerminateOversized { max_level: 3 });

        let level = policy("p", "o", PolicyType::BlockInstanceType, json!({"maxSizeLevel": 6}));
        assert_eq!(RemediationPlan::for_policy(&level), RemediationPlan::TerminateOversized { max_level: 6 });

        let idle = policy("p", "o", PolicyType::AutoStopIdle, json!({}));
        assert_eq!(RemediationPlan::for_policy(&idle), RemediationPlan::StopIdle { idle_hours: 24.0 });

        let tags = policy("p", "o", PolicyType::RequireTags, json!({"requiredTags": ["team"]}));
        assert_eq!(RemediationPlan::for_policy(&tags), RemediationPlan::NotifyOnly);
    }

    #[tokio::test]
    async fn successful_action_marks_violation_remediated() {
        let h = harness(FakeProvider::with_instances(7, "t3.large")).await;
        let p = policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 10}));
        let a = account("a1", "org", ProviderKind::Aws);
        let mut v = violation_for(&h, &p, &a).await;

        let report = h.dispatcher.remediate(&p, &a, &mut v, Utc::now()).await.unwrap();

        assert!(report.remediated);
        assert_eq!(h.provider.stopped().len(), 5);
        let stored = h.storage.get_violation(&v.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ViolationStatus::Remediated);
    }

    #[tokio::test]
    async fn listing_failure_leaves_violation_pending() {
        let h = harness(FakeProvider { listing_fails: true, ..Default::default() }).await;
        let p = policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 10}));
        let a = account("a1", "org", ProviderKind::Aws);
        let mut v = violation_for(&h, &p, &a).await;

        let err = h.dispatcher.remediate(&p, &a, &mut v, Utc::now()).await.unwrap_err();

        assert!(matches!(err, EnforceError::Remediation { .. }));
        let stored = h.storage.get_violation(&v.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ViolationStatus::Pending);
    }

    #[tokio::test]
    async fn all_actions_failing_is_an_error() {
        let mut provider = FakeProvider::with_instances(2, "t3.large");
        provider.failing = ["i-0".to_string(), "i-1".to_string()].into_iter().collect();
        let h = harness(provider).await;
        let p = policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 10}));
        let a = account("a1", "org", ProviderKind::Aws);
        let mut v = violation_for(&h, &p, &a).await;

        assert!(h.dispatcher.remediate(&p, &a, &mut v, Utc::now()).await.is_err());
        assert_eq!(v.status, ViolationStatus::Pending);
    }

    #[tokio::test]
    async fn unregistered_provider_is_reported() {
        let h = harness(FakeProvider::default()).await;
        let p = policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 10}));
        let a = account("a1", "org", ProviderKind::Oci);
        let mut v = violation_for(&h, &p, &a).await;

        let err = h.dispatcher.remediate(&p, &a, &mut v, Utc::now()).await.unwrap_err();
        assert!(matches!(err, EnforceError::UnknownProvider(ProviderKind::Oci)));
    }

    #[tokio::test]
    async fn notify_only_policies_stay_pending() {
        let h = harness(FakeProvider::with_instances(3, "t3.large")).await;
        let p = policy("p1", "org", PolicyType::RequireTags, json!({"requiredTags": ["team"]}));
        let a = account("a1", "org", ProviderKind::Aws);
        let mut v = violation_for(&h, &p, &a).await;

        let report = h.dispatcher.remediate(&p, &a, &mut v, Utc::now()).await.unwrap();

        assert!(!report.remediated);
        assert!(h.provider.stopped().is_empty());
        assert_eq!(v.status, ViolationStatus::Pending);
    }
}
