use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{ActivityLogEntry, CloudAccount, Policy, Violation, ViolationStatus};
use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::storage::Storage;

pub const RESOURCE_TYPE_ACCOUNT: &str = "cloud_account";

/// Owns violation dedup and the pending -> remediated transition.
#[derive(Clone)]
pub struct ViolationLedger {
    storage: Storage,
}

impl ViolationLedger {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Creates a pending violation unless the policy already has one.
    /// The insert is guarded by the unique pending index, so two workers
    /// racing on the same policy still produce a single row.
    pub async fn record_if_new(
        &self,
        policy: &Policy,
        account: &CloudAccount,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(bool, Violation)> {
        if let Some(existing) = self.storage.find_pending_violation(&policy.id).await? {
            return Ok((false, existing));
        }

        let violation = Violation {
            id: Uuid::new_v4().to_string(),
            policy_id: policy.id.clone(),
            resource_id: account.id.clone(),
            resource_type: RESOURCE_TYPE_ACCOUNT.to_string(),
            provider: account.provider.clone(),
            message: message.to_string(),
            severity: policy.violation_severity(),
            status: ViolationStatus::Pending,
            created_at: now,
            remediated_at: None,
        };

        if self.storage.create_violation(&violation).await? {
            info!("Violation {} recorded for policy {}", violation.id, policy.id);
            self.log(
                &policy.organization_id,
                "policy_violation",
                format!("Policy '{}' violation: {}", policy.name, message),
                &policy.id,
                &violation.id,
                now,
            )
            .await;
            return Ok((true, violation));
        }

        // lost the race to another worker
        match self.storage.find_pending_violation(&policy.id).await? {
            Some(existing) => Ok((false, existing)),
            None => anyhow::bail!("pending violation for policy {} vanished during insert", policy.id),
        }
    }

    pub async fn mark_remediated(&self, policy: &Policy, violation: &mut Violation, now: DateTime<Utc>) -> Result<()> {
        if violation.status.is_terminal() {
            anyhow::bail!("violation {} is already {}", violation.id, violation.status);
        }
        if !self.storage.remediate_violation(&violation.id, now).await? {
            // ignored (or otherwise closed) while the remediation was running
            if let Some(stored) = self.storage.get_violation(&violation.id).await? {
                violation.status = stored.status;
                violation.remediated_at = stored.remediated_at;
            }
            anyhow::bail!("violation {} is no longer pending ({})", violation.id, violation.status);
        }
        violation.status = ViolationStatus::Remediated;
        violation.remediated_at = Some(now);

        self.log(
            &policy.organization_id,
            "remediation",
            format!("Policy '{}' violation remediated", policy.name),
            &policy.id,
            &violation.id,
            now,
        )
        .await;
        Ok(())
    }

    /// External pending -> ignored transition.
    pub async fn ignore(&self, violation_id: &str) -> Result<bool> {
        let Some(violation) = self.storage.get_violation(violation_id).await? else {
            return Ok(false);
        };
        if !self.storage.ignore_violation(violation_id).await? {
            return Ok(false);
        }
        if let Some(policy) = self.storage.find_policy(&violation.policy_id).await? {
            self.log(
                &policy.organization_id,
                "violation_ignored",
                format!("Policy '{}' violation ignored", policy.name),
                &policy.id,
                violation_id,
                Utc::now(),
            )
            .await;
        }
        Ok(true)
    }

    /// Audit writes never fail the caller.
    async fn log(&self, organization_id: &str, kind: &str, message: String, policy_id: &str, violation_id: &str, now: DateTime<Utc>) {
        let entry = ActivityLogEntry {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            r#type: kind.to_string(),
            message,
            metadata: json!({ "policyId": policy_id, "violationId": violation_id }),
            created_at: now,
        };
        if let Err(e) = self.storage.create_activity_log(&entry).await {
            warn!("Failed to append {} activity entry: {}", kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fixtures::{account, policy};
    use common::{PolicyType, ProviderKind, Severity};

    async fn setup() -> (Storage, ViolationLedger, Policy, CloudAccount) {
        let storage = Storage::in_memory().await.unwrap();
        let p = policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 1}));
        storage.insert_policy(&p).await.unwrap();
        let a = account("a1", "org", ProviderKind::Azure);
        (storage.clone(), ViolationLedger::new(storage), p, a)
    }

    #[tokio::test]
    async fn repeated_breaches_keep_one_pending_violation() {
        let (storage, ledger, p, a) = setup().await;

        let (created, first) = ledger.record_if_new(&p, &a, "over", Utc::now()).await.unwrap();
        assert!(created);
        assert_eq!(first.severity, Severity::High);
        assert_eq!(first.provider, ProviderKind::Azure);
        assert_eq!(first.resource_type, RESOURCE_TYPE_ACCOUNT);

        for _ in 0..3 {
            let (created, again) = ledger.record_if_new(&p, &a, "still over", Utc::now()).await.unwrap();
            assert!(!created);
            assert_eq!(again.id, first.id);
        }

        assert_eq!(storage.list_violations_for_policy("p1").await.unwrap().len(), 1);
        let activity = storage.list_activity(10).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].r#type, "policy_violation");
        assert_eq!(activity[0].metadata["violationId"], json!(first.id));
    }

    #[tokio::test]
    async fn concurrent_records_create_a_single_row() {
        let (storage, ledger, p, a) = setup().await;

        let attempts = (0..8).map(|_| ledger.record_if_new(&p, &a, "over", Utc::now()));
        let results = futures::future::join_all(attempts).await;
        let created = results.into_iter().filter(|r| r.as_ref().unwrap().0).count();

        assert_eq!(created, 1);
        assert_eq!(storage.list_violations_for_policy("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remediated_violation_allows_a_fresh_one() {
        let (storage, ledger, p, a) = setup().await;
        let (_, mut v) = ledger.record_if_new(&p, &a, "over", Utc::now()).await.unwrap();

        ledger.mark_remediated(&p, &mut v, Utc::now()).await.unwrap();
        let stored = storage.get_violation(&v.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ViolationStatus::Remediated);
        assert!(stored.remediated_at.is_some());
        assert!(ledger.mark_remediated(&p, &mut v, Utc::now()).await.is_err());

        let (created, next) = ledger.record_if_new(&p, &a, "over again", Utc::now()).await.unwrap();
        assert!(created);
        assert_ne!(next.id, v.id);
    }

    #[tokio::test]
    async fn ignore_during_remediation_wins() {
        let (storage, ledger, p, a) = setup().await;
        let (_, mut v) = ledger.record_if_new(&p, &a, "over", Utc::now()).await.unwrap();

        // operator ignores while the caller still holds the pending copy
        assert!(ledger.ignore(&v.id).await.unwrap());
        assert!(ledger.mark_remediated(&p, &mut v, Utc::now()).await.is_err());

        let stored = storage.get_violation(&v.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ViolationStatus::Ignored);
        assert!(stored.remediated_at.is_none());
        assert_eq!(v.status, ViolationStatus::Ignored);

        let kinds: Vec<_> = storage.list_activity(10).await.unwrap().into_iter().map(|e| e.r#type).collect();
        assert!(!kinds.contains(&"remediation".to_string()));
    }

    #[tokio::test]
    async fn ignore_is_logged_and_terminal() {
        let (storage, ledger, p, a) = setup().await;
        let (_, v) = ledger.record_if_new(&p, &a, "over", Utc::now()).await.unwrap();

        assert!(ledger.ignore(&v.id).await.unwrap());
        assert!(!ledger.ignore(&v.id).await.unwrap());
        assert!(!ledger.ignore("nope").await.unwrap());

        let kinds: Vec<_> = storage
            .list_activity(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.r#type)
            .collect();
        assert!(kinds.contains(&"violation_ignored".to_string()));
    }
}
