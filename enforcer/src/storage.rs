use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{
    ActivityLogEntry, CloudAccount, Policy, PolicyType, ProviderKind, Severity, Violation,
    ViolationStatus, Webhook, WebhookKind,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, SqlitePool};

const SCHEMA: &str = include_str!("../../sql/schema.sql");

const POLICY_COLUMNS: &str =
    "id, organization_id, name, description, type, enabled, rule_definition, config, created_at, updated_at";
const ACCOUNT_COLUMNS: &str =
    "id, organization_id, name, provider, account_id, subscription_id, project_id, tenancy_id, status, credentials, monthly_spend, connected_at";
const VIOLATION_COLUMNS: &str =
    "id, policy_id, resource_id, resource_type, provider, message, severity, status, created_at, remediated_at";

/// SQLite-backed repository for everything the enforcement loop reads and writes.
#[derive(Clone)]
pub struct Storage { pool: SqlitePool }

/// Raw rule material for one policy, as stored.
#[derive(Debug, Clone)]
pub struct StoredRule {
    pub policy_type: PolicyType,
    pub rule_definition: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ViolationCounts {
    pub pending: i64,
    pub remediated: i64,
    pub ignored: i64,
}

impl Storage {
    pub async fn new(path: &str) -> Result<Self> {
        let url = format!("sqlite://{}", path);
        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// Single-connection in-memory database; the connection is never recycled
    /// so the data lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        pool.execute(SCHEMA).await?;
        Ok(Self { pool })
    }

    // ---- policies ----

    pub async fn find_enabled_policies(&self) -> Result<Vec<Policy>> {
        let sql = format!(
            "SELECT {} FROM policies WHERE enabled = 1 ORDER BY created_at, rowid",
            POLICY_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(policy_from_row).collect()
    }

    pub async fn find_policy(&self, id: &str) -> Result<Option<Policy>> {
        let sql = format!("SELECT {} FROM policies WHERE id = ?", POLICY_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    pub async fn find_rule(&self, policy_id: &str) -> Result<Option<StoredRule>> {
        let row = sqlx::query("SELECT type, rule_definition, config FROM policies WHERE id = ?")
            .bind(policy_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let policy_type: String = row.try_get("type")?;
                let config: String = row.try_get("config")?;
                Ok(Some(StoredRule {
                    policy_type: policy_type.parse()?,
                    rule_definition: row.try_get("rule_definition")?,
                    config: parse_json(&config)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn insert_policy(&self, policy: &Policy) -> Result<()> {
        sqlx::query(
            "INSERT INTO policies(id, organization_id, name, description, type, enabled, rule_definition, config, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&policy.id)
        .bind(&policy.organization_id)
        .bind(&policy.name)
        .bind(&policy.description)
        .bind(policy.policy_type.as_str())
        .bind(policy.enabled)
        .bind(&policy.rule_definition)
        .bind(policy.config.to_string())
        .bind(policy.created_at.to_rfc3339())
        .bind(policy.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn update_policy_rule(&self, id: &str, rule_definition: &str) -> Result<()> {
        sqlx::query("UPDATE policies SET rule_definition = ?, updated_at = ? WHERE id = ?")
            .bind(rule_definition)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- cloud accounts ----

    pub async fn find_connected_accounts(&self) -> Result<Vec<CloudAccount>> {
        let sql = format!(
            "SELECT {} FROM cloud_accounts WHERE status = 'connected' ORDER BY rowid",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn find_account(&self, id: &str) -> Result<Option<CloudAccount>> {
        let sql = format!("SELECT {} FROM cloud_accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn update_account_spend(&self, id: &str, monthly_spend: f64) -> Result<()> {
        sqlx::query("UPDATE cloud_accounts SET monthly_spend = ? WHERE id = ?")
            .bind(monthly_spend)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_account(&self, account: &CloudAccount) -> Result<()> {
        sqlx::query(
            "INSERT INTO cloud_accounts(id, organization_id, name, provider, account_id, subscription_id, project_id, tenancy_id, status, credentials, monthly_spend, connected_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(&account.organization_id)
        .bind(&account.name)
        .bind(account.provider.as_str())
        .bind(&account.account_id)
        .bind(&account.subscription_id)
        .bind(&account.project_id)
        .bind(&account.tenancy_id)
        .bind(&account.status)
        .bind(&account.credentials)
        .bind(account.monthly_spend)
        .bind(account.connected_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- violations ----

    pub async fn find_pending_violation(&self, policy_id: &str) -> Result<Option<Violation>> {
        let sql = format!(
            "SELECT {} FROM violations WHERE policy_id = ? AND status = 'pending'",
            VIOLATION_COLUMNS
        );
        let row = sqlx::query(&sql).bind(policy_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(violation_from_row).transpose()
    }

    /// Inserts the violation unless it would be a second pending row for the
    /// same policy. Returns whether a row was written.
    pub async fn create_violation(&self, v: &Violation) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO violations(id, policy_id, resource_id, resource_type, provider, message, severity, status, created_at, remediated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&v.id)
        .bind(&v.policy_id)
        .bind(&v.resource_id)
        .bind(&v.resource_type)
        .bind(v.provider.as_str())
        .bind(&v.message)
        .bind(v.severity.as_str())
        .bind(v.status.as_str())
        .bind(v.created_at.to_rfc3339())
        .bind(v.remediated_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// pending -> remediated. Returns false when the violation is missing or already terminal.
    pub async fn remediate_violation(&self, id: &str, remediated_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE violations SET status = 'remediated', remediated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(remediated_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// pending -> ignored. Returns false when the violation is missing or already terminal.
    pub async fn ignore_violation(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE violations SET status = 'ignored' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_violation(&self, id: &str) -> Result<Option<Violation>> {
        let sql = format!("SELECT {} FROM violations WHERE id = ?", VIOLATION_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(violation_from_row).transpose()
    }

    pub async fn list_violations(&self, limit: i64) -> Result<Vec<Violation>> {
        let sql = format!(
            "SELECT {} FROM violations ORDER BY created_at DESC, rowid DESC LIMIT ?",
            VIOLATION_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(violation_from_row).collect()
    }

    pub async fn list_violations_for_policy(&self, policy_id: &str) -> Result<Vec<Violation>> {
        let sql = format!(
            "SELECT {} FROM violations WHERE policy_id = ? ORDER BY rowid",
            VIOLATION_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(policy_id).fetch_all(&self.pool).await?;
        rows.iter().map(violation_from_row).collect()
    }

    pub async fn violation_counts(&self) -> Result<ViolationCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM violations GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ViolationCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "pending" => counts.pending = n,
                "remediated" => counts.remediated = n,
                "ignored" => counts.ignored = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    // ---- activity log ----

    pub async fn create_activity_log(&self, entry: &ActivityLogEntry) -> Result<()> {
        sqlx::query("INSERT INTO activity_logs(id, organization_id, type, message, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(&entry.id)
            .bind(&entry.organization_id)
            .bind(&entry.r#type)
            .bind(&entry.message)
            .bind(entry.metadata.to_string())
            .bind(entry.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_activity(&self, limit: i64) -> Result<Vec<ActivityLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, organization_id, type, message, metadata, created_at FROM activity_logs ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let metadata: String = row.try_get("metadata")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(ActivityLogEntry {
                    id: row.try_get("id")?,
                    organization_id: row.try_get("organization_id")?,
                    r#type: row.try_get("type")?,
                    message: row.try_get("message")?,
                    metadata: parse_json(&metadata)?,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    // ---- webhooks ----

    pub async fn find_enabled_webhooks(&self, organization_id: &str) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, (String, String, String, String, bool)>(
            "SELECT id, organization_id, type, url, enabled FROM webhooks WHERE organization_id = ? AND enabled = 1 ORDER BY rowid",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, organization_id, kind, url, enabled)| Webhook {
                id,
                organization_id,
                kind: kind.parse().unwrap_or(WebhookKind::Generic),
                url,
                enabled,
            })
            .collect())
    }

    pub async fn insert_webhook(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query("INSERT INTO webhooks(id, organization_id, type, url, enabled) VALUES (?, ?, ?, ?, ?)")
            .bind(&webhook.id)
            .bind(&webhook.organization_id)
            .bind(webhook.kind.as_str())
            .bind(&webhook.url)
            .bind(webhook.enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_json(s: &str) -> Result<serde_json::Value> {
    if s.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    Ok(serde_json::from_str(s)?)
}

fn policy_from_row(row: &SqliteRow) -> Result<Policy> {
    let policy_type: String = row.try_get("type")?;
    let config: String = row.try_get("config")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Policy {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        policy_type: policy_type.parse()?,
        enabled: row.try_get("enabled")?,
        rule_definition: row.try_get("rule_definition")?,
        config: parse_json(&config)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<CloudAccount> {
    let provider: String = row.try_get("provider")?;

    Ok(CloudAccount {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        provider: provider.parse::<ProviderKind>()?,
        account_id: row.try_get("account_id")?,
        subscription_id: row.try_get("subscription_id")?,
        project_id: row.try_get("project_id")?,
        tenancy_id: row.try_get("tenancy_id")?,
        status: row.try_get("status")?,
        credentials: row.try_get("credentials")?,
        monthly_spend: row.try_get("monthly_spend")?,
        connected_at: parse_opt_ts(row.try_get("connected_at")?)?,
    })
}

fn violation_from_row(row: &SqliteRow) -> Result<Violation> {
    let provider: String = row.try_get("provider")?;
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Violation {
        id: row.try_get("id")?,
        policy_id: row.try_get("policy_id")?,
        resource_id: row.try_get("resource_id")?,
        resource_type: row.try_get("resource_type")?,
        provider: provider.parse::<ProviderKind>()?,
        message: row.try_get("message")?,
        severity: severity.parse::<Severity>()?,
        status: status.parse::<ViolationStatus>()?,
        created_at: parse_ts(&created_at)?,
        remediated_at: parse_opt_ts(row.try_get("remediated_at")?)?,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn policies_round_trip_and_keep_insertion_order() {
        let storage = Storage::in_memory().await.unwrap();
        let mut disabled = policy("p0", "org", PolicyType::RequireTags, json!({}));
        disabled.enabled = false;
        storage.insert_policy(&disabled).await.unwrap();
        storage
            .insert_policy(&policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 100})))
            .await
            .unwrap();
        storage
            .insert_policy(&policy("p2", "org", PolicyType::AutoStopIdle, json!({"idleHours": 12})))
            .await
            .unwrap();

        let enabled = storage.find_enabled_policies().await.unwrap();
        let ids: Vec<_> = enabled.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert_eq!(enabled[0].policy_type, PolicyType::MaxSpend);
        assert_eq!(enabled[0].config_f64("maxAmount"), Some(100.0));

        let rule = storage.find_rule("p2").await.unwrap().unwrap();
        assert_eq!(rule.policy_type, PolicyType::AutoStopIdle);
        assert!(rule.rule_definition.is_empty());
        assert!(storage.find_rule("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_connected_accounts_are_listed() {
        let storage = Storage::in_memory().await.unwrap();
        storage.insert_account(&account("a1", "org", ProviderKind::Aws)).await.unwrap();
        let mut off = account("a2", "org", ProviderKind::Gcp);
        off.status = "disconnected".to_string();
        storage.insert_account(&off).await.unwrap();

        let accounts = storage.find_connected_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "a1");

        storage.update_account_spend("a1", 42.5).await.unwrap();
        let a1 = storage.find_account("a1").await.unwrap().unwrap();
        assert_eq!(a1.monthly_spend, 42.5);
    }

    #[tokio::test]
    async fn second_pending_violation_for_policy_is_rejected() {
        let storage = Storage::in_memory().await.unwrap();
        assert!(storage.create_violation(&pending_violation("p1")).await.unwrap());
        assert!(!storage.create_violation(&pending_violation("p1")).await.unwrap());
        assert!(storage.create_violation(&pending_violation("p2")).await.unwrap());

        let first = storage.find_pending_violation("p1").await.unwrap().unwrap();
        assert!(storage.remediate_violation(&first.id, Utc::now()).await.unwrap());
        assert!(!storage.remediate_violation(&first.id, Utc::now()).await.unwrap());

        // once the earlier one is terminal a new pending row is allowed
        assert!(storage.find_pending_violation("p1").await.unwrap().is_none());
        assert!(storage.create_violation(&pending_violation("p1")).await.unwrap());
        assert_eq!(storage.list_violations_for_policy("p1").await.unwrap().len(), 2);

        let counts = storage.violation_counts().await.unwrap();
        assert_eq!(counts, ViolationCounts { pending: 2, remediated: 1, ignored: 0 });
    }

    #[tokio::test]
    async fn ignore_only_moves_pending_violations() {
        let storage = Storage::in_memory().await.unwrap();
        let v = pending_violation("p1");
        storage.create_violation(&v).await.unwrap();

        assert!(storage.ignore_violation(&v.id).await.unwrap());
        assert!(!storage.ignore_violation(&v.id).await.unwrap());
        assert!(!storage.ignore_violation("missing").await.unwrap());

        let stored = storage.get_violation(&v.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ViolationStatus::Ignored);
    }

    #[tokio::test]
    async fn webhooks_filtered_by_org_and_enabled() {
        let storage = Storage::in_memory().await.unwrap();
        for (id, org, kind, enabled) in [
            ("w1", "org", WebhookKind::Slack, true),
            ("w2", "org", WebhookKind::Teams, false),
            ("w3", "other", WebhookKind::Discord, true),
        ] {
            storage
                .insert_webhook(&Webhook {
                    id: id.to_string(),
                    organization_id: org.to_string(),
                    kind,
                    url: format!("http://example.invalid/{}", id),
                    enabled,
                })
                .await
                .unwrap();
        }

        let hooks = storage.find_enabled_webhooks("org").await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].id, "w1");
        assert_eq!(hooks[0].kind, WebhookKind::Slack);
    }
}
