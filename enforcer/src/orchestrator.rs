//! Periodic enforcement loop: for every connected account, fetch billing,
//! evaluate the organization's enabled policies and act on new violations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CloudAccount, EnforcerConfig, Policy, ProviderKind};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use crate::error::EnforceError;
use crate::ledger::ViolationLedger;
use crate::notify::NotificationFanout;
use crate::providers::{BillingSnapshot, ProviderRegistry};
use crate::remediation::RemediationDispatcher;
use crate::rules::RuleEvaluator;
use crate::storage::Storage;

/// Counters for one pass over all connected accounts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub accounts_processed: usize,
    pub accounts_skipped: usize,
    pub policies_evaluated: usize,
    pub evaluation_failures: usize,
    pub violations_created: usize,
    pub remediations_succeeded: usize,
    pub remediations_failed: usize,
    pub notifications_delivered: usize,
    pub notifications_failed: usize,
}

impl TickSummary {
    fn absorb(&mut self, other: TickSummary) {
        self.accounts_processed += other.accounts_processed;
        self.accounts_skipped += other.accounts_skipped;
        self.policies_evaluated += other.policies_evaluated;
        self.evaluation_failures += other.evaluation_failures;
        self.violations_created += other.violations_created;
        self.remediations_succeeded += other.remediations_succeeded;
        self.remediations_failed += other.remediations_failed;
        self.notifications_delivered += other.notifications_delivered;
        self.notifications_failed += other.notifications_failed;
    }
}

pub struct Enforcer {
    storage: Storage,
    evaluator: Arc<RuleEvaluator>,
    registry: ProviderRegistry,
    ledger: ViolationLedger,
    remediation: RemediationDispatcher,
    notifier: NotificationFanout,
    config: EnforcerConfig,
    last_tick: RwLock<Option<TickSummary>>,
    ticks: RwLock<u64>,
}

impl Enforcer {
    pub fn new(
        storage: Storage,
        evaluator: Arc<RuleEvaluator>,
        registry: ProviderRegistry,
        notifier: NotificationFanout,
        config: EnforcerConfig,
    ) -> Self {
        let ledger = ViolationLedger::new(storage.clone());
        let remediation = RemediationDispatcher::new(registry.clone(), ledger.clone(), &config);
        Self {
            storage,
            evaluator,
            registry,
            ledger,
            remediation,
            notifier,
            config,
            last_tick: RwLock::new(None),
            ticks: RwLock::new(0),
        }
    }

    pub fn ledger(&self) -> &ViolationLedger {
        &self.ledger
    }

    pub fn evaluator(&self) -> &Arc<RuleEvaluator> {
        &self.evaluator
    }

    pub fn provider_kinds(&self) -> Vec<ProviderKind> {
        self.registry.kinds()
    }

    pub async fn last_tick(&self) -> Option<TickSummary> {
        self.last_tick.read().await.clone()
    }

    pub async fn ticks_completed(&self) -> u64 {
        *self.ticks.read().await
    }

    /// One full pass. Only a failure to list policies or accounts aborts it;
    /// any per-account or per-policy failure is logged and isolated.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickSummary, EnforceError> {
        let policies = self
            .storage
            .find_enabled_policies()
            .await
            .map_err(EnforceError::Repository)?;
        let accounts = self
            .storage
            .find_connected_accounts()
            .await
            .map_err(EnforceError::Repository)?;

        debug!("Tick over {} account(s) and {} enabled policies", accounts.len(), policies.len());

        let policies = &policies;
        let per_account: Vec<TickSummary> = stream::iter(accounts)
            .map(|account| async move { self.process_account(account, policies, now).await })
            .buffer_unordered(self.config.max_concurrent_accounts.max(1))
            .collect()
            .await;

        let mut summary = TickSummary {
            started_at: Some(now),
            ..Default::default()
        };
        for part in per_account {
            summary.absorb(part);
        }
        summary.finished_at = Some(Utc::now());
        Ok(summary)
    }

    async fn process_account(&self, mut account: CloudAccount, policies: &[Policy], now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        let snapshot = match self.fetch_billing(&account).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Skipping account {} this tick: {}", account.id, e);
                summary.accounts_skipped = 1;
                return summary;
            }
        };
        summary.accounts_processed = 1;

        account.monthly_spend = snapshot.monthly_spend;
        if let Err(e) = self.storage.update_account_spend(&account.id, snapshot.monthly_spend).await {
            warn!("Could not persist spend for account {}: {}", account.id, e);
        }

        let input = input_document(&account, &snapshot);

        for policy in policies.iter().filter(|p| p.organization_id == account.organization_id) {
            summary.policies_evaluated += 1;
            let evaluation = self.evaluator.evaluate(policy, &input).await;
            if evaluation.failure.is_some() {
                summary.evaluation_failures += 1;
            }
            if evaluation.violated {
                self.handle_violation(policy, &account, &evaluation.message_or_default(), now, &mut summary)
                    .await;
            }
        }
        summary
    }

    async fn fetch_billing(&self, account: &CloudAccount) -> Result<BillingSnapshot, EnforceError> {
        let provider = self.registry.get(&account.provider)?;
        let secs = self.config.call_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), provider.fetch_billing(account)).await {
            Ok(result) => result.map_err(|source| EnforceError::Collector {
                account: account.id.clone(),
                source,
            }),
            Err(_) => Err(EnforceError::Timeout { operation: "billing fetch", secs }),
        }
    }

    async fn handle_violation(
        &self,
        policy: &Policy,
        account: &CloudAccount,
        message: &str,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) {
        let (created, mut violation) = match self.ledger.record_if_new(policy, account, message, now).await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!("Could not record violation for policy {}: {}", policy.id, e);
                return;
            }
        };
        if !created {
            debug!("Policy {} already has pending violation {}", policy.id, violation.id);
            return;
        }

        info!("Policy violation detected: {} on account {}", policy.name, account.id);
        summary.violations_created += 1;

        match self.remediation.remediate(policy, account, &mut violation, now).await {
            Ok(report) if report.remediated => summary.remediations_succeeded += 1,
            Ok(_) => {}
            Err(_) => summary.remediations_failed += 1,
        }

        match self.notifier.notify(&policy.organization_id, policy, &violation).await {
            Ok(report) => {
                summary.notifications_delivered += report.delivered.len();
                summary.notifications_failed += report.failed.len();
            }
            Err(e) => error!("Could not load webhooks for organization {}: {}", policy.organization_id, e),
        }
    }

    async fn record(&self, summary: TickSummary) {
        info!(
            "Tick finished: {} account(s) processed, {} skipped, {} new violation(s)",
            summary.accounts_processed, summary.accounts_skipped, summary.violations_created
        );
        *self.last_tick.write().await = Some(summary);
        *self.ticks.write().await += 1;
    }

    /// Runs one tick immediately, then one per interval until `shutdown`
    /// flips to true. Ticks never overlap: a tick that overruns the interval
    /// swallows the missed ones. A tick in progress is allowed to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Enforcement loop started (every {}s)", self.config.interval_secs);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_tick(Utc::now()).await {
                        Ok(summary) => self.record(summary).await,
                        Err(e) => error!("Tick aborted: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Enforcement loop stopped");
    }

    /// Single tick for `--once` runs.
    pub async fn run_once(&self) -> Result<TickSummary, EnforceError> {
        let summary = self.run_tick(Utc::now()).await?;
        self.record(summary.clone()).await;
        Ok(summary)
    }
}

/// Rule input: the account identity fields plus every billing field.
pub fn input_document(account: &CloudAccount, snapshot: &BillingSnapshot) -> Value {
    let mut input = Map::new();
    input.insert("account_id".to_string(), json!(account.account_id));
    input.insert("subscription_id".to_string(), json!(account.subscription_id));
    input.insert("project_id".to_string(), json!(account.project_id));
    input.insert("tenancy_id".to_string(), json!(account.tenancy_id));
    input.insert("monthly_spend".to_string(), json!(snapshot.monthly_spend));
    input.insert("provider_type".to_string(), json!(account.provider.as_str()));

    if let Ok(Value::Object(billing)) = serde_json::to_value(snapshot) {
        input.extend(billing);
    }
    Value::Object(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::tests::FakeProvider;
    use crate::storage::fixtures::{account, policy};
    use common::{FailureMode, PolicyType, ViolationStatus};

    /// Rules come from the policy rows themselves (generated from type and config).
    async fn enforcer(storage: &Storage, provider: FakeProvider) -> Enforcer {
        enforcer_with(storage, Arc::new(provider), EnforcerConfig::default())
    }

    fn enforcer_with(storage: &Storage, provider: Arc<FakeProvider>, config: EnforcerConfig) -> Enforcer {
        let evaluator = Arc::new(RuleEvaluator::new(Arc::new(storage.clone()), FailureMode::Open));
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let notifier = NotificationFanout::new(storage.clone(), Duration::from_secs(2)).unwrap();
        Enforcer::new(storage.clone(), evaluator, registry, notifier, config)
    }

    #[test]
    fn input_document_merges_billing_fields() {
        let mut acct = account("a1", "org", ProviderKind::Azure);
        acct.subscription_id = Some("sub-1".to_string());
        let mut extra = Map::new();
        extra.insert("forecast".to_string(), json!(99.5));
        let snapshot = BillingSnapshot {
            monthly_spend: 42.0,
            currency: "EUR".to_string(),
            extra,
        };

        let input = input_document(&acct, &snapshot);
        assert_eq!(input["monthly_spend"], json!(42.0));
        assert_eq!(input["monthlySpend"], json!(42.0));
        assert_eq!(input["currency"], "EUR");
        assert_eq!(input["forecast"], json!(99.5));
        assert_eq!(input["subscription_id"], "sub-1");
        assert_eq!(input["project_id"], Value::Null);
        assert_eq!(input["provider_type"], "azure");
    }

    #[tokio::test]
    async fn over_budget_account_is_flagged_remediated_and_deduplicated() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_policy(&policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 10000})))
            .await
            .unwrap();
        storage.insert_account(&account("a1", "org", ProviderKind::Aws)).await.unwrap();

        let provider = FakeProvider { spend: 12000.0, ..FakeProvider::with_instances(2, "t3.large") };
        let enforcer = enforcer(&storage, provider).await;

        let first = enforcer.run_tick(Utc::now()).await.unwrap();
        assert_eq!(first.accounts_processed, 1);
        assert_eq!(first.violations_created, 1);
        assert_eq!(first.remediations_succeeded, 1);

        let violations = storage.list_violations_for_policy("p1").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].status, ViolationStatus::Remediated);
        let stored = storage.find_account("a1").await.unwrap().unwrap();
        assert_eq!(stored.monthly_spend, 12000.0);
    }

    #[tokio::test]
    async fn billing_failure_skips_only_that_account() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_policy(&policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 1})))
            .await
            .unwrap();
        storage.insert_account(&account("a1", "org", ProviderKind::Aws)).await.unwrap();
        // no provider registered for gcp
        storage.insert_account(&account("a2", "org", ProviderKind::Gcp)).await.unwrap();

        let enforcer = enforcer(&storage, FakeProvider { spend: 5.0, ..Default::default() }).await;
        let summary = enforcer.run_tick(Utc::now()).await.unwrap();

        assert_eq!(summary.accounts_processed, 1);
        assert_eq!(summary.accounts_skipped, 1);
        assert_eq!(summary.violations_created, 1);
    }

    #[tokio::test]
    async fn policies_of_other_organizations_are_not_evaluated() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_policy(&policy("p1", "other", PolicyType::MaxSpend, json!({"maxAmount": 1})))
            .await
            .unwrap();
        storage.insert_account(&account("a1", "org", ProviderKind::Aws)).await.unwrap();

        let enforcer = enforcer(&storage, FakeProvider { spend: 5.0, ..Default::default() }).await;
        let summary = enforcer.run_tick(Utc::now()).await.unwrap();

        assert_eq!(summary.policies_evaluated, 0);
        assert!(storage.list_violations(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_records_the_tick() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_policy(&policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 100})))
            .await
            .unwrap();

        let enforcer = Arc::new(enforcer(&storage, FakeProvider::default()).await);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(enforcer.clone().run(rx));

        for _ in 0..50 {
            if enforcer.ticks_completed().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert_eq!(enforcer.ticks_completed().await, 1);
        assert!(enforcer.last_tick().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_mid_tick_lets_the_tick_finish() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_policy(&policy("p1", "org", PolicyType::MaxSpend, json!({"maxAmount": 10000})))
            .await
            .unwrap();
        storage.insert_account(&account("a1", "org", ProviderKind::Aws)).await.unwrap();

        let provider = Arc::new(FakeProvider {
            spend: 12000.0,
            billing_delay: Some(Duration::from_millis(300)),
            ..FakeProvider::with_instances(1, "t3.large")
        });
        let enforcer = Arc::new(enforcer_with(&storage, provider.clone(), EnforcerConfig::default()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(enforcer.clone().run(rx));

        // billing is in flight when shutdown arrives
        provider.billing_started.notified().await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert_eq!(enforcer.ticks_completed().await, 1);
        assert_eq!(storage.find_account("a1").await.unwrap().unwrap().monthly_spend, 12000.0);
        let violations = storage.list_violations_for_policy("p1").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].status, ViolationStatus::Remediated);
        assert_eq!(provider.stopped(), vec!["i-0".to_string()]);
    }

    #[tokio::test]
    async fn slow_ticks_never_overlap() {
        let storage = Storage::in_memory().await.unwrap();
        storage.insert_account(&account("a1", "org", ProviderKind::Aws)).await.unwrap();

        // each tick outlasts the interval
        let provider = Arc::new(FakeProvider {
            billing_delay: Some(Duration::from_millis(1500)),
            ..Default::default()
        });
        let config = EnforcerConfig { interval_secs: 1, ..EnforcerConfig::default() };
        let enforcer = Arc::new(enforcer_with(&storage, provider.clone(), config));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(enforcer.clone().run(rx));

        for _ in 0..100 {
            if enforcer.ticks_completed().await >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert!(enforcer.ticks_completed().await >= 2);
        assert_eq!(provider.billing_max_in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
