use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use common::{FailureMode, Policy};
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::error::EnforceError;
use crate::rulegen;
use crate::storage::Storage;

const DEFAULT_MESSAGE: &str = "Policy violation detected";

/// Keyed lookup of rule-definition text by policy id.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn rule_text(&self, policy_id: &str) -> Result<Option<String>>;
}

#[async_trait]
impl RuleStore for Storage {
    async fn rule_text(&self, policy_id: &str) -> Result<Option<String>> {
        let Some(stored) = self.find_rule(policy_id).await? else {
            return Ok(None);
        };
        if !stored.rule_definition.trim().is_empty() {
            return Ok(Some(stored.rule_definition));
        }
        rulegen::generate(&stored.policy_type, &stored.config).map(Some)
    }
}

/// Rules kept on disk as `<dir>/<policy_id>.rego`.
pub struct RuleDirectory {
    dir: PathBuf,
}

impl RuleDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[cfg(test)]
    pub async fn save(&self, policy_id: &str, text: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(policy_id), text).await?;
        Ok(())
    }

    fn path_for(&self, policy_id: &str) -> PathBuf {
        self.dir.join(format!("{}.rego", policy_id))
    }
}

#[async_trait]
impl RuleStore for RuleDirectory {
    async fn rule_text(&self, policy_id: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(policy_id)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct CompiledRule {
    engine: regorus::Engine,
    package: String,
    source: String,
}

/// Outcome of evaluating one policy against one input document.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub violated: bool,
    pub message: Option<String>,
    pub details: Map<String, Value>,
    /// Set when the rule could not be evaluated and the failure mode decided instead.
    pub failure: Option<String>,
}

impl Evaluation {
    pub fn message_or_default(&self) -> String {
        self.message.clone().unwrap_or_else(|| DEFAULT_MESSAGE.to_string())
    }
}

/// Compiles rule definitions on first use and caches one engine per policy id.
pub struct RuleEvaluator {
    store: Arc<dyn RuleStore>,
    cache: RwLock<HashMap<String, Arc<CompiledRule>>>,
    failure_mode: FailureMode,
}

impl RuleEvaluator {
    pub fn new(store: Arc<dyn RuleStore>, failure_mode: FailureMode) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            failure_mode,
        }
    }

    /// Per-policy `failMode` overrides the engine default.
    pub fn failure_mode_for(&self, policy: &Policy) -> FailureMode {
        match policy.config_str("failMode") {
            Some("closed") => FailureMode::Closed,
            Some("open") => FailureMode::Open,
            _ => self.failure_mode,
        }
    }

    /// Evaluates `input` against the policy's rule. Never fails: a rule that is
    /// missing or broken is resolved through the policy's failure mode.
    pub async fn evaluate(&self, policy: &Policy, input: &Value) -> Evaluation {
        match self.try_evaluate(policy, input).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                let reason = e.to_string();
                let failure = EnforceError::Evaluation { policy: policy.id.clone(), reason: reason.clone() };
                match self.failure_mode_for(policy) {
                    FailureMode::Open => {
                        warn!("{}; failing open", failure);
                        Evaluation {
                            violated: false,
                            failure: Some(reason),
                            ..Default::default()
                        }
                    }
                    FailureMode::Closed => {
                        warn!("{}; failing closed", failure);
                        Evaluation {
                            violated: true,
                            message: Some(format!("Policy rule could not be evaluated: {}", reason)),
                            failure: Some(reason),
                            ..Default::default()
                        }
                    }
                }
            }
        }
    }

    pub async fn try_evaluate(&self, policy: &Policy, input: &Value) -> Result<Evaluation> {
        let compiled = self.compiled(&policy.id).await?;

        let mut engine = compiled.engine.clone();
        let data = json!({
            "policy": {
                "id": policy.id,
                "type": policy.policy_type.as_str(),
                "config": policy.config,
            }
        });
        engine.add_data(regorus::Value::from_json_str(&data.to_string())?)?;
        engine.set_input(regorus::Value::from_json_str(&input.to_string())?);

        let allow = eval_optional(&mut engine, &format!("{}.allow", compiled.package));
        let violation = eval_optional(&mut engine, &format!("{}.violation", compiled.package));
        let msg = eval_optional(&mut engine, &format!("{}.msg", compiled.package));

        let violated = decide(allow.as_ref(), violation.as_ref())?;
        let message = if violated {
            message_from(msg.as_ref(), violation.as_ref())
        } else {
            None
        };

        let mut details = Map::new();
        for (key, value) in [("allow", allow), ("violation", violation), ("msg", msg)] {
            if let Some(value) = value {
                details.insert(key.to_string(), value);
            }
        }

        debug!("Policy {} evaluated: violated={}", policy.id, violated);
        Ok(Evaluation {
            violated,
            message,
            details,
            failure: None,
        })
    }

    async fn compiled(&self, policy_id: &str) -> Result<Arc<CompiledRule>> {
        if let Some(hit) = self.cache.read().await.get(policy_id) {
            return Ok(hit.clone());
        }

        let source = self
            .store
            .rule_text(policy_id)
            .await?
            .ok_or_else(|| anyhow!("no rule definition for policy {}", policy_id))?;
        let compiled = Arc::new(compile(policy_id, source)?);

        self.cache
            .write()
            .await
            .insert(policy_id.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Drops every compiled rule. Returns how many were cached.
    pub async fn reload(&self) -> usize {
        let mut cache = self.cache.write().await;
        let n = cache.len();
        cache.clear();
        info!("Rule cache cleared ({} entries)", n);
        n
    }

    /// Re-reads the source of every cached rule and evicts the ones that
    /// changed or disappeared. Returns the number evicted.
    pub async fn refresh(&self) -> usize {
        let cached: Vec<(String, String)> = self
            .cache
            .read()
            .await
            .iter()
            .map(|(id, rule)| (id.clone(), rule.source.clone()))
            .collect();

        let mut stale = Vec::new();
        for (id, source) in cached {
            match self.store.rule_text(&id).await {
                Ok(Some(current)) if current == source => {}
                Ok(_) => stale.push(id),
                Err(e) => {
                    warn!("Could not re-read rule for policy {}: {}", id, e);
                    stale.push(id);
                }
            }
        }

        if !stale.is_empty() {
            let mut cache = self.cache.write().await;
            for id in &stale {
                cache.remove(id);
            }
            info!("Evicted {} changed rule(s) from cache", stale.len());
        }
        stale.len()
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Polls the rule store until `shutdown` flips to true.
    pub async fn watch(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Rule watcher stopped");
    }
}

fn compile(policy_id: &str, source: String) -> Result<CompiledRule> {
    let package = package_path(&source)
        .ok_or_else(|| anyhow!("rule for policy {} has no package declaration", policy_id))?;

    let mut engine = regorus::Engine::new();
    engine.add_policy(format!("{}.rego", policy_id), source.clone())?;

    Ok(CompiledRule {
        engine,
        package,
        source,
    })
}

/// `package a.b.c` -> `data.a.b.c`
fn package_path(source: &str) -> Option<String> {
    source
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("package "))
        .map(|rest| rest.split_whitespace().next().unwrap_or_default())
        .filter(|pkg| !pkg.is_empty())
        .map(|pkg| format!("data.{}", pkg))
}

/// Undefined rules and rules the module does not declare both come back as `None`.
fn eval_optional(engine: &mut regorus::Engine, path: &str) -> Option<Value> {
    match engine.eval_rule(path.to_string()) {
        Ok(regorus::Value::Undefined) => None,
        Ok(value) => serde_json::to_value(&value).ok(),
        Err(e) => {
            debug!("{} not evaluated: {}", path, e);
            None
        }
    }
}

fn decide(allow: Option<&Value>, violation: Option<&Value>) -> Result<bool> {
    if let Some(allow) = allow {
        return allow
            .as_bool()
            .map(|allowed| !allowed)
            .ok_or_else(|| anyhow!("allow is not a boolean: {}", allow));
    }
    match violation {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Array(items)) => Ok(!items.is_empty()),
        Some(other) => Err(anyhow!("violation has unexpected shape: {}", other)),
        None => Err(anyhow!("rule produced neither allow nor violation")),
    }
}

fn message_from(msg: Option<&Value>, violation: Option<&Value>) -> Option<String> {
    if let Some(Value::String(s)) = msg {
        return Some(s.clone());
    }
    match violation {
        Some(Value::Array(items)) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    }
}
