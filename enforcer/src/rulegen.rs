//! Renders Rego rule definitions for the built-in policy types from their
//! structured config. Used when a stored policy carries no hand-written rule.

use anyhow::{anyhow, bail, Result};
use common::PolicyType;
use serde_json::Value;

pub fn generate(policy_type: &PolicyType, config: &Value) -> Result<String> {
    match policy_type {
        PolicyType::MaxSpend => max_spend(config),
        PolicyType::BlockInstanceType => block_instance_type(config),
        PolicyType::AutoStopIdle => auto_stop_idle(config),
        PolicyType::RequireTags => require_tags(config),
        PolicyType::Other(name) => bail!("unknown policy type: {}", name),
    }
}

/// Size names accepted by `maxSize`, smallest first.
pub fn instance_size_rank(name: &str) -> Option<u32> {
    match name {
        "small" => Some(1),
        "medium" => Some(2),
        "large" => Some(3),
        "xlarge" => Some(4),
        _ => None,
    }
}

fn number(config: &Value, keys: &[&str]) -> Result<f64> {
    keys.iter()
        .find_map(|k| config.get(*k).and_then(Value::as_f64))
        .ok_or_else(|| anyhow!("config is missing numeric {}", keys.join("/")))
}

fn rego_string(s: &str) -> String {
    // JSON string escaping is valid Rego string syntax
    Value::String(s.to_string()).to_string()
}

// Messages are assembled with concat: the engine's sprintf swallows the
// character that follows a verb, so a verb is only ever used on its own.

fn max_spend(config: &Value) -> Result<String> {
    let limit = number(config, &["maxAmount", "threshold"])?;
    let filter = match config.get("accountId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => format!("input.account_id == {}\n\t", rego_string(id)),
        _ => String::new(),
    };

    Ok(format!(
        r#"package finops.policies.max_spend

import rego.v1

default allow := true

allow := false if {{
	{filter}input.monthly_spend > {limit}
}}

violation if {{
	{filter}input.monthly_spend > {limit}
}}

msg := concat("", ["Monthly spend $", sprintf("%v", [input.monthly_spend]), " exceeds limit of ${limit}"]) if {{
	{filter}input.monthly_spend > {limit}
}}
"#
    ))
}

fn block_instance_type(config: &Value) -> Result<String> {
    let max_size = config
        .get("maxSize")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("config is missing maxSize"))?;
    let rank = instance_size_rank(max_size)
        .ok_or_else(|| anyhow!("unknown maxSize: {}", max_size))?;

    Ok(format!(
        r#"package finops.policies.block_instance_type

import rego.v1

default allow := true

allow := false if {{
	input.instance_size > {rank}
}}

violation if {{
	input.instance_size > {rank}
}}

msg := concat("", ["Instance size ", sprintf("%v", [input.instance_size]), " exceeds maximum allowed size: {max_size}"]) if {{
	input.instance_size > {rank}
}}
"#
    ))
}

fn auto_stop_idle(config: &Value) -> Result<String> {
    let hours = number(config, &["idleHours"])?;

    Ok(format!(
        r#"package finops.policies.auto_stop_idle

import rego.v1

default allow := true

allow := false if {{
	input.idle_hours >= {hours}
}}

violation if {{
	input.idle_hours >= {hours}
}}

msg := concat("", ["Resource has been idle for ", sprintf("%v", [input.idle_hours]), " hours, should be stopped"]) if {{
	input.idle_hours >= {hours}
}}
"#
    ))
}

fn require_tags(config: &Value) -> Result<String> {
    let tags = config
        .get("requiredTags")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("config is missing requiredTags"))?;
    let list = tags
        .iter()
        .filter_map(Value::as_str)
        .map(rego_string)
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        r#"package finops.policies.require_tags

import rego.v1

required_tags := [{list}]

missing contains tag if {{
	some tag in required_tags
	not input.tags[tag]
}}

default allow := true

allow := false if {{
	count(missing) > 0
}}

violation if {{
	count(missing) > 0
}}

msg := concat("", ["Missing required tags: ", concat(", ", sort(missing))]) if {{
	count(missing) > 0
}}
"#
    ))
}
