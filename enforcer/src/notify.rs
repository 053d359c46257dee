use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use common::{Policy, Severity, Violation, WebhookKind};
use futures::future::join_all;
use log::{info, warn};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::EnforceError;
use crate::storage::Storage;

/// Per-destination results of one fan-out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Posts a violation to every enabled webhook of an organization.
/// Destinations are independent: one slow or failing endpoint never keeps
/// the others from being tried, and nothing is retried.
#[derive(Clone)]
pub struct NotificationFanout {
    storage: Storage,
    client: Client,
}

impl NotificationFanout {
    pub fn new(storage: Storage, timeout: Duration) -> Result<Self> {
        Ok(Self {
            storage,
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    pub async fn notify(&self, organization_id: &str, policy: &Policy, violation: &Violation) -> Result<DeliveryReport> {
        let webhooks = self.storage.find_enabled_webhooks(organization_id).await?;
        if webhooks.is_empty() {
            return Ok(DeliveryReport::default());
        }

        let timestamp = Utc::now();
        let sends = webhooks.iter().map(|webhook| {
            let payload = build_payload(webhook.kind, policy, violation, timestamp);
            async move { (webhook, self.post(&webhook.url, &payload).await) }
        });

        let mut report = DeliveryReport::default();
        for (webhook, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    info!("Webhook {} ({}) notified of violation {}", webhook.id, webhook.kind.as_str(), violation.id);
                    report.delivered.push(webhook.id.clone());
                }
                Err(e) => {
                    warn!("{}", e);
                    report.failed.push(webhook.id.clone());
                }
            }
        }
        Ok(report)
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<(), EnforceError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| EnforceError::Delivery { url: url.to_string(), reason: e.to_string() })?;

        if !response.status().is_success() {
            return Err(EnforceError::Delivery {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }
        Ok(())
    }
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "⚠️",
        Severity::Medium => "🔶",
        Severity::High => "🔴",
        Severity::Critical => "🚨",
    }
}

fn severity_color(severity: Severity) -> u32 {
    match severity {
        Severity::Low => 0xFFFF00,
        Severity::Medium => 0xFFA500,
        Severity::High => 0xFF0000,
        Severity::Critical => 0x8B0000,
    }
}

/// Channel-specific body for one webhook.
pub fn build_payload(kind: WebhookKind, policy: &Policy, violation: &Violation, timestamp: DateTime<Utc>) -> Value {
    let emoji = severity_emoji(violation.severity);
    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    let severity = violation.severity.as_str();
    let status = violation.status.as_str();
    let provider = violation.provider.as_str();

    match kind {
        WebhookKind::Slack => json!({
            "text": format!("{} Policy Violation Detected", emoji),
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": format!("{} Policy Violation", emoji), "emoji": true }
                },
                {
                    "type": "section",
                    "fields": [
                        { "type": "mrkdwn", "text": format!("*Policy:*\n{}", policy.name) },
                        { "type": "mrkdwn", "text": format!("*Severity:*\n{}", severity) },
                        { "type": "mrkdwn", "text": format!("*Cloud Provider:*\n{}", provider) },
                        { "type": "mrkdwn", "text": format!("*Status:*\n{}", status) }
                    ]
                },
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": format!("*Message:*\n{}", violation.message) }
                },
                {
                    "type": "context",
                    "elements": [
                        { "type": "mrkdwn", "text": format!("Violation ID: {} | Created: {}", violation.id, ts) }
                    ]
                }
            ]
        }),
        WebhookKind::Discord => json!({
            "embeds": [{
                "title": format!("{} Policy Violation Detected", emoji),
                "description": violation.message,
                "color": severity_color(violation.severity),
                "fields": [
                    { "name": "Policy", "value": policy.name, "inline": true },
                    { "name": "Severity", "value": severity, "inline": true },
                    { "name": "Cloud Provider", "value": provider, "inline": true },
                    { "name": "Status", "value": status, "inline": true },
                    { "name": "Violation ID", "value": violation.id, "inline": false }
                ],
                "timestamp": ts
            }]
        }),
        WebhookKind::Teams => json!({
            "@type": "MessageCard",
            "@context": "https://schema.org/extensions",
            "summary": format!("Policy Violation: {}", policy.name),
            "themeColor": format!("{:06X}", severity_color(violation.severity)),
            "sections": [{
                "activityTitle": format!("{} Policy Violation Detected", emoji),
                "activitySubtitle": violation.message,
                "facts": [
                    { "name": "Policy", "value": policy.name },
                    { "name": "Severity", "value": severity },
                    { "name": "Cloud Provider", "value": provider },
                    { "name": "Status", "value": status },
                    { "name": "Violation ID", "value": violation.id },
                    { "name": "Timestamp", "value": ts }
                ]
            }]
        }),
        WebhookKind::Generic => json!({
            "type": "policy_violation",
            "policy": {
                "id": policy.id,
                "name": policy.name,
                "description": policy.description,
            },
            "violation": {
                "id": violation.id,
                "resourceId": violation.resource_id,
                "resourceType": violation.resource_type,
                "cloudProvider": provider,
                "message": violation.message,
                "severity": severity,
                "status": status,
                "createdAt": violation.created_at.to_rfc3339(),
            },
            "timestamp": ts,
        }),
    }
}
