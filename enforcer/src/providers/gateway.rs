use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{CloudAccount, ProviderConfig, ProviderKind};
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use super::{BillingSnapshot, CloudProvider, Instance};

const CREDENTIALS_HEADER: &str = "X-Cloud-Credentials";

/// Talks JSON to a cloud gateway that fronts one provider's billing and
/// compute APIs.
#[derive(Clone)]
pub struct GatewayProvider {
    kind: ProviderKind,
    client: Client,
    endpoint: String,
    region: Option<String>,
}

#[derive(Deserialize)]
struct CpuResponse {
    average: Option<f64>,
    #[serde(default)]
    datapoints: u32,
}

impl GatewayProvider {
    pub fn new(kind: ProviderKind, settings: &ProviderConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            kind,
            client: Client::builder().timeout(timeout).build()?,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            region: settings.region.clone(),
        })
    }

    /// Identifier the gateway knows the account by.
    fn account_ref<'a>(&self, account: &'a CloudAccount) -> &'a str {
        let preferred = match self.kind {
            ProviderKind::Azure => account.subscription_id.as_deref(),
            ProviderKind::Gcp => account.project_id.as_deref(),
            ProviderKind::Oci => account.tenancy_id.as_deref(),
            _ => account.account_id.as_deref(),
        };
        preferred.filter(|s| !s.is_empty()).unwrap_or(account.id.as_str())
    }

    fn url(&self, account: &CloudAccount, path: &str) -> String {
        format!("{}/accounts/{}{}", self.endpoint, self.account_ref(account), path)
    }

    fn prepare(&self, request: RequestBuilder, account: &CloudAccount) -> RequestBuilder {
        let request = request.header(CREDENTIALS_HEADER, account.credentials.as_str());
        match &self.region {
            Some(region) => request.query(&[("region", region)]),
            None => request,
        }
    }

    async fn post_action(&self, account: &CloudAccount, instance_id: &str, action: &str) -> Result<()> {
        let url = self.url(account, &format!("/instances/{}/{}", instance_id, action));
        let response = self.prepare(self.client.post(&url), account).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("{} {} returned status {}", action, instance_id, response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for GatewayProvider {
    fn kind(&self) -> ProviderKind {
        self.kind.clone()
    }

    async fn fetch_billing(&self, account: &CloudAccount) -> Result<BillingSnapshot> {
        let url = self.url(account, "/billing");
        debug!("Fetching billing from {}", url);
        let response = self.prepare(self.client.get(&url), account).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("billing request returned status {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn list_running_instances(&self, account: &CloudAccount) -> Result<Vec<Instance>> {
        let url = self.url(account, "/instances");
        let response = self
            .prepare(self.client.get(&url), account)
            .query(&[("state", "running")])
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("instance listing returned status {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn stop_instance(&self, account: &CloudAccount, instance_id: &str) -> Result<()> {
        self.post_action(account, instance_id, "stop").await
    }

    async fn terminate_instance(&self, account: &CloudAccount, instance_id: &str) -> Result<()> {
        self.post_action(account, instance_id, "terminate").await
    }

    async fn average_cpu(&self, account: &CloudAccount, instance_id: &str, hours: f64) -> Result<Option<f64>> {
        let url = self.url(account, &format!("/instances/{}/cpu", instance_id));
        let response = self
            .prepare(self.client.get(&url), account)
            .query(&[("hours", hours)])
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("cpu metrics returned status {}", response.status());
        }
        let cpu: CpuResponse = response.json().await?;
        Ok(if cpu.datapoints == 0 { None } else { cpu.average })
    }

    fn is_essential(&self, instance: &Instance, essential_tag: &str) -> bool {
        let tagged = |key: &str| {
            instance
                .tags
                .get(key)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        match self.kind {
            // GCP labels are lowercase only
            ProviderKind::Gcp => tagged(&essential_tag.to_ascii_lowercase()),
            // IBM VPC instances carry no free-form tags; the name is the marker
            ProviderKind::Ibm => {
                tagged(essential_tag)
                    || instance.name.to_ascii_lowercase().contains(&essential_tag.to_ascii_lowercase())
            }
            _ => tagged(essential_tag),
        }
    }
}
