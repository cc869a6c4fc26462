//! Compliance service client.

use async_trait::async_trait;
use nimbus_core::Result;
use nimbus_core::compliance::{Benchmark, ComplianceCatalog, Control};
use serde_json::json;
use url::Url;

use super::{Endpoint, check, decode, transport};

pub struct ComplianceClient {
    endpoint: Endpoint,
}

impl ComplianceClient {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self {
            endpoint: Endpoint::new(client, base_url),
        }
    }
}

#[async_trait]
impl ComplianceCatalog for ComplianceClient {
    async fn get_benchmark(&self, id: &str) -> Result<Benchmark> {
        let response = self
            .endpoint
            .client()
            .get(self.endpoint.url("benchmarks")?)
            .query(&[("id", id)])
            .send()
            .await
            .map_err(transport)?;
        decode(check(response, &format!("benchmark {id}")).await?).await
    }

    async fn list_controls(&self, ids: &[String]) -> Result<Vec<Control>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .endpoint
            .client()
            .post(self.endpoint.url("controls/query")?)
            .json(&json!({ "ids": ids }))
            .send()
            .await
            .map_err(transport)?;
        decode(check(response, "controls").await?).await
    }
}
