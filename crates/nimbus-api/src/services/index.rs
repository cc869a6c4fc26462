//! Resource and finding index client.

use async_trait::async_trait;
use nimbus_core::cleanup::{CleanupTarget, ResourceIdPage};
use nimbus_core::compliance::FindingIndex;
use nimbus_core::{Error, JobId, Result};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{Endpoint, check, decode, transport};

pub struct IndexClient {
    endpoint: Endpoint,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

impl IndexClient {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self {
            endpoint: Endpoint::new(client, base_url),
        }
    }
}

#[async_trait]
impl FindingIndex for IndexClient {
    async fn count_findings(&self, job_id: JobId) -> Result<u64> {
        let response = self
            .endpoint
            .client()
            .get(self.endpoint.url("findings/count")?)
            .query(&[("job_id", job_id.to_string())])
            .send()
            .await
            .map_err(transport)?;
        let count: CountResponse = decode(check(response, "finding count").await?).await?;
        Ok(count.count)
    }

    async fn summary_indexed(&self, job_id: JobId) -> Result<bool> {
        let response = self
            .endpoint
            .client()
            .get(self.endpoint.url("summaries")?)
            .query(&[("job_id", job_id.to_string())])
            .send()
            .await
            .map_err(transport)?;
        match check(response, "summary").await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CleanupTarget for IndexClient {
    async fn existing_resource_ids(
        &self,
        connection_id: &str,
        resource_type: &str,
        cursor: Option<String>,
    ) -> Result<ResourceIdPage> {
        let mut query = vec![
            ("connection_id", connection_id.to_string()),
            ("resource_type", resource_type.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let response = self
            .endpoint
            .client()
            .get(self.endpoint.url("resources/ids")?)
            .query(&query)
            .send()
            .await
            .map_err(transport)?;
        decode(check(response, "resource ids").await?).await
    }

    async fn delete_resources(
        &self,
        connection_id: &str,
        resource_type: &str,
        ids: &[String],
    ) -> Result<()> {
        let response = self
            .endpoint
            .client()
            .post(self.endpoint.url("resources/delete")?)
            .json(&json!({
                "connection_id": connection_id,
                "resource_type": resource_type,
                "ids": ids,
            }))
            .send()
            .await
            .map_err(transport)?;
        check(response, "resource delete").await?;
        Ok(())
    }
}
