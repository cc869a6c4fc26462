//! Onboarding service client: connection directory and credential vault.

use async_trait::async_trait;
use nimbus_core::Result;
use nimbus_core::connection::{Connection, ConnectionDirectory, ConnectionFilter, CredentialVault};
use serde::Deserialize;
use url::Url;

use super::{Endpoint, check, decode, transport};

pub struct OnboardingClient {
    endpoint: Endpoint,
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    reference: String,
}

impl OnboardingClient {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self {
            endpoint: Endpoint::new(client, base_url),
        }
    }
}

#[async_trait]
impl ConnectionDirectory for OnboardingClient {
    async fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>> {
        let mut query: Vec<(&str, &str)> = filter
            .lifecycle_states
            .iter()
            .map(|s| ("lifecycle_state", s.as_str()))
            .collect();
        if let Some(connector) = filter.connector {
            query.push(("connector", connector.as_str()));
        }
        let response = self
            .endpoint
            .client()
            .get(self.endpoint.url("connections")?)
            .query(&query)
            .send()
            .await
            .map_err(transport)?;
        let connections: Vec<Connection> = decode(check(response, "connections").await?).await?;
        // The service may ignore filters it does not know.
        Ok(connections.into_iter().filter(|c| filter.matches(c)).collect())
    }

    async fn get_connection(&self, id: &str) -> Result<Connection> {
        let response = self
            .endpoint
            .client()
            .get(self.endpoint.url("connections")?)
            .query(&[("id", id)])
            .send()
            .await
            .map_err(transport)?;
        let mut found: Vec<Connection> =
            decode(check(response, &format!("connection {id}")).await?).await?;
        found
            .pop()
            .ok_or_else(|| nimbus_core::Error::NotFound(format!("connection {id}")))
    }
}

#[async_trait]
impl CredentialVault for OnboardingClient {
    async fn credential_ref(&self, connection: &Connection) -> Result<String> {
        let response = self
            .endpoint
            .client()
            .get(self.endpoint.url("credentials")?)
            .query(&[("id", connection.credential_id.as_str())])
            .send()
            .await
            .map_err(transport)?;
        let what = format!("credential {}", connection.credential_id);
        let credential: CredentialResponse = match check(response, &what).await {
            Ok(response) => decode(response).await?,
            Err(nimbus_core::Error::NotFound(msg)) => {
                return Err(nimbus_core::Error::Credential(msg));
            }
            Err(e) => return Err(e),
        };
        Ok(credential.reference)
    }
}
