//! CLI command implementations.

pub mod jobs;
pub mod trigger;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use url::Url;

/// Thin client for the trigger API.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let base_url = Url::parse(api_url)
            .with_context(|| format!("invalid API URL '{}'", api_url))?
            .join("api/v1/")?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self.client.get(self.url(path)?).query(query).send().await?;
        read(response).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self.client.post(self.url(path)?).json(body).send().await?;
        read(response).await
    }
}

async fn read(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("no error message");
        bail!("{}: {}", status, message);
    }
    Ok(body)
}

pub fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn validate(path: &str) -> Result<()> {
    match nimbus_config::load_orchestrator_config(path) {
        Ok(config) => {
            println!(
                "Configuration is valid ({} resource types)",
                config.resource_types.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_paths() {
        let api = ApiClient::new("http://localhost:3000").unwrap();
        assert_eq!(
            api.url("jobs/describe/progress").unwrap().as_str(),
            "http://localhost:3000/api/v1/jobs/describe/progress"
        );
        assert!(ApiClient::new("not a url").is_err());
    }
}
