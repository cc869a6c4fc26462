//! HTTP clients for the services the orchestrator depends on.

pub mod compliance;
pub mod index;
pub mod onboarding;

pub use compliance::ComplianceClient;
pub use index::IndexClient;
pub use onboarding::OnboardingClient;

use nimbus_core::{Error, Result};
use reqwest::{Response, StatusCode};
use url::Url;

/// Base URL plus a shared client.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    client: reqwest::Client,
    base_url: Url,
}

impl Endpoint {
    pub(crate) fn new(client: reqwest::Client, mut base_url: Url) -> Self {
        // `Url::join` drops the last segment unless the base ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { client, base_url }
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Configuration(format!("invalid service url: {}", e)))
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

pub(crate) fn transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Transport(err.to_string())
    }
}

/// Pass successful responses through; map the rest onto the error taxonomy.
pub(crate) async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => Error::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => Error::Throttled(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Credential(body),
        StatusCode::BAD_REQUEST => Error::InvalidInput(body),
        _ => Error::Transport(format!("{} returned {}: {}", what, status, body)),
    })
}

pub(crate) async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::Transport(format!("malformed response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path() {
        for base in ["http://onboarding:8080/api/v1", "http://onboarding:8080/api/v1/"] {
            let endpoint = Endpoint::new(reqwest::Client::new(), Url::parse(base).unwrap());
            assert_eq!(
                endpoint.url("connections").unwrap().as_str(),
                "http://onboarding:8080/api/v1/connections"
            );
        }
    }
}
