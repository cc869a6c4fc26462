//! HTTP substrate for a remote worker fleet.

use async_trait::async_trait;
use nimbus_core::substrate::{EnqueueOutcome, ExecutionPayload, ExecutionSubstrate};
use nimbus_core::{Error, JobId, Result};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

/// Posts payloads to `{base}/jobs` and withdraws them with
/// `DELETE {base}/jobs/{id}`.
pub struct HttpSubstrate {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSubstrate {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn jobs_url(&self, job_id: Option<JobId>) -> Result<Url> {
        let path = match job_id {
            Some(id) => format!("jobs/{}", id),
            None => "jobs".to_string(),
        };
        self.base_url
            .join(&path)
            .map_err(|e| Error::Configuration(format!("invalid worker url: {}", e)))
    }
}

/// Map a non-success response onto the error taxonomy.
fn status_error(status: StatusCode, body: String) -> Error {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::Throttled(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Credential(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Configuration(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Error::Timeout(body),
        _ => Error::Transport(format!("worker returned {}: {}", status, body)),
    }
}

#[async_trait]
impl ExecutionSubstrate for HttpSubstrate {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn enqueue(&self, payload: ExecutionPayload) -> Result<EnqueueOutcome> {
        let url = self.jobs_url(None)?;
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            debug!(job_id = %payload.job_id, "Worker fleet throttled enqueue");
            return Ok(EnqueueOutcome::Throttled);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }
        Ok(EnqueueOutcome::Accepted)
    }

    async fn remove_pending(&self, job_id: JobId) -> Result<bool> {
        let url = self.jobs_url(Some(job_id))?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(true),
            // Already picked up by a worker, or never queued.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE => Ok(false),
            s => {
                let text = response.text().await.unwrap_or_default();
                Err(status_error(s, text))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_url() {
        let substrate = HttpSubstrate::new(Url::parse("http://workers:8080/api/").unwrap());
        let id = JobId::new();
        assert_eq!(
            substrate.jobs_url(None).unwrap().as_str(),
            "http://workers:8080/api/jobs"
        );
        assert_eq!(
            substrate.jobs_url(Some(id)).unwrap().as_str(),
            format!("http://workers:8080/api/jobs/{}", id)
        );
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            Error::Throttled(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, String::new()),
            Error::Credential(_)
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!status_error(StatusCode::BAD_REQUEST, String::new()).is_retryable());
    }
}
