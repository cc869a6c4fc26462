//! Execution substrate trait and wire messages.
//!
//! The substrate is whatever actually runs jobs: a message queue consumed by
//! describer workers, or a remote function invoked over HTTP. The core only
//! hands payloads off and later reads results back from a [`ResultStream`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::job::JobKind;
use crate::{JobId, Result};

/// Everything an executor needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub job_id: JobId,
    pub kind: JobKind,
    pub parent_id: Option<JobId>,
    /// Topic or endpoint the payload is addressed to.
    pub target: String,
    pub credential_ref: Option<String>,
    /// Kind-specific parameters (resource type, control ids, ...).
    pub body: serde_json::Value,
}

/// Result of handing a payload to the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Rate limited; the job should be retried later.
    Throttled,
}

#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Name of this substrate.
    fn name(&self) -> &'static str;

    async fn enqueue(&self, payload: ExecutionPayload) -> Result<EnqueueOutcome>;

    /// Remove a payload that has not been picked up yet. Returns `false` if it
    /// was already consumed (or never existed).
    async fn remove_pending(&self, job_id: JobId) -> Result<bool>;
}

string_enum! {
    /// Status reported by an executor.
    pub enum ResultStatus {
        InProgress => "IN_PROGRESS",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Timeout => "TIMEOUT",
        Canceled => "CANCELED",
    }
}

/// A job result read from the result stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultMessage {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: ResultStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub described_resource_count: u64,
    #[serde(default)]
    pub total_finding_count: u64,
    /// Ids of every resource the describer reported. Only present when the
    /// describer streamed its full result set.
    #[serde(default)]
    pub resource_ids: Option<Vec<String>>,
    /// Set when the describer stopped part way through.
    #[serde(default)]
    pub partial: bool,
}

impl JobResultMessage {
    pub fn new(job_id: JobId, kind: JobKind, status: ResultStatus) -> Self {
        Self {
            job_id,
            kind,
            status,
            error: None,
            error_code: None,
            described_resource_count: 0,
            total_finding_count: 0,
            resource_ids: None,
            partial: false,
        }
    }
}

/// A raw message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Bytes,
}

/// At-least-once stream of result messages.
#[async_trait]
pub trait ResultStream: Send + Sync {
    /// Wait for the next message; `None` once the stream is closed.
    async fn receive(&self) -> Option<Delivery>;

    async fn ack(&self, tag: u64) -> Result<()>;

    /// Reject a message without blocking the stream.
    async fn nack(&self, tag: u64) -> Result<()>;
}
