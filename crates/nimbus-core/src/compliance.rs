//! Compliance catalog and finding index collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{JobId, Result};

/// A named set of controls, possibly nested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: String,
    pub title: String,
    pub controls: Vec<String>,
    /// Child benchmark ids.
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub id: String,
    pub title: String,
}

/// The external compliance service.
#[async_trait]
pub trait ComplianceCatalog: Send + Sync {
    /// Returns `Error::NotFound` for unknown benchmarks.
    async fn get_benchmark(&self, id: &str) -> Result<Benchmark>;

    async fn list_controls(&self, ids: &[String]) -> Result<Vec<Control>>;
}

/// The search index runners write findings into.
#[async_trait]
pub trait FindingIndex: Send + Sync {
    /// Live count of finding documents written for a compliance job.
    async fn count_findings(&self, job_id: JobId) -> Result<u64>;

    /// Whether the summary document of a compliance job has been indexed.
    async fn summary_indexed(&self, job_id: JobId) -> Result<bool>;
}
