//! Query filters shared by every job table.

use chrono::{DateTime, Utc};
use nimbus_core::job::{JobHeader, JobState};
use nimbus_core::JobId;

/// Filter for listing and counting jobs. Unset fields match everything;
/// fields that a kind does not have (e.g. `resource_type` on runners) are
/// ignored for that kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub statuses: Vec<String>,
    pub ids: Vec<JobId>,
    pub parent_id: Option<JobId>,
    /// Describe jobs: equal; compliance jobs and runners: contained in `connection_ids`.
    pub connection_id: Option<String>,
    pub resource_type: Option<String>,
    pub benchmark_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub started_after: Option<DateTime<Utc>>,
    /// Only jobs with `retry_count` strictly below this.
    pub retry_count_below: Option<u32>,
    pub limit: Option<u64>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses<S: JobState>(mut self, statuses: &[S]) -> Self {
        self.statuses = statuses.iter().map(|s| s.name().to_string()).collect();
        self
    }

    pub fn status_names<I, T>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    pub fn ids(mut self, ids: &[JobId]) -> Self {
        self.ids = ids.to_vec();
        self
    }

    pub fn parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn benchmark(mut self, benchmark_id: impl Into<String>) -> Self {
        self.benchmark_id = Some(benchmark_id.into());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn updated_after(mut self, at: DateTime<Utc>) -> Self {
        self.updated_after = Some(at);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn started_after(mut self, at: DateTime<Utc>) -> Self {
        self.started_after = Some(at);
        self
    }

    pub fn retry_count_below(mut self, max: u32) -> Self {
        self.retry_count_below = Some(max);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check the header-level conditions and the status.
    pub(crate) fn matches_header(&self, header: &JobHeader, status: &str) -> bool {
        (self.statuses.is_empty() || self.statuses.iter().any(|s| s == status))
            && (self.ids.is_empty() || self.ids.contains(&header.id))
            && self.parent_id.is_none_or(|p| header.parent_id == Some(p))
            && self.created_after.is_none_or(|t| header.created_at > t)
            && self.created_before.is_none_or(|t| header.created_at < t)
            && self.updated_after.is_none_or(|t| header.updated_at > t)
            && self.updated_before.is_none_or(|t| header.updated_at < t)
            && self
                .started_after
                .is_none_or(|t| header.started_at.is_some_and(|s| s > t))
            && self.retry_count_below.is_none_or(|max| header.retry_count < max)
    }
}
