//! The job store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::job::{
    AnalyticsJob, ComplianceJob, ComplianceRunner, ComplianceSummarizer, DescribeConnectionJob,
    JobSequencer,
};
use nimbus_core::{AnyJob, AnyStatus, JobId, JobKind, Transition};
use std::collections::{BTreeMap, HashMap};

use crate::{DbResult, JobFilter};

/// Persistent records for every job kind.
///
/// Status changes go exclusively through [`JobStore::transition`], a
/// compare-and-set on the current status, so concurrent schedulers and
/// consumers can race on the same job without corrupting it: at most one of
/// them observes `true`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_describe_jobs(&self, jobs: &[DescribeConnectionJob]) -> DbResult<()>;

    async fn get_describe_job(&self, id: JobId) -> DbResult<DescribeConnectionJob>;

    /// Most recently created job for a (connection, resource type) pair.
    async fn last_describe_job(
        &self,
        connection_id: &str,
        resource_type: &str,
    ) -> DbResult<Option<DescribeConnectionJob>>;

    async fn list_describe_jobs(&self, filter: &JobFilter) -> DbResult<Vec<DescribeConnectionJob>>;

    /// Queued or in-progress describe jobs per resource type.
    async fn describe_in_flight_by_type(&self) -> DbResult<HashMap<String, u64>>;

    async fn insert_compliance_job(&self, job: &ComplianceJob) -> DbResult<()>;

    async fn get_compliance_job(&self, id: JobId) -> DbResult<ComplianceJob>;

    async fn list_compliance_jobs(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceJob>>;

    /// Insert runners in one batch.
    async fn insert_runners(&self, runners: &[ComplianceRunner]) -> DbResult<()>;

    async fn list_runners(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceRunner>>;

    async fn insert_summarizer(&self, summarizer: &ComplianceSummarizer) -> DbResult<()>;

    async fn list_summarizers(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceSummarizer>>;

    /// Delete compliance jobs created before `cutoff` together with their
    /// runners and summarizers. Returns the number of jobs deleted.
    async fn purge_compliance_jobs(&self, cutoff: DateTime<Utc>) -> DbResult<u64>;

    async fn insert_analytics_job(&self, job: &AnalyticsJob) -> DbResult<()>;

    async fn list_analytics_jobs(&self, filter: &JobFilter) -> DbResult<Vec<AnalyticsJob>>;

    async fn insert_sequencer(&self, sequencer: &JobSequencer) -> DbResult<()>;

    async fn list_sequencers(&self, filter: &JobFilter) -> DbResult<Vec<JobSequencer>>;

    async fn get_job(&self, kind: JobKind, id: JobId) -> DbResult<AnyJob>;

    /// Current status of each id that exists; missing ids are absent from the map.
    async fn job_statuses(
        &self,
        kind: JobKind,
        ids: &[JobId],
    ) -> DbResult<HashMap<JobId, AnyStatus>>;

    /// Apply `transition` if the job currently matches its guard. Returns
    /// whether this call performed the update.
    async fn transition(&self, id: JobId, transition: &Transition) -> DbResult<bool>;

    async fn count_jobs(&self, kind: JobKind, filter: &JobFilter) -> DbResult<u64>;

    async fn count_by_status(
        &self,
        kind: JobKind,
        filter: &JobFilter,
    ) -> DbResult<BTreeMap<String, u64>>;

    /// Delete terminal jobs of `kind` last updated before `cutoff`.
    async fn delete_terminal_jobs(&self, kind: JobKind, cutoff: DateTime<Utc>) -> DbResult<u64>;
}
