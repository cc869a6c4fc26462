//! In-memory job store.
//!
//! Suitable for single-process deployments and tests. Every operation takes
//! one lock over all tables, so compare-and-set transitions are atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::job::{
    AnalyticsJob, ComplianceJob, ComplianceRunner, ComplianceSummarizer, DescribeConnectionJob,
    DescribeStatus, JobSequencer,
};
use nimbus_core::{
    AnyJob, AnyStatus, Clock, JobHeader, JobId, JobKind, JobPatch, JobRecord, SystemClock,
    Transition,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{DbError, DbResult, JobFilter, JobStore};

/// Per-kind behaviour the generic table helpers need.
trait Stored: JobRecord + Clone + Send + Sync {
    fn header_mut(&mut self) -> &mut JobHeader;

    fn status_name(&self) -> &'static str;

    fn set_status(&mut self, status: &str) -> DbResult<()>;

    fn apply_fields(&mut self, _patch: &JobPatch) {}

    fn matches_fields(&self, _filter: &JobFilter) -> bool {
        true
    }

    fn into_any(self) -> AnyJob;
}

impl Stored for DescribeConnectionJob {
    fn header_mut(&mut self) -> &mut JobHeader {
        &mut self.header
    }

    fn status_name(&self) -> &'static str {
        self.status.as_str()
    }

    fn set_status(&mut self, status: &str) -> DbResult<()> {
        self.status = status.parse()?;
        Ok(())
    }

    fn apply_fields(&mut self, patch: &JobPatch) {
        if let Some(count) = patch.described_resource_count {
            self.described_resource_count = count;
        }
        if let Some(count) = patch.deleting_count {
            self.deleting_count = count;
        }
    }

    fn matches_fields(&self, filter: &JobFilter) -> bool {
        filter
            .connection_id
            .as_ref()
            .is_none_or(|c| *c == self.connection_id)
            && filter
                .resource_type
                .as_ref()
                .is_none_or(|t| *t == self.resource_type)
    }

    fn into_any(self) -> AnyJob {
        AnyJob::Describe(self)
    }
}

impl Stored for ComplianceJob {
    fn header_mut(&mut self) -> &mut JobHeader {
        &mut self.header
    }

    fn status_name(&self) -> &'static str {
        self.status.as_str()
    }

    fn set_status(&mut self, status: &str) -> DbResult<()> {
        self.status = status.parse()?;
        Ok(())
    }

    fn matches_fields(&self, filter: &JobFilter) -> bool {
        filter
            .connection_id
            .as_ref()
            .is_none_or(|c| self.connection_ids.contains(c))
            && filter
                .benchmark_id
                .as_ref()
                .is_none_or(|b| *b == self.benchmark_id)
    }

    fn into_any(self) -> AnyJob {
        AnyJob::Compliance(self)
    }
}

impl Stored for ComplianceRunner {
    fn header_mut(&mut self) -> &mut JobHeader {
        &mut self.header
    }

    fn status_name(&self) -> &'static str {
        self.status.as_str()
    }

    fn set_status(&mut self, status: &str) -> DbResult<()> {
        self.status = status.parse()?;
        Ok(())
    }

    fn apply_fields(&mut self, patch: &JobPatch) {
        if let Some(count) = patch.total_finding_count {
            self.total_finding_count = count;
        }
    }

    fn matches_fields(&self, filter: &JobFilter) -> bool {
        filter
            .connection_id
            .as_ref()
            .is_none_or(|c| self.connection_ids.contains(c))
            && filter
                .benchmark_id
                .as_ref()
                .is_none_or(|b| *b == self.benchmark_id)
    }

    fn into_any(self) -> AnyJob {
        AnyJob::ComplianceRunner(self)
    }
}

impl Stored for ComplianceSummarizer {
    fn header_mut(&mut self) -> &mut JobHeader {
        &mut self.header
    }

    fn status_name(&self) -> &'static str {
        self.status.as_str()
    }

    fn set_status(&mut self, status: &str) -> DbResult<()> {
        self.status = status.parse()?;
        Ok(())
    }

    fn matches_fields(&self, filter: &JobFilter) -> bool {
        filter
            .benchmark_id
            .as_ref()
            .is_none_or(|b| *b == self.benchmark_id)
    }

    fn into_any(self) -> AnyJob {
        AnyJob::ComplianceSummarizer(self)
    }
}

impl Stored for AnalyticsJob {
    fn header_mut(&mut self) -> &mut JobHeader {
        &mut self.header
    }

    fn status_name(&self) -> &'static str {
        self.status.as_str()
    }

    fn set_status(&mut self, status: &str) -> DbResult<()> {
        self.status = status.parse()?;
        Ok(())
    }

    fn into_any(self) -> AnyJob {
        AnyJob::Analytics(self)
    }
}

impl Stored for JobSequencer {
    fn header_mut(&mut self) -> &mut JobHeader {
        &mut self.header
    }

    fn status_name(&self) -> &'static str {
        self.status.as_str()
    }

    fn set_status(&mut self, status: &str) -> DbResult<()> {
        self.status = status.parse()?;
        Ok(())
    }

    fn apply_fields(&mut self, patch: &JobPatch) {
        if let Some(ids) = &patch.next_job_ids {
            self.next_job_ids = ids.clone();
        }
    }

    fn into_any(self) -> AnyJob {
        AnyJob::Sequencer(self)
    }
}

#[derive(Default)]
struct Tables {
    describe: BTreeMap<JobId, DescribeConnectionJob>,
    compliance: BTreeMap<JobId, ComplianceJob>,
    runners: BTreeMap<JobId, ComplianceRunner>,
    summarizers: BTreeMap<JobId, ComplianceSummarizer>,
    analytics: BTreeMap<JobId, AnalyticsJob>,
    sequencers: BTreeMap<JobId, JobSequencer>,
}

/// Run `$body` against the table for `$kind`, bound to `$t`.
macro_rules! on_table {
    ($tables:expr, $kind:expr, $t:ident => $body:expr) => {
        match $kind {
            JobKind::Describe => {
                let $t = &$tables.describe;
                $body
            }
            JobKind::Compliance => {
                let $t = &$tables.compliance;
                $body
            }
            JobKind::ComplianceRunner => {
                let $t = &$tables.runners;
                $body
            }
            JobKind::ComplianceSummarizer => {
                let $t = &$tables.summarizers;
                $body
            }
            JobKind::Analytics => {
                let $t = &$tables.analytics;
                $body
            }
            JobKind::Sequencer => {
                let $t = &$tables.sequencers;
                $body
            }
        }
    };
}

macro_rules! on_table_mut {
    ($tables:expr, $kind:expr, $t:ident => $body:expr) => {
        match $kind {
            JobKind::Describe => {
                let $t = &mut $tables.describe;
                $body
            }
            JobKind::Compliance => {
                let $t = &mut $tables.compliance;
                $body
            }
            JobKind::ComplianceRunner => {
                let $t = &mut $tables.runners;
                $body
            }
            JobKind::ComplianceSummarizer => {
                let $t = &mut $tables.summarizers;
                $body
            }
            JobKind::Analytics => {
                let $t = &mut $tables.analytics;
                $body
            }
            JobKind::Sequencer => {
                let $t = &mut $tables.sequencers;
                $body
            }
        }
    };
}

fn matching<'a, T: Stored>(
    table: &'a BTreeMap<JobId, T>,
    filter: &'a JobFilter,
) -> impl Iterator<Item = &'a T> + 'a {
    table
        .values()
        .filter(move |r| filter.matches_header(r.header(), r.status_name()) && r.matches_fields(filter))
}

fn list<T: Stored>(table: &BTreeMap<JobId, T>, filter: &JobFilter) -> Vec<T> {
    let mut rows: Vec<T> = matching(table, filter).cloned().collect();
    rows.sort_by_key(|r| (r.header().created_at, r.header().id));
    if let Some(limit) = filter.limit {
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
    rows
}

fn insert<T: Stored>(table: &mut BTreeMap<JobId, T>, rows: &[T]) -> DbResult<()> {
    if let Some(dup) = rows.iter().find(|r| table.contains_key(&r.id())) {
        return Err(DbError::Duplicate(format!("{} {}", dup.kind(), dup.id())));
    }
    for row in rows {
        table.insert(row.id(), row.clone());
    }
    Ok(())
}

fn apply<T: Stored>(
    table: &mut BTreeMap<JobId, T>,
    id: JobId,
    transition: &Transition,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let Some(row) = table.get_mut(&id) else {
        return Ok(false);
    };
    if !transition.allows(row.status_name(), row.header().retry_count) {
        return Ok(false);
    }
    row.set_status(transition.to)?;
    transition.patch.apply_to_header(row.header_mut(), now);
    row.apply_fields(&transition.patch);
    Ok(true)
}

fn delete_terminal<T: Stored>(table: &mut BTreeMap<JobId, T>, cutoff: DateTime<Utc>) -> u64 {
    let before = table.len();
    table.retain(|_, r| !(r.is_terminal() && r.header().updated_at < cutoff));
    (before - table.len()) as u64
}

/// Job store held entirely in memory.
pub struct MemoryJobStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_describe_jobs(&self, jobs: &[DescribeConnectionJob]) -> DbResult<()> {
        insert(&mut self.tables.write().await.describe, jobs)
    }

    async fn get_describe_job(&self, id: JobId) -> DbResult<DescribeConnectionJob> {
        self.tables
            .read()
            .await
            .describe
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("describe job {}", id)))
    }

    async fn last_describe_job(
        &self,
        connection_id: &str,
        resource_type: &str,
    ) -> DbResult<Option<DescribeConnectionJob>> {
        let tables = self.tables.read().await;
        Ok(tables
            .describe
            .values()
            .filter(|j| j.connection_id == connection_id && j.resource_type == resource_type)
            .max_by_key(|j| (j.header.created_at, j.header.id))
            .cloned())
    }

    async fn list_describe_jobs(&self, filter: &JobFilter) -> DbResult<Vec<DescribeConnectionJob>> {
        Ok(list(&self.tables.read().await.describe, filter))
    }

    async fn describe_in_flight_by_type(&self) -> DbResult<HashMap<String, u64>> {
        let tables = self.tables.read().await;
        let mut counts = HashMap::new();
        for job in tables.describe.values().filter(|j| {
            matches!(j.status, DescribeStatus::Queued | DescribeStatus::InProgress)
        }) {
            *counts.entry(job.resource_type.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn insert_compliance_job(&self, job: &ComplianceJob) -> DbResult<()> {
        insert(
            &mut self.tables.write().await.compliance,
            std::slice::from_ref(job),
        )
    }

    async fn get_compliance_job(&self, id: JobId) -> DbResult<ComplianceJob> {
        self.tables
            .read()
            .await
            .compliance
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("compliance job {}", id)))
    }

    async fn list_compliance_jobs(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceJob>> {
        Ok(list(&self.tables.read().await.compliance, filter))
    }

    async fn insert_runners(&self, runners: &[ComplianceRunner]) -> DbResult<()> {
        insert(&mut self.tables.write().await.runners, runners)
    }

    async fn list_runners(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceRunner>> {
        Ok(list(&self.tables.read().await.runners, filter))
    }

    async fn insert_summarizer(&self, summarizer: &ComplianceSummarizer) -> DbResult<()> {
        let mut tables = self.tables.write().await;
        // One summarizer per compliance job.
        if let Some(parent) = summarizer.header.parent_id {
            if tables
                .summarizers
                .values()
                .any(|s| s.header.parent_id == Some(parent))
            {
                return Err(DbError::Duplicate(format!("summarizer for {}", parent)));
            }
        }
        insert(&mut tables.summarizers, std::slice::from_ref(summarizer))
    }

    async fn list_summarizers(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceSummarizer>> {
        Ok(list(&self.tables.read().await.summarizers, filter))
    }

    async fn purge_compliance_jobs(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.compliance.len();
        tables.compliance.retain(|_, j| j.header.created_at >= cutoff);
        let removed = (before - tables.compliance.len()) as u64;

        let Tables {
            compliance,
            runners,
            summarizers,
            ..
        } = &mut *tables;
        let orphaned =
            |parent: Option<JobId>| parent.is_some_and(|p| !compliance.contains_key(&p));
        runners.retain(|_, r| r.header.created_at >= cutoff && !orphaned(r.header.parent_id));
        summarizers.retain(|_, s| s.header.created_at >= cutoff && !orphaned(s.header.parent_id));
        Ok(removed)
    }

    async fn insert_analytics_job(&self, job: &AnalyticsJob) -> DbResult<()> {
        insert(
            &mut self.tables.write().await.analytics,
            std::slice::from_ref(job),
        )
    }

    async fn list_analytics_jobs(&self, filter: &JobFilter) -> DbResult<Vec<AnalyticsJob>> {
        Ok(list(&self.tables.read().await.analytics, filter))
    }

    async fn insert_sequencer(&self, sequencer: &JobSequencer) -> DbResult<()> {
        insert(
            &mut self.tables.write().await.sequencers,
            std::slice::from_ref(sequencer),
        )
    }

    async fn list_sequencers(&self, filter: &JobFilter) -> DbResult<Vec<JobSequencer>> {
        Ok(list(&self.tables.read().await.sequencers, filter))
    }

    async fn get_job(&self, kind: JobKind, id: JobId) -> DbResult<AnyJob> {
        let tables = self.tables.read().await;
        on_table!(tables, kind, t => t.get(&id).cloned().map(Stored::into_any))
            .ok_or_else(|| DbError::NotFound(format!("{} job {}", kind, id)))
    }

    async fn job_statuses(
        &self,
        kind: JobKind,
        ids: &[JobId],
    ) -> DbResult<HashMap<JobId, AnyStatus>> {
        let tables = self.tables.read().await;
        Ok(on_table!(tables, kind, t => ids
            .iter()
            .filter_map(|id| t.get(id).map(|r| (*id, r.any_status())))
            .collect()))
    }

    async fn transition(&self, id: JobId, transition: &Transition) -> DbResult<bool> {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;
        on_table_mut!(tables, transition.kind, t => apply(t, id, transition, now))
    }

    async fn count_jobs(&self, kind: JobKind, filter: &JobFilter) -> DbResult<u64> {
        let tables = self.tables.read().await;
        Ok(on_table!(tables, kind, t => matching(t, filter).count() as u64))
    }

    async fn count_by_status(
        &self,
        kind: JobKind,
        filter: &JobFilter,
    ) -> DbResult<BTreeMap<String, u64>> {
        let tables = self.tables.read().await;
        let mut counts = BTreeMap::new();
        on_table!(tables, kind, t => {
            for row in matching(t, filter) {
                *counts.entry(row.status_name().to_string()).or_insert(0) += 1;
            }
        });
        Ok(counts)
    }

    async fn delete_terminal_jobs(&self, kind: JobKind, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let mut tables = self.tables.write().await;
        Ok(on_table_mut!(tables, kind, t => delete_terminal(t, cutoff)))
    }
}
