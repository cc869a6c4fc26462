//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::job::{
    AnalyticsJob, ComplianceJob, ComplianceRunner, ComplianceSummarizer, DescribeConnectionJob,
    DescribeStatus, JobSequencer,
};
use nimbus_core::{AnyJob, AnyStatus, Clock, JobHeader, JobId, JobKind, SystemClock, Transition};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::{DbError, DbResult, JobFilter, JobStore};

/// Rows per multi-value INSERT; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1000;

fn table(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Describe => "describe_jobs",
        JobKind::Compliance => "compliance_jobs",
        JobKind::ComplianceRunner => "compliance_runners",
        JobKind::ComplianceSummarizer => "compliance_summarizers",
        JobKind::Analytics => "analytics_jobs",
        JobKind::Sequencer => "job_sequencers",
    }
}

fn count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn insert_error(err: sqlx::Error, what: &str) -> DbError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => DbError::Duplicate(what.to_string()),
        _ => DbError::Database(err),
    }
}

/// Columns shared by every job table.
#[derive(Debug, Clone, FromRow)]
struct HeaderRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    retry_count: i32,
    failure_message: Option<String>,
    error_code: Option<String>,
}

impl HeaderRow {
    fn into_header(self) -> (JobHeader, String) {
        let header = JobHeader {
            id: self.id.into(),
            parent_id: self.parent_id.map(Into::into),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            failure_message: self.failure_message,
            error_code: self.error_code,
        };
        (header, self.status)
    }
}

#[derive(Debug, FromRow)]
struct DescribeRow {
    #[sqlx(flatten)]
    header: HeaderRow,
    connection_id: String,
    connector: String,
    resource_type: String,
    discovery_type: String,
    trigger_type: String,
    described_resource_count: i64,
    deleting_count: i64,
}

impl TryFrom<DescribeRow> for DescribeConnectionJob {
    type Error = DbError;

    fn try_from(row: DescribeRow) -> DbResult<Self> {
        let (header, status) = row.header.into_header();
        Ok(Self {
            header,
            status: status.parse()?,
            connection_id: row.connection_id,
            connector: row.connector.parse()?,
            resource_type: row.resource_type,
            discovery_type: row.discovery_type.parse()?,
            trigger_type: row.trigger_type.parse()?,
            described_resource_count: row.described_resource_count.max(0) as u64,
            deleting_count: row.deleting_count.max(0) as u64,
        })
    }
}

#[derive(Debug, FromRow)]
struct ComplianceRow {
    #[sqlx(flatten)]
    header: HeaderRow,
    benchmark_id: String,
    connection_ids: Vec<String>,
    control_ids: Vec<String>,
    trigger_type: String,
}

impl TryFrom<ComplianceRow> for ComplianceJob {
    type Error = DbError;

    fn try_from(row: ComplianceRow) -> DbResult<Self> {
        let (header, status) = row.header.into_header();
        Ok(Self {
            header,
            status: status.parse()?,
            benchmark_id: row.benchmark_id,
            connection_ids: row.connection_ids,
            control_ids: row.control_ids,
            trigger_type: row.trigger_type.parse()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunnerRow {
    #[sqlx(flatten)]
    header: HeaderRow,
    benchmark_id: String,
    control_ids: Vec<String>,
    connection_ids: Vec<String>,
    total_finding_count: i64,
}

impl TryFrom<RunnerRow> for ComplianceRunner {
    type Error = DbError;

    fn try_from(row: RunnerRow) -> DbResult<Self> {
        let (header, status) = row.header.into_header();
        Ok(Self {
            header,
            status: status.parse()?,
            benchmark_id: row.benchmark_id,
            control_ids: row.control_ids,
            connection_ids: row.connection_ids,
            total_finding_count: row.total_finding_count.max(0) as u64,
        })
    }
}

#[derive(Debug, FromRow)]
struct SummarizerRow {
    #[sqlx(flatten)]
    header: HeaderRow,
    benchmark_id: String,
}

impl TryFrom<SummarizerRow> for ComplianceSummarizer {
    type Error = DbError;

    fn try_from(row: SummarizerRow) -> DbResult<Self> {
        let (header, status) = row.header.into_header();
        Ok(Self {
            header,
            status: status.parse()?,
            benchmark_id: row.benchmark_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct AnalyticsRow {
    #[sqlx(flatten)]
    header: HeaderRow,
    analytics_type: String,
}

impl TryFrom<AnalyticsRow> for AnalyticsJob {
    type Error = DbError;

    fn try_from(row: AnalyticsRow) -> DbResult<Self> {
        let (header, status) = row.header.into_header();
        Ok(Self {
            header,
            status: status.parse()?,
            analytics_type: row.analytics_type.parse()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct SequencerRow {
    #[sqlx(flatten)]
    header: HeaderRow,
    dependency_source: String,
    dependency_list: Vec<Uuid>,
    next_job: String,
    next_job_parameters: serde_json::Value,
    next_job_ids: Vec<Uuid>,
}

impl TryFrom<SequencerRow> for JobSequencer {
    type Error = DbError;

    fn try_from(row: SequencerRow) -> DbResult<Self> {
        let (header, status) = row.header.into_header();
        Ok(Self {
            header,
            status: status.parse()?,
            dependency_source: row.dependency_source.parse()?,
            dependency_list: row.dependency_list.into_iter().map(Into::into).collect(),
            next_job: row.next_job.parse()?,
            next_job_parameters: row.next_job_parameters,
            next_job_ids: row.next_job_ids.into_iter().map(Into::into).collect(),
        })
    }
}

/// Append `WHERE` conditions for `filter`. Kind-specific fields the table
/// does not have are skipped.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, kind: JobKind, filter: &JobFilter) {
    qb.push(" WHERE 1=1");

    if !filter.statuses.is_empty() {
        qb.push(" AND status = ANY(");
        qb.push_bind(filter.statuses.clone());
        qb.push(")");
    }
    if !filter.ids.is_empty() {
        let ids: Vec<Uuid> = filter.ids.iter().map(|id| *id.as_uuid()).collect();
        qb.push(" AND id = ANY(");
        qb.push_bind(ids);
        qb.push(")");
    }
    if let Some(parent) = filter.parent_id {
        qb.push(" AND parent_id = ");
        qb.push_bind(*parent.as_uuid());
    }
    if let Some(at) = filter.created_after {
        qb.push(" AND created_at > ");
        qb.push_bind(at);
    }
    if let Some(at) = filter.created_before {
        qb.push(" AND created_at < ");
        qb.push_bind(at);
    }
    if let Some(at) = filter.updated_after {
        qb.push(" AND updated_at > ");
        qb.push_bind(at);
    }
    if let Some(at) = filter.updated_before {
        qb.push(" AND updated_at < ");
        qb.push_bind(at);
    }
    if let Some(at) = filter.started_after {
        qb.push(" AND started_at > ");
        qb.push_bind(at);
    }
    if let Some(max) = filter.retry_count_below {
        qb.push(" AND retry_count < ");
        qb.push_bind(i32::try_from(max).unwrap_or(i32::MAX));
    }

    match kind {
        JobKind::Describe => {
            if let Some(connection) = &filter.connection_id {
                qb.push(" AND connection_id = ");
                qb.push_bind(connection.clone());
            }
            if let Some(resource_type) = &filter.resource_type {
                qb.push(" AND resource_type = ");
                qb.push_bind(resource_type.clone());
            }
        }
        JobKind::Compliance | JobKind::ComplianceRunner => {
            if let Some(connection) = &filter.connection_id {
                qb.push(" AND ");
                qb.push_bind(connection.clone());
                qb.push(" = ANY(connection_ids)");
            }
            if let Some(benchmark) = &filter.benchmark_id {
                qb.push(" AND benchmark_id = ");
                qb.push_bind(benchmark.clone());
            }
        }
        JobKind::ComplianceSummarizer => {
            if let Some(benchmark) = &filter.benchmark_id {
                qb.push(" AND benchmark_id = ");
                qb.push_bind(benchmark.clone());
            }
        }
        JobKind::Analytics | JobKind::Sequencer => {}
    }
}

/// Job store backed by PostgreSQL.
pub struct PgJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn select<R>(&self, kind: JobKind, filter: &JobFilter) -> DbResult<Vec<R>>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {}", table(kind)));
        push_filter(&mut qb, kind, filter);
        qb.push(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(count(limit));
        }
        let rows = qb.build_query_as::<R>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn select_one<R>(&self, kind: JobKind, id: JobId) -> DbResult<R>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let sql = format!("SELECT * FROM {} WHERE id = $1", table(kind));
        sqlx::query_as::<_, R>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("{} job {}", kind, id)))
    }
}

fn convert<R, T>(rows: Vec<R>) -> DbResult<Vec<T>>
where
    T: TryFrom<R, Error = DbError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn push_header_values(
    b: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    header: &JobHeader,
    status: &'static str,
) {
    b.push_bind(*header.id.as_uuid())
        .push_bind(header.parent_id.map(|p| *p.as_uuid()))
        .push_bind(status)
        .push_bind(header.created_at)
        .push_bind(header.updated_at)
        .push_bind(header.started_at)
        .push_bind(i32::try_from(header.retry_count).unwrap_or(i32::MAX))
        .push_bind(header.failure_message.clone())
        .push_bind(header.error_code.clone());
}

const HEADER_COLUMNS: &str =
    "id, parent_id, status, created_at, updated_at, started_at, retry_count, failure_message, error_code";

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_describe_jobs(&self, jobs: &[DescribeConnectionJob]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in jobs.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO describe_jobs ({HEADER_COLUMNS}, connection_id, connector, \
                 resource_type, discovery_type, trigger_type, described_resource_count, \
                 deleting_count) "
            ));
            qb.push_values(chunk, |mut b, job| {
                push_header_values(&mut b, &job.header, job.status.as_str());
                b.push_bind(job.connection_id.clone())
                    .push_bind(job.connector.as_str())
                    .push_bind(job.resource_type.clone())
                    .push_bind(job.discovery_type.as_str())
                    .push_bind(job.trigger_type.as_str())
                    .push_bind(count(job.described_resource_count))
                    .push_bind(count(job.deleting_count));
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| insert_error(e, "describe job"))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_describe_job(&self, id: JobId) -> DbResult<DescribeConnectionJob> {
        self.select_one::<DescribeRow>(JobKind::Describe, id)
            .await?
            .try_into()
    }

    async fn last_describe_job(
        &self,
        connection_id: &str,
        resource_type: &str,
    ) -> DbResult<Option<DescribeConnectionJob>> {
        let row = sqlx::query_as::<_, DescribeRow>(
            r#"
            SELECT * FROM describe_jobs
            WHERE connection_id = $1 AND resource_type = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(connection_id)
        .bind(resource_type)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DescribeConnectionJob::try_from).transpose()
    }

    async fn list_describe_jobs(&self, filter: &JobFilter) -> DbResult<Vec<DescribeConnectionJob>> {
        convert(self.select::<DescribeRow>(JobKind::Describe, filter).await?)
    }

    async fn describe_in_flight_by_type(&self) -> DbResult<HashMap<String, u64>> {
        let in_flight = vec![
            DescribeStatus::Queued.to_string(),
            DescribeStatus::InProgress.to_string(),
        ];
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT resource_type, COUNT(*) FROM describe_jobs
            WHERE status = ANY($1)
            GROUP BY resource_type
            "#,
        )
        .bind(in_flight)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(rt, n)| (rt, n.max(0) as u64))
            .collect())
    }

    async fn insert_compliance_job(&self, job: &ComplianceJob) -> DbResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO compliance_jobs ({HEADER_COLUMNS}, benchmark_id, connection_ids, \
             control_ids, trigger_type) "
        ));
        qb.push_values(std::slice::from_ref(job), |mut b, job| {
            push_header_values(&mut b, &job.header, job.status.as_str());
            b.push_bind(job.benchmark_id.clone())
                .push_bind(job.connection_ids.clone())
                .push_bind(job.control_ids.clone())
                .push_bind(job.trigger_type.as_str());
        });
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "compliance job"))?;
        Ok(())
    }

    async fn get_compliance_job(&self, id: JobId) -> DbResult<ComplianceJob> {
        self.select_one::<ComplianceRow>(JobKind::Compliance, id)
            .await?
            .try_into()
    }

    async fn list_compliance_jobs(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceJob>> {
        convert(self.select::<ComplianceRow>(JobKind::Compliance, filter).await?)
    }

    async fn insert_runners(&self, runners: &[ComplianceRunner]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in runners.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO compliance_runners ({HEADER_COLUMNS}, benchmark_id, control_ids, \
                 connection_ids, total_finding_count) "
            ));
            qb.push_values(chunk, |mut b, runner| {
                push_header_values(&mut b, &runner.header, runner.status.as_str());
                b.push_bind(runner.benchmark_id.clone())
                    .push_bind(runner.control_ids.clone())
                    .push_bind(runner.connection_ids.clone())
                    .push_bind(count(runner.total_finding_count));
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| insert_error(e, "compliance runner"))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_runners(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceRunner>> {
        convert(self.select::<RunnerRow>(JobKind::ComplianceRunner, filter).await?)
    }

    async fn insert_summarizer(&self, summarizer: &ComplianceSummarizer) -> DbResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO compliance_summarizers ({HEADER_COLUMNS}, benchmark_id) "
        ));
        qb.push_values(std::slice::from_ref(summarizer), |mut b, s| {
            push_header_values(&mut b, &s.header, s.status.as_str());
            b.push_bind(s.benchmark_id.clone());
        });
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "compliance summarizer"))?;
        Ok(())
    }

    async fn list_summarizers(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceSummarizer>> {
        convert(
            self.select::<SummarizerRow>(JobKind::ComplianceSummarizer, filter)
                .await?,
        )
    }

    async fn purge_compliance_jobs(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        // Runners and summarizers go with their parent (ON DELETE CASCADE).
        let result = sqlx::query("DELETE FROM compliance_jobs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        debug!(cutoff = %cutoff, deleted = result.rows_affected(), "Purged compliance jobs");
        Ok(result.rows_affected())
    }

    async fn insert_analytics_job(&self, job: &AnalyticsJob) -> DbResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO analytics_jobs ({HEADER_COLUMNS}, analytics_type) "
        ));
        qb.push_values(std::slice::from_ref(job), |mut b, job| {
            push_header_values(&mut b, &job.header, job.status.as_str());
            b.push_bind(job.analytics_type.as_str());
        });
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "analytics job"))?;
        Ok(())
    }

    async fn list_analytics_jobs(&self, filter: &JobFilter) -> DbResult<Vec<AnalyticsJob>> {
        convert(self.select::<AnalyticsRow>(JobKind::Analytics, filter).await?)
    }

    async fn insert_sequencer(&self, sequencer: &JobSequencer) -> DbResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO job_sequencers ({HEADER_COLUMNS}, dependency_source, dependency_list, \
             next_job, next_job_parameters, next_job_ids) "
        ));
        qb.push_values(std::slice::from_ref(sequencer), |mut b, s| {
            push_header_values(&mut b, &s.header, s.status.as_str());
            b.push_bind(s.dependency_source.as_str())
                .push_bind(
                    s.dependency_list
                        .iter()
                        .map(|id| *id.as_uuid())
                        .collect::<Vec<_>>(),
                )
                .push_bind(s.next_job.as_str())
                .push_bind(s.next_job_parameters.clone())
                .push_bind(
                    s.next_job_ids
                        .iter()
                        .map(|id| *id.as_uuid())
                        .collect::<Vec<_>>(),
                );
        });
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "job sequencer"))?;
        Ok(())
    }

    async fn list_sequencers(&self, filter: &JobFilter) -> DbResult<Vec<JobSequencer>> {
        convert(self.select::<SequencerRow>(JobKind::Sequencer, filter).await?)
    }

    async fn get_job(&self, kind: JobKind, id: JobId) -> DbResult<AnyJob> {
        Ok(match kind {
            JobKind::Describe => {
                AnyJob::Describe(self.select_one::<DescribeRow>(kind, id).await?.try_into()?)
            }
            JobKind::Compliance => {
                AnyJob::Compliance(self.select_one::<ComplianceRow>(kind, id).await?.try_into()?)
            }
            JobKind::ComplianceRunner => AnyJob::ComplianceRunner(
                self.select_one::<RunnerRow>(kind, id).await?.try_into()?,
            ),
            JobKind::ComplianceSummarizer => AnyJob::ComplianceSummarizer(
                self.select_one::<SummarizerRow>(kind, id).await?.try_into()?,
            ),
            JobKind::Analytics => {
                AnyJob::Analytics(self.select_one::<AnalyticsRow>(kind, id).await?.try_into()?)
            }
            JobKind::Sequencer => {
                AnyJob::Sequencer(self.select_one::<SequencerRow>(kind, id).await?.try_into()?)
            }
        })
    }

    async fn job_statuses(
        &self,
        kind: JobKind,
        ids: &[JobId],
    ) -> DbResult<HashMap<JobId, AnyStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let sql = format!("SELECT id, status FROM {} WHERE id = ANY($1)", table(kind));
        let rows = sqlx::query_as::<_, (Uuid, String)>(&sql)
            .bind(uuids)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(id, status)| Ok((JobId::from(id), kind.parse_status(&status)?)))
            .collect()
    }

    async fn transition(&self, id: JobId, transition: &Transition) -> DbResult<bool> {
        let now = self.clock.now();
        let patch = &transition.patch;

        let mut qb =
            QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", table(transition.kind)));
        {
            let mut set = qb.separated(", ");
            set.push("status = ").push_bind_unseparated(transition.to);
            set.push("updated_at = ").push_bind_unseparated(now);
            if patch.mark_started {
                set.push("started_at = COALESCE(started_at, ")
                    .push_bind_unseparated(now)
                    .push_unseparated(")");
            }
            if patch.increment_retry {
                set.push("retry_count = retry_count + 1");
            }
            match (&patch.failure_message, patch.clear_failure) {
                (Some(message), _) => {
                    set.push("failure_message = ")
                        .push_bind_unseparated(message.clone());
                }
                (None, true) => {
                    set.push("failure_message = NULL");
                }
                (None, false) => {}
            }
            match (&patch.error_code, patch.clear_failure) {
                (Some(code), _) => {
                    set.push("error_code = ").push_bind_unseparated(code.clone());
                }
                (None, true) => {
                    set.push("error_code = NULL");
                }
                (None, false) => {}
            }
            match transition.kind {
                JobKind::Describe => {
                    if let Some(n) = patch.described_resource_count {
                        set.push("described_resource_count = ")
                            .push_bind_unseparated(count(n));
                    }
                    if let Some(n) = patch.deleting_count {
                        set.push("deleting_count = ").push_bind_unseparated(count(n));
                    }
                }
                JobKind::ComplianceRunner => {
                    if let Some(n) = patch.total_finding_count {
                        set.push("total_finding_count = ")
                            .push_bind_unseparated(count(n));
                    }
                }
                JobKind::Sequencer => {
                    if let Some(ids) = &patch.next_job_ids {
                        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
                        set.push("next_job_ids = ").push_bind_unseparated(uuids);
                    }
                }
                _ => {}
            }
        }
        qb.push(" WHERE id = ");
        qb.push_bind(*id.as_uuid());
        qb.push(" AND status = ANY(");
        qb.push_bind(
            transition
                .from
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
        );
        qb.push(")");
        if let Some(max) = transition.max_retries {
            qb.push(" AND retry_count < ");
            qb.push_bind(i32::try_from(max).unwrap_or(i32::MAX));
        }

        let result = qb.build().execute(&self.pool).await?;
        let applied = result.rows_affected() == 1;
        if !applied {
            debug!(job_id = %id, kind = %transition.kind, to = transition.to, "Transition guard not met");
        }
        Ok(applied)
    }

    async fn count_jobs(&self, kind: JobKind, filter: &JobFilter) -> DbResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {}", table(kind)));
        push_filter(&mut qb, kind, filter);
        let (n,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    async fn count_by_status(
        &self,
        kind: JobKind,
        filter: &JobFilter,
    ) -> DbResult<BTreeMap<String, u64>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT status, COUNT(*) FROM {}", table(kind)));
        push_filter(&mut qb, kind, filter);
        qb.push(" GROUP BY status");
        let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(status, n)| (status, n.max(0) as u64))
            .collect())
    }

    async fn delete_terminal_jobs(&self, kind: JobKind, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let active = kind.active_statuses();
        let terminal: Vec<String> = kind
            .statuses()
            .into_iter()
            .filter(|s| !active.contains(s))
            .map(String::from)
            .collect();
        let sql = format!(
            "DELETE FROM {} WHERE status = ANY($1) AND updated_at < $2",
            table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(terminal)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
