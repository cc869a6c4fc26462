//! The compliance pipeline.
//!
//! A benchmark run fans out into runners (one per control group and
//! connection), then exactly one summarizer once the runners are effectively
//! complete, then an optional sink stage. Each phase is a separate step of
//! the tick and advances jobs only through compare-and-set transitions, so a
//! phase can fail without stalling the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_config::ComplianceConfig;
use nimbus_core::compliance::{ComplianceCatalog, FindingIndex};
use nimbus_core::connection::ConnectionDirectory;
use nimbus_core::job::{
    ComplianceJob, ComplianceJobStatus, ComplianceRunner, ComplianceSummarizer, JobHeader,
    TaskStatus,
};
use nimbus_core::resource::TriggerType;
use nimbus_core::{Clock, Error, JobId, JobKind, JobPatch, JobRecord, Result, Transition};
use nimbus_db::{DbError, JobFilter, JobStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::dispatcher::{Dispatcher, dispatch_created};
use crate::ticker::PeriodicTask;
use crate::{cutoff, list_jobs};

/// A child that ended without producing its output.
fn unsuccessful(status: &TaskStatus) -> bool {
    status.is_failure() || *status == TaskStatus::Canceled
}

/// Final status of a benchmark run from the statuses of its children.
/// Runners still running after a threshold completion do not count against
/// the run; a summarizer must have succeeded.
pub fn reduce_completion(runners: &[TaskStatus], summarizer: TaskStatus) -> ComplianceJobStatus {
    if runners.iter().any(unsuccessful) || summarizer != TaskStatus::Succeeded {
        ComplianceJobStatus::Failed
    } else {
        ComplianceJobStatus::Succeeded
    }
}

/// Units of work for a run: each chunk of `per_runner` controls against
/// each connection.
pub fn runner_batches(
    controls: &[String],
    connections: &[String],
    per_runner: usize,
) -> Vec<(Vec<String>, String)> {
    controls
        .chunks(per_runner.max(1))
        .flat_map(|chunk| {
            connections
                .iter()
                .map(move |connection| (chunk.to_vec(), connection.clone()))
        })
        .collect()
}

pub struct ComplianceScheduler {
    store: Arc<dyn JobStore>,
    catalog: Arc<dyn ComplianceCatalog>,
    directory: Arc<dyn ConnectionDirectory>,
    findings: Arc<dyn FindingIndex>,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<Dispatcher>,
    config: ComplianceConfig,
    clock: Arc<dyn Clock>,
    triggering: Mutex<()>,
}

impl ComplianceScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        catalog: Arc<dyn ComplianceCatalog>,
        directory: Arc<dyn ConnectionDirectory>,
        findings: Arc<dyn FindingIndex>,
        admission: Arc<AdmissionController>,
        dispatcher: Arc<Dispatcher>,
        config: ComplianceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            directory,
            findings,
            admission,
            dispatcher,
            config,
            clock,
            triggering: Mutex::new(()),
        }
    }

    /// Start a benchmark run.
    ///
    /// Fails with `NotFound` for an unknown benchmark or connection and with
    /// `JobInProgress` while a run of the same benchmark is active.
    pub async fn trigger_benchmark(
        &self,
        benchmark_id: &str,
        connection_ids: &[String],
        control_ids: &[String],
        trigger: TriggerType,
    ) -> Result<JobId> {
        if connection_ids.is_empty() {
            return Err(Error::InvalidInput("no connections given".into()));
        }
        self.catalog.get_benchmark(benchmark_id).await?;
        for connection_id in connection_ids {
            self.directory.get_connection(connection_id).await?;
        }

        let _triggering = self.triggering.lock().await;
        let active = self
            .store
            .count_jobs(
                JobKind::Compliance,
                &JobFilter::new()
                    .benchmark(benchmark_id)
                    .status_names(JobKind::Compliance.active_statuses()),
            )
            .await?;
        if active > 0 {
            return Err(Error::JobInProgress(format!(
                "benchmark {benchmark_id} is already running"
            )));
        }

        let job = ComplianceJob {
            header: JobHeader::new(self.clock.now()),
            status: ComplianceJobStatus::Created,
            benchmark_id: benchmark_id.to_string(),
            connection_ids: connection_ids.to_vec(),
            control_ids: control_ids.to_vec(),
            trigger_type: trigger,
        };
        self.store.insert_compliance_job(&job).await?;
        info!(
            job_id = %job.header.id,
            benchmark_id,
            connections = connection_ids.len(),
            "Benchmark run created"
        );
        Ok(job.header.id)
    }

    /// Controls a run evaluates. Explicit control ids win; otherwise the
    /// benchmark tree is walked, children included, without duplicates.
    async fn expand_controls(&self, job: &ComplianceJob) -> Result<Vec<String>> {
        if !job.control_ids.is_empty() {
            let mut seen = HashSet::new();
            return Ok(job
                .control_ids
                .iter()
                .filter(|c| seen.insert(c.as_str()))
                .cloned()
                .collect());
        }

        let mut seen = HashSet::new();
        let mut controls = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![job.benchmark_id.clone()];
        while let Some(id) = pending.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let benchmark = self.catalog.get_benchmark(&id).await?;
            for control in benchmark.controls {
                if seen.insert(control.clone()) {
                    controls.push(control);
                }
            }
            pending.extend(benchmark.children.into_iter().rev());
        }
        Ok(controls)
    }

    async fn fail_job(&self, job_id: JobId, from: ComplianceJobStatus, error: &Error) -> Result<()> {
        warn!(job_id = %job_id, error = %error, "Benchmark run failed");
        let fail = Transition::compliance(&[from], ComplianceJobStatus::Failed).with_patch(
            JobPatch::failure(error.to_string()).with_error_code(error.code()),
        );
        self.store.transition(job_id, &fail).await?;
        Ok(())
    }

    /// Fan new runs out into runners.
    async fn create_runners(&self) -> Result<usize> {
        let jobs = self
            .store
            .list_compliance_jobs(&JobFilter::new().statuses(&[ComplianceJobStatus::Created]))
            .await?;

        let mut created = 0;
        for job in jobs {
            let id = job.header.id;
            let controls = match self.expand_controls(&job).await {
                Ok(controls) if controls.is_empty() => {
                    let e = Error::Configuration(format!(
                        "benchmark {} has no controls",
                        job.benchmark_id
                    ));
                    self.fail_job(id, ComplianceJobStatus::Created, &e).await?;
                    continue;
                }
                Ok(controls) => controls,
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %id, error = %e, "Catalog unavailable, retrying next tick");
                    continue;
                }
                Err(e) => {
                    self.fail_job(id, ComplianceJobStatus::Created, &e).await?;
                    continue;
                }
            };

            let claim = Transition::compliance(
                &[ComplianceJobStatus::Created],
                ComplianceJobStatus::RunnersInProgress,
            )
            .with_patch(JobPatch::default().started());
            if !self.store.transition(id, &claim).await? {
                continue;
            }

            let now = self.clock.now();
            let runners: Vec<ComplianceRunner> =
                runner_batches(&controls, &job.connection_ids, self.config.controls_per_runner)
                    .into_iter()
                    .map(|(control_ids, connection_id)| ComplianceRunner {
                        header: JobHeader::new(now).with_parent(id),
                        status: TaskStatus::Created,
                        benchmark_id: job.benchmark_id.clone(),
                        control_ids,
                        connection_ids: vec![connection_id],
                        total_finding_count: 0,
                    })
                    .collect();
            // One insert for the whole fan-out: a run never holds a subset of
            // its runners.
            match self.store.insert_runners(&runners).await.map_err(Error::from) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %id, error = %e, "Runners not created, retrying next tick");
                    let release = Transition::compliance(
                        &[ComplianceJobStatus::RunnersInProgress],
                        ComplianceJobStatus::Created,
                    );
                    self.store.transition(id, &release).await?;
                    continue;
                }
                Err(e) => {
                    self.fail_job(id, ComplianceJobStatus::RunnersInProgress, &e).await?;
                    continue;
                }
            }
            info!(
                job_id = %id,
                benchmark_id = %job.benchmark_id,
                controls = controls.len(),
                runners = runners.len(),
                "Created runners"
            );
            created += runners.len();
        }
        Ok(created)
    }

    /// A runner or summarizer that will not change any more: done, or failed
    /// with no retry left.
    fn settled(&self, status: TaskStatus, header: &JobHeader, now: DateTime<Utc>) -> bool {
        match status {
            TaskStatus::Succeeded | TaskStatus::Canceled => true,
            TaskStatus::Failed | TaskStatus::TimeOut => {
                header.retry_count >= self.config.max_retries
                    || header.updated_at <= cutoff(now, self.config.retry_window)
            }
            TaskStatus::Created | TaskStatus::Queued | TaskStatus::InProgress => false,
        }
    }

    /// Re-arm recent failures of `kind` whose parent is still in `phase`.
    async fn retry_failed(&self, kind: JobKind, phase: ComplianceJobStatus) -> Result<usize> {
        let now = self.clock.now();
        let filter = JobFilter::new()
            .statuses(&[TaskStatus::Failed, TaskStatus::TimeOut])
            .updated_after(cutoff(now, self.config.retry_window))
            .retry_count_below(self.config.max_retries);
        let failed = list_jobs(self.store.as_ref(), kind, &filter).await?;
        if failed.is_empty() {
            return Ok(0);
        }

        let parents: Vec<JobId> = failed
            .iter()
            .filter_map(|j| j.header().parent_id)
            .collect();
        let parent_statuses = self
            .store
            .job_statuses(JobKind::Compliance, &parents)
            .await?;

        let retry = Transition::new(
            kind,
            &[TaskStatus::Failed, TaskStatus::TimeOut],
            TaskStatus::Created,
        )
        .retry(self.config.max_retries);
        let mut rearmed = 0;
        for job in &failed {
            let header = job.header();
            let in_phase = header
                .parent_id
                .and_then(|p| parent_statuses.get(&p))
                .is_some_and(|s| s.as_str() == phase.as_str());
            if in_phase && self.store.transition(header.id, &retry).await? {
                debug!(
                    job_id = %header.id,
                    kind = %kind,
                    retry_count = header.retry_count + 1,
                    "Re-armed"
                );
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }

    /// Whether the runners of `job` are effectively complete: all settled, or
    /// enough findings indexed and every runner quiet for the grace period.
    async fn runners_complete(
        &self,
        job: &ComplianceJob,
        runners: &[ComplianceRunner],
    ) -> Result<bool> {
        let now = self.clock.now();
        if runners.iter().all(|r| self.settled(r.status, &r.header, now)) {
            return Ok(true);
        }

        let expected: u64 = runners.iter().map(|r| r.total_finding_count).sum();
        let quiet = runners
            .iter()
            .map(|r| r.header.updated_at)
            .max()
            .is_some_and(|last| last <= cutoff(now, self.config.completion_grace));
        if expected == 0 || !quiet {
            return Ok(false);
        }
        let live = self.findings.count_findings(job.header.id).await?;
        let complete = live as f64 >= expected as f64 * self.config.completion_threshold;
        if complete {
            info!(job_id = %job.header.id, live, expected, "Runners effectively complete");
        }
        Ok(complete)
    }

    /// Create the single summarizer of each run whose runners are done.
    async fn schedule_summarizers(&self) -> Result<usize> {
        let jobs = self
            .store
            .list_compliance_jobs(
                &JobFilter::new().statuses(&[ComplianceJobStatus::RunnersInProgress]),
            )
            .await?;

        let mut created = 0;
        for job in jobs {
            let id = job.header.id;
            let runners = self.store.list_runners(&JobFilter::new().parent(id)).await?;
            if runners.is_empty() {
                let e = Error::Internal("run has no runners".into());
                self.fail_job(id, ComplianceJobStatus::RunnersInProgress, &e).await?;
                continue;
            }
            if !self.runners_complete(&job, &runners).await? {
                continue;
            }

            let claim = Transition::compliance(
                &[ComplianceJobStatus::RunnersInProgress],
                ComplianceJobStatus::SummarizerInProgress,
            );
            if !self.store.transition(id, &claim).await? {
                continue;
            }
            let summarizer = ComplianceSummarizer {
                header: JobHeader::new(self.clock.now()).with_parent(id),
                status: TaskStatus::Created,
                benchmark_id: job.benchmark_id.clone(),
            };
            match self.store.insert_summarizer(&summarizer).await {
                Ok(()) => {
                    info!(job_id = %id, summarizer_id = %summarizer.header.id, "Created summarizer");
                    created += 1;
                }
                Err(DbError::Duplicate(_)) => debug!(job_id = %id, "Summarizer already exists"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }

    /// Reduce runs whose summarizer has settled to their final status.
    async fn finish(&self) -> Result<usize> {
        let now = self.clock.now();
        let jobs = self
            .store
            .list_compliance_jobs(
                &JobFilter::new().statuses(&[ComplianceJobStatus::SummarizerInProgress]),
            )
            .await?;

        let mut finished = 0;
        for job in jobs {
            let id = job.header.id;
            let Some(summarizer) = self
                .store
                .list_summarizers(&JobFilter::new().parent(id))
                .await?
                .into_iter()
                .next()
            else {
                continue;
            };
            if !self.settled(summarizer.status, &summarizer.header, now) {
                continue;
            }

            let runners: Vec<TaskStatus> = self
                .store
                .list_runners(&JobFilter::new().parent(id))
                .await?
                .iter()
                .map(|r| r.status)
                .collect();
            let outcome = reduce_completion(&runners, summarizer.status);
            let transition = match outcome {
                ComplianceJobStatus::Failed => {
                    let failed_runners = runners.iter().filter(|s| unsuccessful(s)).count();
                    let message = if failed_runners > 0 {
                        format!("{failed_runners} of {} runners did not succeed", runners.len())
                    } else {
                        format!("summarizer {}", summarizer.status)
                    };
                    Transition::compliance(&[ComplianceJobStatus::SummarizerInProgress], outcome)
                        .with_patch(JobPatch::failure(message))
                }
                _ if self.config.sink => Transition::compliance(
                    &[ComplianceJobStatus::SummarizerInProgress],
                    ComplianceJobStatus::SinkInProgress,
                ),
                _ => Transition::compliance(&[ComplianceJobStatus::SummarizerInProgress], outcome),
            };
            if self.store.transition(id, &transition).await? {
                info!(job_id = %id, status = transition.to, "Benchmark run finished");
                finished += 1;
            }
        }
        Ok(finished)
    }

    /// Complete sink-stage runs once their summary is indexed.
    async fn sink(&self) -> Result<usize> {
        let jobs = self
            .store
            .list_compliance_jobs(&JobFilter::new().statuses(&[ComplianceJobStatus::SinkInProgress]))
            .await?;
        let done = Transition::compliance(
            &[ComplianceJobStatus::SinkInProgress],
            ComplianceJobStatus::Succeeded,
        );
        let mut sunk = 0;
        for job in jobs {
            if self.findings.summary_indexed(job.header.id).await?
                && self.store.transition(job.header.id, &done).await?
            {
                sunk += 1;
            }
        }
        Ok(sunk)
    }

    async fn purge(&self) -> Result<usize> {
        let purged = self
            .store
            .purge_compliance_jobs(cutoff(self.clock.now(), self.config.retention))
            .await?;
        if purged > 0 {
            info!(purged, "Purged old benchmark runs");
        }
        Ok(purged as usize)
    }

    async fn dispatch(&self, kind: JobKind) -> Result<usize> {
        let summary = dispatch_created(
            self.store.as_ref(),
            &self.admission,
            &self.dispatcher,
            kind,
            self.config.batch_size,
        )
        .await?;
        Ok(summary.queued)
    }
}

#[async_trait]
impl PeriodicTask for ComplianceScheduler {
    fn name(&self) -> &'static str {
        "compliance"
    }

    async fn tick(&self) -> Result<()> {
        let phases = [
            ("create-runners", self.create_runners().await),
            ("dispatch-runners", self.dispatch(JobKind::ComplianceRunner).await),
            (
                "retry-runners",
                self.retry_failed(JobKind::ComplianceRunner, ComplianceJobStatus::RunnersInProgress)
                    .await,
            ),
            ("schedule-summarizers", self.schedule_summarizers().await),
            ("dispatch-summarizers", self.dispatch(JobKind::ComplianceSummarizer).await),
            (
                "retry-summarizers",
                self.retry_failed(
                    JobKind::ComplianceSummarizer,
                    ComplianceJobStatus::SummarizerInProgress,
                )
                .await,
            ),
            ("finish", self.finish().await),
            ("sink", self.sink().await),
            ("purge", self.purge().await),
        ];
        for (phase, result) in phases {
            match result {
                Ok(0) => {}
                Ok(count) => debug!(phase, count, "Phase advanced jobs"),
                Err(e) => warn!(phase, error = %e, "Phase failed"),
            }
        }
        Ok(())
    }
}
