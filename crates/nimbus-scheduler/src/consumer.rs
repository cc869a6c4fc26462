//! Result consumption and the timeout sweep.
//!
//! The consumer applies executor results to the job store and acknowledges a
//! message only once the store update went through. Results for jobs that are
//! already terminal are acknowledged without side effects, so redelivery is
//! harmless. The sweeper forces stale jobs to a timeout state whether or not
//! a result ever arrives.

use async_trait::async_trait;
use nimbus_config::OrchestratorConfig;
use nimbus_core::cleanup::CleanupTarget;
use nimbus_core::job::{
    ComplianceJobStatus, DescribeConnectionJob, DescribeStatus, JobState, SequencerStatus,
    TaskStatus,
};
use nimbus_core::substrate::{Delivery, JobResultMessage, ResultStatus, ResultStream};
use nimbus_core::{Clock, Error, JobId, JobKind, JobPatch, JobRecord, Result, Transition};
use nimbus_db::{JobFilter, JobStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{JOBS_TIMED_OUT, MetricsSink, RESULTS_APPLIED, RESULTS_REJECTED};
use crate::ticker::PeriodicTask;
use crate::{cutoff, list_jobs};

pub const TIMEOUT_MESSAGE: &str = "Job timed out";

/// The resource ids a describe result reported, or why they cannot be used
/// to find stale resources.
fn cleanup_set(message: &JobResultMessage) -> std::result::Result<&[String], &'static str> {
    match &message.resource_ids {
        _ if message.partial => Err("partial describe result"),
        Some(ids) => Ok(ids),
        None => Err("describe result without resource ids"),
    }
}

fn failure_patch(message: &JobResultMessage, fallback: &str) -> JobPatch {
    let mut patch = JobPatch::failure(
        message
            .error
            .clone()
            .unwrap_or_else(|| fallback.to_string()),
    );
    patch.error_code = message.error_code.clone();
    patch
}

pub struct ResultConsumer {
    store: Arc<dyn JobStore>,
    stream: Arc<dyn ResultStream>,
    cleanup: Arc<dyn CleanupTarget>,
    metrics: Arc<dyn MetricsSink>,
}

impl ResultConsumer {
    pub fn new(
        store: Arc<dyn JobStore>,
        stream: Arc<dyn ResultStream>,
        cleanup: Arc<dyn CleanupTarget>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            stream,
            cleanup,
            metrics,
        }
    }

    /// Consume until `shutdown` fires or the stream closes. A message being
    /// handled when shutdown fires is finished and settled first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Result consumer started");
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = self.stream.receive() => delivery,
            };
            match delivery {
                Some(delivery) => self.handle(delivery).await,
                None => {
                    info!("Result stream closed");
                    break;
                }
            }
        }
        info!("Result consumer stopped");
    }

    /// Decode, apply and settle one delivery.
    pub async fn handle(&self, delivery: Delivery) {
        let message: JobResultMessage = match serde_json::from_slice(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "Undecodable result message");
                self.reject(delivery.tag).await;
                return;
            }
        };

        match self.apply(&message).await {
            Ok(_) => {
                if let Err(e) = self.stream.ack(delivery.tag).await {
                    warn!(tag = delivery.tag, error = %e, "Failed to ack result");
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id = %message.job_id, error = %e, "Result not applied, will be redelivered");
                if let Err(e) = self.stream.nack(delivery.tag).await {
                    warn!(tag = delivery.tag, error = %e, "Failed to nack result");
                }
            }
            Err(e) => {
                error!(job_id = %message.job_id, kind = %message.kind, error = %e, "Rejecting result");
                self.reject(delivery.tag).await;
            }
        }
    }

    async fn reject(&self, tag: u64) {
        self.metrics.increment_counter(RESULTS_REJECTED, &[]);
        if let Err(e) = self.stream.nack(tag).await {
            warn!(tag, error = %e, "Failed to nack result");
        }
    }

    /// Apply a result. Returns whether it changed the job.
    pub async fn apply(&self, message: &JobResultMessage) -> Result<bool> {
        let applied = match message.kind {
            JobKind::Describe => self.apply_describe(message).await?,
            JobKind::ComplianceRunner | JobKind::ComplianceSummarizer | JobKind::Analytics => {
                self.apply_task(message).await?
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "{other} jobs do not report results"
                )));
            }
        };
        if applied {
            self.metrics.increment_counter(
                RESULTS_APPLIED,
                &[
                    ("kind", message.kind.as_str()),
                    ("status", message.status.as_str()),
                ],
            );
        } else {
            debug!(job_id = %message.job_id, status = %message.status, "Result had no effect");
        }
        Ok(applied)
    }

    async fn apply_describe(&self, message: &JobResultMessage) -> Result<bool> {
        use DescribeStatus::*;

        let job = self.store.get_describe_job(message.job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        let transition = match message.status {
            ResultStatus::InProgress => Transition::describe(&[Queued], InProgress)
                .with_patch(JobPatch::default().started()),
            ResultStatus::Succeeded => return self.complete_describe(&job, message).await,
            ResultStatus::Failed => Transition::describe(&[Queued, InProgress], Failed)
                .with_patch(failure_patch(message, "describe failed")),
            ResultStatus::Timeout => Transition::describe(&[Queued, InProgress], Timeout)
                .with_patch(failure_patch(message, TIMEOUT_MESSAGE)),
            ResultStatus::Canceled => Transition::describe(&[Queued], Canceled),
        };
        Ok(self.store.transition(job.header.id, &transition).await?)
    }

    /// Finish a describe job, deleting resources the describer no longer
    /// reported before it reaches `Succeeded`.
    async fn complete_describe(
        &self,
        job: &DescribeConnectionJob,
        message: &JobResultMessage,
    ) -> Result<bool> {
        use DescribeStatus::*;

        let id = job.header.id;
        let patch = JobPatch {
            described_resource_count: Some(message.described_resource_count),
            ..Default::default()
        };
        let reported = match cleanup_set(message) {
            Ok(ids) => ids,
            Err(reason) => {
                warn!(job_id = %id, reason, "Skipping stale resource cleanup");
                let done = Transition::describe(&[Queued, InProgress], Succeeded).with_patch(patch);
                return Ok(self.store.transition(id, &done).await?);
            }
        };

        let missing = self.missing_resources(job, reported).await?;
        if missing.is_empty() {
            let done = Transition::describe(&[Queued, InProgress], Succeeded).with_patch(patch);
            return Ok(self.store.transition(id, &done).await?);
        }

        let deleting = Transition::describe(&[Queued, InProgress], OldResourceDeletion).with_patch(
            JobPatch {
                deleting_count: Some(missing.len() as u64),
                ..patch
            },
        );
        if !self.store.transition(id, &deleting).await? {
            return Ok(false);
        }

        info!(
            job_id = %id,
            connection_id = %job.connection_id,
            resource_type = %job.resource_type,
            count = missing.len(),
            "Deleting stale resources"
        );
        let finish = match self
            .cleanup
            .delete_resources(&job.connection_id, &job.resource_type, &missing)
            .await
        {
            Ok(()) => Transition::describe(&[OldResourceDeletion], Succeeded),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Stale resource cleanup failed");
                Transition::describe(&[OldResourceDeletion], Failed).with_patch(
                    JobPatch::failure(format!("stale resource cleanup failed: {e}"))
                        .with_error_code(e.code()),
                )
            }
        };
        self.store.transition(id, &finish).await?;
        Ok(true)
    }

    /// Previously indexed ids of the pair that are absent from `reported`.
    async fn missing_resources(
        &self,
        job: &DescribeConnectionJob,
        reported: &[String],
    ) -> Result<Vec<String>> {
        let reported: HashSet<&str> = reported.iter().map(String::as_str).collect();
        let mut missing = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .cleanup
                .existing_resource_ids(&job.connection_id, &job.resource_type, cursor)
                .await?;
            missing.extend(
                page.ids
                    .into_iter()
                    .filter(|id| !reported.contains(id.as_str())),
            );
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(missing)
    }

    async fn apply_task(&self, message: &JobResultMessage) -> Result<bool> {
        use TaskStatus::*;

        let kind = message.kind;
        let job = self.store.get_job(kind, message.job_id).await?;
        if job.is_terminal() {
            return Ok(false);
        }

        let mut progress = JobPatch::default();
        if kind == JobKind::ComplianceRunner && message.total_finding_count > 0 {
            progress.total_finding_count = Some(message.total_finding_count);
        }
        let transition = match message.status {
            ResultStatus::InProgress => {
                Transition::new(kind, &[Queued], InProgress).with_patch(progress.started())
            }
            ResultStatus::Succeeded => {
                Transition::new(kind, &[Queued, InProgress], Succeeded).with_patch(progress)
            }
            ResultStatus::Failed => Transition::new(kind, &[Queued, InProgress], Failed)
                .with_patch(failure_patch(message, &format!("{kind} failed"))),
            ResultStatus::Timeout => Transition::new(kind, &[Queued, InProgress], TimeOut)
                .with_patch(failure_patch(message, TIMEOUT_MESSAGE)),
            ResultStatus::Canceled => Transition::new(kind, &[Queued], Canceled),
        };
        Ok(self.store.transition(message.job_id, &transition).await?)
    }
}

struct TimeoutRule {
    kind: JobKind,
    transition: Transition,
    after: Duration,
}

fn rule<S: JobState>(kind: JobKind, from: &[S], to: S, after: Duration) -> TimeoutRule {
    TimeoutRule {
        kind,
        transition: Transition::new(kind, from, to)
            .with_patch(JobPatch::failure(TIMEOUT_MESSAGE).with_error_code("Timeout")),
        after,
    }
}

/// Times out jobs whose heartbeat is older than their kind's threshold.
pub struct TimeoutSweeper {
    store: Arc<dyn JobStore>,
    rules: Vec<TimeoutRule>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl TimeoutSweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: &OrchestratorConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        use DescribeStatus as D;
        use TaskStatus as T;

        let task = [T::Created, T::Queued, T::InProgress];
        let rules = vec![
            rule(
                JobKind::Describe,
                &[D::Created, D::Queued, D::InProgress, D::OldResourceDeletion],
                D::Timeout,
                config.describe.timeout,
            ),
            rule(
                JobKind::ComplianceRunner,
                &task,
                T::TimeOut,
                config.compliance.runner_timeout,
            ),
            rule(
                JobKind::ComplianceSummarizer,
                &task,
                T::TimeOut,
                config.compliance.summarizer_timeout,
            ),
            rule(
                JobKind::Compliance,
                &[ComplianceJobStatus::SinkInProgress],
                ComplianceJobStatus::TimeOut,
                config.compliance.sink_timeout,
            ),
            rule(JobKind::Analytics, &task, T::TimeOut, config.analytics.timeout),
            rule(
                JobKind::Sequencer,
                &[SequencerStatus::Launching],
                SequencerStatus::Failed,
                config.sequencer.timeout,
            ),
        ];
        Self {
            store,
            rules,
            clock,
            metrics,
        }
    }

    /// Run every rule once. Returns the number of jobs timed out.
    pub async fn sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut timed_out = 0;
        for rule in &self.rules {
            let filter = JobFilter::new()
                .status_names(rule.transition.from.iter().copied())
                .updated_before(cutoff(now, rule.after));
            let stale: Vec<JobId> = list_jobs(self.store.as_ref(), rule.kind, &filter)
                .await?
                .iter()
                .map(JobRecord::id)
                .collect();
            for id in stale {
                // The job may have moved on since it was listed.
                if self.store.transition(id, &rule.transition).await? {
                    info!(job_id = %id, kind = %rule.kind, "Job timed out");
                    self.metrics
                        .increment_counter(JOBS_TIMED_OUT, &[("kind", rule.kind.as_str())]);
                    timed_out += 1;
                }
            }
        }
        Ok(timed_out)
    }
}

#[async_trait]
impl PeriodicTask for TimeoutSweeper {
    fn name(&self) -> &'static str {
        "timeout-sweep"
    }

    async fn tick(&self) -> Result<()> {
        self.sweep().await.map(|_| ())
    }
}
