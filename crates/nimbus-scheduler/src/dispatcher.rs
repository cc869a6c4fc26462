//! Hands created jobs to the execution substrate.
//!
//! Each job is first claimed with a `Created -> Queued` compare-and-set, so
//! concurrent dispatchers never double-enqueue. If the hand-off then fails
//! the job moves `Queued -> Failed` with the cause recorded.

use futures::StreamExt;
use nimbus_core::connection::{ConnectionDirectory, CredentialVault};
use nimbus_core::job::{DescribeStatus, TaskStatus};
use nimbus_core::substrate::{EnqueueOutcome, ExecutionPayload, ExecutionSubstrate};
use nimbus_core::{AnyJob, Error, JobId, JobKind, JobPatch, JobRecord, Result, Transition};
use nimbus_db::{JobFilter, JobStore};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::list_jobs;
use crate::metrics::{DISPATCH_BATCH_SIZE, DISPATCH_FAILURES, JOBS_DISPATCHED, MetricsSink};

/// Why a hand-off failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Credential,
    Payload,
    Transport,
    Throttled,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Credential => "credential",
            FailureCause::Payload => "payload",
            FailureCause::Transport => "transport",
            FailureCause::Throttled => "throttled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Queued,
    Failed(FailureCause),
    /// Another dispatcher claimed the job first.
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub queued: usize,
    pub failed: usize,
    pub skipped: usize,
}

fn claim(kind: JobKind) -> Result<Transition> {
    Ok(match kind {
        JobKind::Describe => {
            Transition::describe(&[DescribeStatus::Created], DescribeStatus::Queued)
        }
        JobKind::ComplianceRunner | JobKind::ComplianceSummarizer | JobKind::Analytics => {
            Transition::new(kind, &[TaskStatus::Created], TaskStatus::Queued)
        }
        other => return Err(Error::Internal(format!("{other} jobs are not dispatched"))),
    }
    .with_patch(JobPatch::default().started()))
}

fn fail_queued(kind: JobKind, patch: JobPatch) -> Result<Transition> {
    Ok(match kind {
        JobKind::Describe => {
            Transition::describe(&[DescribeStatus::Queued], DescribeStatus::Failed)
        }
        JobKind::ComplianceRunner | JobKind::ComplianceSummarizer | JobKind::Analytics => {
            Transition::new(kind, &[TaskStatus::Queued], TaskStatus::Failed)
        }
        other => return Err(Error::Internal(format!("{other} jobs are not dispatched"))),
    }
    .with_patch(patch))
}

/// Topic and body for a job.
fn build_payload(job: &AnyJob, credential_ref: Option<String>) -> Result<ExecutionPayload> {
    let (target, body) = match job {
        AnyJob::Describe(j) => (
            format!("describe-{}", j.connector.as_str().to_lowercase()),
            json!({
                "connection_id": j.connection_id,
                "connector": j.connector,
                "resource_type": j.resource_type,
                "discovery_type": j.discovery_type,
                "trigger_type": j.trigger_type,
            }),
        ),
        AnyJob::ComplianceRunner(r) => (
            "compliance-runner".to_string(),
            json!({
                "benchmark_id": r.benchmark_id,
                "control_ids": r.control_ids,
                "connection_ids": r.connection_ids,
            }),
        ),
        AnyJob::ComplianceSummarizer(s) => (
            "compliance-summarizer".to_string(),
            json!({ "benchmark_id": s.benchmark_id }),
        ),
        AnyJob::Analytics(a) => (
            "analytics".to_string(),
            json!({ "analytics_type": a.analytics_type }),
        ),
        other => {
            return Err(Error::Configuration(format!(
                "cannot build payload for {} job",
                other.kind()
            )));
        }
    };
    Ok(ExecutionPayload {
        job_id: job.id(),
        kind: job.kind(),
        parent_id: job.header().parent_id,
        target,
        credential_ref,
        body,
    })
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    substrate: Arc<dyn ExecutionSubstrate>,
    directory: Arc<dyn ConnectionDirectory>,
    vault: Arc<dyn CredentialVault>,
    metrics: Arc<dyn MetricsSink>,
    max_workers: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        directory: Arc<dyn ConnectionDirectory>,
        vault: Arc<dyn CredentialVault>,
        metrics: Arc<dyn MetricsSink>,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            substrate,
            directory,
            vault,
            metrics,
            max_workers: max_workers.max(1),
        }
    }

    /// Dispatch a batch concurrently; the pool is sized to the batch (capped
    /// at `max_workers`). Returns once every job has been handled.
    pub async fn dispatch_batch(&self, jobs: Vec<AnyJob>) -> DispatchSummary {
        if jobs.is_empty() {
            return DispatchSummary::default();
        }
        let workers = jobs.len().min(self.max_workers);
        self.metrics
            .observe(DISPATCH_BATCH_SIZE, &[], jobs.len() as f64);

        let queued = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let (queued_ref, failed_ref, skipped_ref) = (&queued, &failed, &skipped);
        futures::stream::iter(jobs)
            .for_each_concurrent(workers, |job| async move {
                let counter = match self.dispatch_one(&job).await {
                    Ok(Outcome::Queued) => queued_ref,
                    Ok(Outcome::Failed(_)) => failed_ref,
                    Ok(Outcome::Skipped) => skipped_ref,
                    Err(e) => {
                        warn!(job_id = %job.id(), kind = %job.kind(), error = %e, "Dispatch error");
                        failed_ref
                    }
                };
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .await;

        let summary = DispatchSummary {
            queued: queued.into_inner(),
            failed: failed.into_inner(),
            skipped: skipped.into_inner(),
        };
        info!(
            queued = summary.queued,
            failed = summary.failed,
            skipped = summary.skipped,
            "Dispatched batch"
        );
        summary
    }

    async fn dispatch_one(&self, job: &AnyJob) -> Result<Outcome> {
        let id = job.id();
        let kind = job.kind();
        if !self.store.transition(id, &claim(kind)?).await? {
            debug!(job_id = %id, "Job already claimed");
            return Ok(Outcome::Skipped);
        }

        let credential_ref = match job {
            AnyJob::Describe(j) => match self.resolve_credential(&j.connection_id).await {
                Ok(cred) => Some(cred),
                Err(e) => {
                    return self.fail(id, kind, FailureCause::Credential, &e).await;
                }
            },
            _ => None,
        };

        let payload = match build_payload(job, credential_ref) {
            Ok(payload) => payload,
            Err(e) => return self.fail(id, kind, FailureCause::Payload, &e).await,
        };

        match self.substrate.enqueue(payload).await {
            Ok(EnqueueOutcome::Accepted) => {
                self.metrics
                    .increment_counter(JOBS_DISPATCHED, &[("kind", kind.as_str())]);
                debug!(job_id = %id, kind = %kind, "Job queued");
                Ok(Outcome::Queued)
            }
            Ok(EnqueueOutcome::Throttled) => {
                let e = Error::Throttled(format!("{} rejected the job", self.substrate.name()));
                self.fail(id, kind, FailureCause::Throttled, &e).await
            }
            Err(e) => self.fail(id, kind, FailureCause::Transport, &e).await,
        }
    }

    async fn resolve_credential(&self, connection_id: &str) -> Result<String> {
        let connection = self.directory.get_connection(connection_id).await?;
        self.vault.credential_ref(&connection).await
    }

    async fn fail(
        &self,
        id: JobId,
        kind: JobKind,
        cause: FailureCause,
        error: &Error,
    ) -> Result<Outcome> {
        warn!(job_id = %id, kind = %kind, cause = cause.as_str(), error = %error, "Dispatch failed");
        self.metrics
            .increment_counter(DISPATCH_FAILURES, &[("cause", cause.as_str())]);
        let patch = JobPatch::failure(error.to_string()).with_error_code(error.code());
        self.store.transition(id, &fail_queued(kind, patch)?).await?;
        Ok(Outcome::Failed(cause))
    }
}

/// Dispatch up to `limit` `Created` jobs of a task kind unless admission
/// blocks the cycle.
pub(crate) async fn dispatch_created(
    store: &dyn JobStore,
    admission: &AdmissionController,
    dispatcher: &Dispatcher,
    kind: JobKind,
    limit: usize,
) -> Result<DispatchSummary> {
    let filter = JobFilter::new()
        .statuses(&[TaskStatus::Created])
        .limit(limit as u64);
    let jobs = list_jobs(store, kind, &filter).await?;
    if jobs.is_empty() {
        return Ok(DispatchSummary::default());
    }
    if let Some(reason) = admission.check().await? {
        debug!(kind = %kind, reason = reason.as_str(), "Dispatch deferred");
        return Ok(DispatchSummary::default());
    }
    Ok(dispatcher.dispatch_batch(jobs).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn test_dispatch_marks_queued_and_enqueues() {
        let h = Harness::new();
        let job = h.created_describe("c1", "AWS::EC2::Instance").await;

        let summary = h.dispatcher.dispatch_batch(vec![AnyJob::Describe(job.clone())]).await;

        assert_eq!(summary.queued, 1);
        let stored = h.store.get_describe_job(job.header.id).await.unwrap();
        assert_eq!(stored.status, DescribeStatus::Queued);
        assert!(stored.header.started_at.is_some());
        let payload = h.substrate.try_next().unwrap();
        assert_eq!(payload.job_id, job.header.id);
        assert_eq!(payload.target, "describe-aws");
        assert_eq!(payload.credential_ref.as_deref(), Some("cred-c1"));
    }

    #[tokio::test]
    async fn test_credential_failure_is_recorded() {
        let h = Harness::new();
        h.vault.fail_for("c1");
        let job = h.created_describe("c1", "AWS::EC2::Instance").await;

        let summary = h.dispatcher.dispatch_batch(vec![AnyJob::Describe(job.clone())]).await;

        assert_eq!(summary.failed, 1);
        let stored = h.store.get_describe_job(job.header.id).await.unwrap();
        assert_eq!(stored.status, DescribeStatus::Failed);
        assert_eq!(stored.header.error_code.as_deref(), Some("Credential"));
        assert_eq!(
            h.metrics.counter(DISPATCH_FAILURES, &[("cause", "credential")]),
            1
        );
        assert_eq!(h.substrate.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_throttled_enqueue_is_a_retryable_failure() {
        let h = Harness::with_capacity(0);
        let job = h.created_describe("c1", "AWS::EC2::Instance").await;

        h.dispatcher.dispatch_batch(vec![AnyJob::Describe(job.clone())]).await;

        let stored = h.store.get_describe_job(job.header.id).await.unwrap();
        assert_eq!(stored.status, DescribeStatus::Failed);
        assert_eq!(stored.header.error_code.as_deref(), Some("Throttled"));
        assert_eq!(
            h.metrics.counter(DISPATCH_FAILURES, &[("cause", "throttled")]),
            1
        );
    }

    #[tokio::test]
    async fn test_second_dispatch_of_same_job_is_skipped() {
        let h = Harness::new();
        let job = h.created_describe("c1", "AWS::EC2::Instance").await;
        let batch = vec![AnyJob::Describe(job.clone()), AnyJob::Describe(job.clone())];

        let summary = h.dispatcher.dispatch_batch(batch).await;

        assert_eq!(summary.queued, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(h.substrate.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_fails_with_credential_cause() {
        let h = Harness::new();
        let job = h.created_describe("missing", "AWS::EC2::Instance").await;

        h.dispatcher.dispatch_batch(vec![AnyJob::Describe(job.clone())]).await;

        let stored = h.store.get_describe_job(job.header.id).await.unwrap();
        assert_eq!(stored.status, DescribeStatus::Failed);
        assert_eq!(stored.header.error_code.as_deref(), Some("NotFound"));
    }
}
