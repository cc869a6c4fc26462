//! Best-effort cancellation, bounded to the window before execution starts.
//!
//! A `Created` job is flipped straight to `Canceled`. A `Queued` job first has
//! its pending payload pulled back from the substrate; if a worker already
//! took it the job is treated as running and left alone.

use nimbus_core::job::{ComplianceJobStatus, DescribeStatus, TaskStatus};
use nimbus_core::substrate::ExecutionSubstrate;
use nimbus_core::{AnyStatus, Error, JobId, JobKind, JobRecord, Result, Transition};
use nimbus_db::{JobFilter, JobStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::list_jobs;

/// Outcome of a bulk cancellation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CancelReport {
    pub canceled: Vec<JobId>,
    /// Jobs that matched the filter but could not be canceled, with the reason.
    pub failed: Vec<(JobId, String)>,
}

fn in_progress(id: JobId) -> Error {
    Error::Conflict(format!("job {id} in progress, unable to cancel"))
}

/// The `-> Canceled` edge out of `from`, if cancellation is allowed there.
fn cancel_transition(kind: JobKind, from: AnyStatus) -> Option<Transition> {
    match from {
        AnyStatus::Describe(s @ (DescribeStatus::Created | DescribeStatus::Queued)) => {
            Some(Transition::describe(&[s], DescribeStatus::Canceled))
        }
        AnyStatus::Task(s @ (TaskStatus::Created | TaskStatus::Queued)) => {
            Some(Transition::new(kind, &[s], TaskStatus::Canceled))
        }
        AnyStatus::Compliance(ComplianceJobStatus::Created) => Some(Transition::compliance(
            &[ComplianceJobStatus::Created],
            ComplianceJobStatus::Canceled,
        )),
        _ => None,
    }
}

fn is_queued(status: AnyStatus) -> bool {
    matches!(
        status,
        AnyStatus::Describe(DescribeStatus::Queued) | AnyStatus::Task(TaskStatus::Queued)
    )
}

pub struct CancellationService {
    store: Arc<dyn JobStore>,
    substrate: Arc<dyn ExecutionSubstrate>,
}

impl CancellationService {
    pub fn new(store: Arc<dyn JobStore>, substrate: Arc<dyn ExecutionSubstrate>) -> Self {
        Self { store, substrate }
    }

    pub async fn cancel(&self, kind: JobKind, id: JobId) -> Result<()> {
        if kind == JobKind::Sequencer {
            return Err(Error::InvalidInput("sequencers cannot be canceled".into()));
        }
        let job = self.store.get_job(kind, id).await?;
        let status = job.any_status();
        if status.is_terminal() {
            return Err(Error::Conflict(format!("job {id} already finished")));
        }
        let Some(transition) = cancel_transition(kind, status) else {
            return Err(in_progress(id));
        };

        // The payload must be gone before the flip, or a worker could pick it
        // up and report against a canceled job.
        if is_queued(status) && !self.substrate.remove_pending(id).await? {
            return Err(in_progress(id));
        }
        if !self.store.transition(id, &transition).await? {
            return Err(in_progress(id));
        }
        info!(job_id = %id, kind = %kind, from = %status, "Canceled job");
        Ok(())
    }

    /// Cancel every job of `kind` matching `filter`. Without explicit
    /// statuses only `Created` and `Queued` jobs are considered.
    pub async fn cancel_matching(&self, kind: JobKind, filter: JobFilter) -> Result<CancelReport> {
        if kind == JobKind::Sequencer {
            return Err(Error::InvalidInput("sequencers cannot be canceled".into()));
        }
        let mut filter = filter;
        if filter.statuses.is_empty() {
            filter.statuses = vec!["CREATED".into(), "QUEUED".into()];
        }
        for status in &filter.statuses {
            kind.parse_status(status)?;
        }

        let mut report = CancelReport::default();
        for job in list_jobs(self.store.as_ref(), kind, &filter).await? {
            let id = job.header().id;
            match self.cancel(kind, id).await {
                Ok(()) => report.canceled.push(id),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Job not canceled");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use nimbus_core::resource::TriggerType;

    async fn describe_status(h: &Harness, id: JobId) -> DescribeStatus {
        h.store.get_describe_job(id).await.unwrap().status
    }

    #[tokio::test]
    async fn test_cancel_created_job() {
        let h = Harness::new();
        let job = h.created_describe("c1", "AWS::EC2::Instance").await;

        h.cancellation().cancel(JobKind::Describe, job.header.id).await.unwrap();

        assert_eq!(describe_status(&h, job.header.id).await, DescribeStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_removes_payload() {
        let h = Harness::new();
        let ids = h
            .describe()
            .trigger_describe("c1", &["AWS::EC2::Instance".into()], TriggerType::Manual)
            .await
            .unwrap();
        assert_eq!(h.substrate.pending_len(), 1);

        h.cancellation().cancel(JobKind::Describe, ids[0]).await.unwrap();

        assert_eq!(h.substrate.pending_len(), 0);
        assert_eq!(describe_status(&h, ids[0]).await, DescribeStatus::Canceled);
    }

    #[tokio::test]
    async fn test_consumed_payload_cannot_be_canceled() {
        let h = Harness::new();
        let ids = h
            .describe()
            .trigger_describe("c1", &["AWS::EC2::Instance".into()], TriggerType::Manual)
            .await
            .unwrap();
        h.substrate.try_next().unwrap();

        let err = h.cancellation().cancel(JobKind::Describe, ids[0]).await.unwrap_err();

        assert!(matches!(err, Error::Conflict(ref m) if m.contains("in progress, unable to cancel")));
        assert_eq!(describe_status(&h, ids[0]).await, DescribeStatus::Queued);
    }

    #[tokio::test]
    async fn test_in_progress_and_finished_jobs_conflict() {
        let h = Harness::new();
        let service = h.cancellation();
        let running = h.created_describe("c1", "AWS::EC2::Instance").await;
        let done = h.created_describe("c1", "AWS::IAM::Role").await;
        let to_running = [
            Transition::describe(&[DescribeStatus::Created], DescribeStatus::Queued),
            Transition::describe(&[DescribeStatus::Queued], DescribeStatus::InProgress),
        ];
        for t in &to_running {
            h.store.transition(running.header.id, t).await.unwrap();
        }
        let fail = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Failed);
        h.store.transition(done.header.id, &fail).await.unwrap();

        let err = service.cancel(JobKind::Describe, running.header.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(ref m) if m.contains("in progress")));
        let err = service.cancel(JobKind::Describe, done.header.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(ref m) if m.contains("already finished")));
    }

    #[tokio::test]
    async fn test_unknown_job_and_sequencer() {
        let h = Harness::new();
        let service = h.cancellation();

        let err = service.cancel(JobKind::Describe, JobId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = service.cancel(JobKind::Sequencer, JobId::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancel_matching_connection() {
        let h = Harness::new();
        let a = h.created_describe("c1", "AWS::EC2::Instance").await;
        let b = h.created_describe("c1", "AWS::IAM::Role").await;
        let other = h.created_describe("c2", "AWS::EC2::Instance").await;

        let report = h
            .cancellation()
            .cancel_matching(JobKind::Describe, JobFilter::new().connection("c1"))
            .await
            .unwrap();

        assert_eq!(report.canceled.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(describe_status(&h, a.header.id).await, DescribeStatus::Canceled);
        assert_eq!(describe_status(&h, b.header.id).await, DescribeStatus::Canceled);
        assert_eq!(describe_status(&h, other.header.id).await, DescribeStatus::Created);
    }

    #[tokio::test]
    async fn test_cancel_matching_rejects_unknown_status() {
        let h = Harness::new();

        let err = h
            .cancellation()
            .cancel_matching(JobKind::Describe, JobFilter::new().status_names(["RUNNING"]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
