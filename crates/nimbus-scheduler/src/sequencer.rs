//! Job sequencers: wait for a list of jobs, then create one more.
//!
//! A sequencer is claimed with `WaitingForDependencies -> Launching` before
//! its next job is created, so concurrent ticks (or processes) launch it at
//! most once. A sequencer stuck in `Launching` is failed by the timeout sweep.

use async_trait::async_trait;
use nimbus_core::job::{JobHeader, JobSequencer, SequencerStatus};
use nimbus_core::sequence::NextJobParameters;
use nimbus_core::{Clock, Error, JobId, JobKind, JobPatch, Result, Transition};
use nimbus_db::{JobFilter, JobStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analytics::AnalyticsScheduler;
use crate::compliance::ComplianceScheduler;
use crate::describe::DescribeScheduler;
use crate::ticker::PeriodicTask;

/// Creates the job a sequencer is waiting to launch.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, params: &NextJobParameters) -> Result<Vec<JobId>>;
}

/// Launches through the schedulers' manual trigger paths.
pub struct SchedulerLauncher {
    describe: Arc<DescribeScheduler>,
    compliance: Arc<ComplianceScheduler>,
    analytics: Arc<AnalyticsScheduler>,
}

impl SchedulerLauncher {
    pub fn new(
        describe: Arc<DescribeScheduler>,
        compliance: Arc<ComplianceScheduler>,
        analytics: Arc<AnalyticsScheduler>,
    ) -> Self {
        Self {
            describe,
            compliance,
            analytics,
        }
    }
}

#[async_trait]
impl JobLauncher for SchedulerLauncher {
    async fn launch(&self, params: &NextJobParameters) -> Result<Vec<JobId>> {
        match params {
            NextJobParameters::Describe {
                connection_id,
                resource_types,
            } => {
                self.describe
                    .trigger_describe(connection_id, resource_types, params.trigger_type())
                    .await
            }
            NextJobParameters::Compliance {
                benchmark_id,
                connection_ids,
                control_ids,
            } => {
                let id = self
                    .compliance
                    .trigger_benchmark(
                        benchmark_id,
                        connection_ids,
                        control_ids,
                        params.trigger_type(),
                    )
                    .await?;
                Ok(vec![id])
            }
            NextJobParameters::Analytics {} => Ok(vec![self.analytics.create_now().await?]),
        }
    }
}

pub struct SequencerService {
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn JobLauncher>,
    clock: Arc<dyn Clock>,
}

impl SequencerService {
    pub fn new(
        store: Arc<dyn JobStore>,
        launcher: Arc<dyn JobLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            launcher,
            clock,
        }
    }

    /// Register a sequencer that launches `next` once every job in
    /// `dependencies` (all of kind `source`) is terminal.
    pub async fn create(
        &self,
        source: JobKind,
        dependencies: Vec<JobId>,
        next: &NextJobParameters,
    ) -> Result<JobId> {
        if dependencies.is_empty() {
            return Err(Error::InvalidInput("sequencer needs at least one dependency".into()));
        }
        let sequencer = JobSequencer {
            header: JobHeader::new(self.clock.now()),
            status: SequencerStatus::WaitingForDependencies,
            dependency_source: source,
            dependency_list: dependencies,
            next_job: next.kind(),
            next_job_parameters: next.to_value()?,
            next_job_ids: Vec::new(),
        };
        self.store.insert_sequencer(&sequencer).await?;
        info!(
            sequencer_id = %sequencer.header.id,
            source = %source,
            next_job = %sequencer.next_job,
            dependencies = sequencer.dependency_list.len(),
            "Created sequencer"
        );
        Ok(sequencer.header.id)
    }

    async fn fail(&self, id: JobId, from: SequencerStatus, error: &Error) -> Result<()> {
        warn!(sequencer_id = %id, error = %error, "Sequencer failed");
        let fail = Transition::sequencer(&[from], SequencerStatus::Failed)
            .with_patch(JobPatch::failure(error.to_string()).with_error_code(error.code()));
        self.store.transition(id, &fail).await?;
        Ok(())
    }

    /// Whether every dependency is terminal. Missing dependencies can never
    /// finish and are reported as a configuration error.
    async fn dependencies_done(&self, sequencer: &JobSequencer) -> Result<bool> {
        let statuses = self
            .store
            .job_statuses(sequencer.dependency_source, &sequencer.dependency_list)
            .await?;
        if let Some(missing) = sequencer
            .dependency_list
            .iter()
            .find(|id| !statuses.contains_key(id))
        {
            return Err(Error::Configuration(format!(
                "dependency {} {missing} does not exist",
                sequencer.dependency_source
            )));
        }
        Ok(statuses.values().all(|s| s.is_terminal()))
    }

    /// Advance one sequencer. Returns whether it launched.
    async fn advance(&self, sequencer: &JobSequencer) -> Result<bool> {
        use SequencerStatus::*;

        let id = sequencer.header.id;
        match self.dependencies_done(sequencer).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                self.fail(id, WaitingForDependencies, &e).await?;
                return Ok(false);
            }
        }

        let params = match NextJobParameters::decode(sequencer.next_job, &sequencer.next_job_parameters) {
            Ok(params) => params,
            Err(e) => {
                self.fail(id, WaitingForDependencies, &e).await?;
                return Ok(false);
            }
        };

        let claim = Transition::sequencer(&[WaitingForDependencies], Launching);
        if !self.store.transition(id, &claim).await? {
            debug!(sequencer_id = %id, "Sequencer already claimed");
            return Ok(false);
        }

        match self.launcher.launch(&params).await {
            Ok(next_job_ids) => {
                info!(sequencer_id = %id, next_job = %sequencer.next_job, jobs = next_job_ids.len(), "Sequencer launched");
                let finish = Transition::sequencer(&[Launching], Finished).with_patch(JobPatch {
                    next_job_ids: Some(next_job_ids),
                    ..Default::default()
                });
                self.store.transition(id, &finish).await?;
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                warn!(sequencer_id = %id, error = %e, "Sequencer launch failed, retrying next tick");
                let release = Transition::sequencer(&[Launching], WaitingForDependencies);
                self.store.transition(id, &release).await?;
                Ok(false)
            }
            Err(e) => {
                self.fail(id, Launching, &e).await?;
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for SequencerService {
    fn name(&self) -> &'static str {
        "sequencer"
    }

    async fn tick(&self) -> Result<()> {
        let waiting = self
            .store
            .list_sequencers(
                &JobFilter::new().statuses(&[SequencerStatus::WaitingForDependencies]),
            )
            .await?;
        for sequencer in &waiting {
            if let Err(e) = self.advance(sequencer).await {
                warn!(sequencer_id = %sequencer.header.id, error = %e, "Sequencer not advanced");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, RecordingLauncher};
    use nimbus_core::job::DescribeStatus;
    use serde_json::json;

    async fn sequencer(h: &Harness, id: JobId) -> JobSequencer {
        h.store
            .list_sequencers(&JobFilter::new().ids(&[id]))
            .await
            .unwrap()
            .remove(0)
    }

    fn compliance_params() -> NextJobParameters {
        NextJobParameters::Compliance {
            benchmark_id: "aws_cis".into(),
            connection_ids: vec!["c1".into()],
            control_ids: vec![],
        }
    }

    #[tokio::test]
    async fn test_waits_for_dependencies_then_launches_once() {
        let h = Harness::new();
        let launcher = Arc::new(RecordingLauncher::default());
        let service = Arc::new(h.sequencer(launcher.clone()));
        let a = h.created_describe("c1", "AWS::EC2::Instance").await;
        let b = h.created_describe("c1", "AWS::IAM::Role").await;
        let id = service
            .create(JobKind::Describe, vec![a.header.id, b.header.id], &compliance_params())
            .await
            .unwrap();

        let fail = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Failed);
        h.store.transition(a.header.id, &fail).await.unwrap();
        service.tick().await.unwrap();
        assert_eq!(sequencer(&h, id).await.status, SequencerStatus::WaitingForDependencies);

        let cancel = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Canceled);
        h.store.transition(b.header.id, &cancel).await.unwrap();
        let (first, second) = tokio::join!(service.tick(), service.tick());
        first.unwrap();
        second.unwrap();
        service.tick().await.unwrap();

        let done = sequencer(&h, id).await;
        assert_eq!(done.status, SequencerStatus::Finished);
        assert_eq!(done.next_job_ids.len(), 1);
        assert_eq!(launcher.launched.lock().unwrap().as_slice(), &[compliance_params()]);
    }

    #[tokio::test]
    async fn test_malformed_parameters_fail_without_launch() {
        let h = Harness::new();
        let launcher = Arc::new(RecordingLauncher::default());
        let service = h.sequencer(launcher.clone());
        let dep = h.created_describe("c1", "AWS::EC2::Instance").await;
        let cancel = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Canceled);
        h.store.transition(dep.header.id, &cancel).await.unwrap();
        let broken = JobSequencer {
            header: JobHeader::new(h.clock.now()),
            status: SequencerStatus::WaitingForDependencies,
            dependency_source: JobKind::Describe,
            dependency_list: vec![dep.header.id],
            next_job: JobKind::Compliance,
            next_job_parameters: json!({ "kind": "compliance", "benchmark_id": 7 }),
            next_job_ids: vec![],
        };
        h.store.insert_sequencer(&broken).await.unwrap();

        service.tick().await.unwrap();

        let failed = sequencer(&h, broken.header.id).await;
        assert_eq!(failed.status, SequencerStatus::Failed);
        assert_eq!(failed.header.error_code.as_deref(), Some("Configuration"));
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dependency_fails() {
        let h = Harness::new();
        let service = h.sequencer(Arc::new(RecordingLauncher::default()));
        let id = service
            .create(JobKind::Describe, vec![JobId::new()], &NextJobParameters::Analytics {})
            .await
            .unwrap();

        service.tick().await.unwrap();

        assert_eq!(sequencer(&h, id).await.status, SequencerStatus::Failed);
    }

    #[tokio::test]
    async fn test_launch_error_fails_sequencer() {
        let h = Harness::new();
        let launcher = Arc::new(RecordingLauncher {
            failure: Some(|| Error::NotFound("benchmark gone".into())),
            ..Default::default()
        });
        let service = h.sequencer(launcher);
        let dep = h.created_describe("c1", "AWS::EC2::Instance").await;
        let cancel = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Canceled);
        h.store.transition(dep.header.id, &cancel).await.unwrap();
        let id = service
            .create(JobKind::Describe, vec![dep.header.id], &compliance_params())
            .await
            .unwrap();

        service.tick().await.unwrap();

        let failed = sequencer(&h, id).await;
        assert_eq!(failed.status, SequencerStatus::Failed);
        assert_eq!(failed.header.error_code.as_deref(), Some("NotFound"));
    }

    #[tokio::test]
    async fn test_transient_launch_error_keeps_waiting() {
        let h = Harness::new();
        let launcher = Arc::new(RecordingLauncher {
            failure: Some(|| Error::Transport("compliance service connection reset".into())),
            ..Default::default()
        });
        let service = h.sequencer(launcher);
        let dep = h.created_describe("c1", "AWS::EC2::Instance").await;
        let cancel = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Canceled);
        h.store.transition(dep.header.id, &cancel).await.unwrap();
        let id = service
            .create(JobKind::Describe, vec![dep.header.id], &compliance_params())
            .await
            .unwrap();

        service.tick().await.unwrap();

        let waiting = sequencer(&h, id).await;
        assert_eq!(waiting.status, SequencerStatus::WaitingForDependencies);
        assert_eq!(waiting.header.error_code, None);

        // The next tick launches once the collaborator recovers.
        let recovered = h.sequencer(Arc::new(RecordingLauncher::default()));
        recovered.tick().await.unwrap();
        assert_eq!(sequencer(&h, id).await.status, SequencerStatus::Finished);
    }

    #[tokio::test]
    async fn test_scheduler_launcher_triggers_describe() {
        let h = Harness::new();
        let launcher = SchedulerLauncher::new(
            Arc::new(h.describe()),
            Arc::new(h.compliance()),
            Arc::new(h.analytics()),
        );

        let ids = launcher
            .launch(&NextJobParameters::Describe {
                connection_id: "c1".into(),
                resource_types: vec!["AWS::EC2::Instance".into()],
            })
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        let job = h.store.get_describe_job(ids[0]).await.unwrap();
        assert_eq!(job.status, DescribeStatus::Queued);
    }
}
