//! Describe scheduling.
//!
//! Every tick walks the enabled connections, creates a describe job for each
//! (connection, resource type) pair whose cooldown has elapsed, re-arms
//! eligible failures and hands `Created` jobs to admission and dispatch.

use async_trait::async_trait;
use nimbus_config::DescribeConfig;
use nimbus_core::connection::{Connection, ConnectionDirectory, ConnectionFilter, CredentialType};
use nimbus_core::job::{DescribeConnectionJob, DescribeStatus};
use nimbus_core::resource::{DiscoveryType, ResourceTypeRegistry, ResourceTypeSpec, TriggerType};
use nimbus_core::{AnyJob, Clock, Error, JobId, JobState, Result, Transition};
use nimbus_db::{JobFilter, JobStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionController};
use crate::cutoff;
use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::ticker::PeriodicTask;

/// Whether `connection` may be described for `discovery` right now.
///
/// Unhealthy connections are skipped, except for cost discovery on AWS
/// organization credentials: billing tables stay readable there even when
/// the member account checks fail.
fn eligible(connection: &Connection, discovery: DiscoveryType) -> bool {
    connection.lifecycle_state.is_enabled()
        && (connection.is_healthy()
            || (discovery == DiscoveryType::Cost
                && connection.credential_type == CredentialType::ManualAwsOrganization))
}

pub struct DescribeScheduler {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn ConnectionDirectory>,
    registry: Arc<ResourceTypeRegistry>,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<Dispatcher>,
    config: DescribeConfig,
    clock: Arc<dyn Clock>,
    // Held from the last-job lookup until the insert so the scheduled tick
    // and manual triggers cannot both create a job for the same pair.
    planning: Mutex<()>,
}

impl DescribeScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        directory: Arc<dyn ConnectionDirectory>,
        registry: Arc<ResourceTypeRegistry>,
        admission: Arc<AdmissionController>,
        dispatcher: Arc<Dispatcher>,
        config: DescribeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            admission,
            dispatcher,
            config,
            clock,
            planning: Mutex::new(()),
        }
    }

    /// Decide whether a new job is due for the pair.
    ///
    /// Returns `Error::JobInProgress` when the latest job is still active and
    /// `None` when it finished inside the cooldown window.
    async fn plan_job(
        &self,
        connection: &Connection,
        spec: &ResourceTypeSpec,
        trigger: TriggerType,
        honor_cooldown: bool,
    ) -> Result<Option<DescribeConnectionJob>> {
        let now = self.clock.now();
        let discovery = spec.discovery_type();
        if let Some(last) = self
            .store
            .last_describe_job(&connection.id, &spec.name)
            .await?
        {
            if !last.status.is_terminal() {
                return Err(Error::JobInProgress(format!(
                    "describe {} for {} is {}",
                    spec.name, connection.id, last.status
                )));
            }
            let since = cutoff(now, self.config.interval_for(discovery));
            if honor_cooldown && last.header.created_at > since {
                return Ok(None);
            }
        }
        Ok(Some(DescribeConnectionJob::new(
            now,
            &connection.id,
            connection.connector,
            &spec.name,
            discovery,
            trigger,
        )))
    }

    async fn insert_batch(
        &self,
        mut jobs: Vec<DescribeConnectionJob>,
    ) -> Result<Vec<DescribeConnectionJob>> {
        if jobs.is_empty() {
            return Ok(jobs);
        }
        let batch = JobId::new();
        for job in &mut jobs {
            job.header.parent_id = Some(batch);
        }
        self.store.insert_describe_jobs(&jobs).await?;
        info!(batch_id = %batch, count = jobs.len(), "Created describe jobs");
        Ok(jobs)
    }

    /// Create jobs for every due pair. Returns how many were created.
    pub(crate) async fn schedule_connections(&self) -> Result<usize> {
        let connections = self
            .directory
            .list_connections(&ConnectionFilter::enabled())
            .await?;

        let _planning = self.planning.lock().await;
        let mut jobs = Vec::new();
        for connection in &connections {
            for spec in self.registry.applicable_to(connection) {
                if !eligible(connection, spec.discovery_type()) {
                    debug!(
                        connection_id = %connection.id,
                        resource_type = %spec.name,
                        health = %connection.health_state,
                        "Connection not eligible, skipping"
                    );
                    continue;
                }
                match self
                    .plan_job(connection, spec, TriggerType::Scheduled, true)
                    .await
                {
                    Ok(Some(job)) => jobs.push(job),
                    Ok(None) => {}
                    Err(Error::JobInProgress(reason)) => debug!(%reason, "Skipping"),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(self.insert_batch(jobs).await?.len())
    }

    /// Re-arm failed jobs that are still inside their discovery interval and
    /// below the retry ceiling. Only the latest job of a pair is re-armed.
    async fn retry_sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let failed = self
            .store
            .list_describe_jobs(
                &JobFilter::new()
                    .statuses(&[DescribeStatus::Failed, DescribeStatus::Timeout])
                    .retry_count_below(self.config.max_retries),
            )
            .await?;

        // Planning may create a successor for the same pair between the
        // latest-job check and the re-arm.
        let _planning = self.planning.lock().await;
        let mut rearmed = 0;
        for job in failed {
            // Configuration errors never heal on their own.
            if job.header.error_code.as_deref() == Some("Configuration") {
                continue;
            }
            if job.header.created_at <= cutoff(now, self.config.interval_for(job.discovery_type)) {
                continue;
            }
            let latest = self
                .store
                .last_describe_job(&job.connection_id, &job.resource_type)
                .await?;
            if latest.is_none_or(|l| l.header.id != job.header.id) {
                continue;
            }
            let retry = Transition::describe(&[job.status], DescribeStatus::Created)
                .retry(self.config.max_retries);
            if self.store.transition(job.header.id, &retry).await? {
                debug!(
                    job_id = %job.header.id,
                    retry_count = job.header.retry_count + 1,
                    "Re-armed describe job"
                );
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }

    async fn dispatch(&self, candidates: Vec<DescribeConnectionJob>) -> Result<DispatchSummary> {
        if candidates.is_empty() {
            return Ok(DispatchSummary::default());
        }
        match self.admission.admit_describe(candidates).await? {
            Admission::Blocked(_) => Ok(DispatchSummary::default()),
            Admission::Admitted { jobs, .. } => Ok(self
                .dispatcher
                .dispatch_batch(jobs.into_iter().map(AnyJob::Describe).collect())
                .await),
        }
    }

    pub(crate) async fn dispatch_pending(&self) -> Result<DispatchSummary> {
        let pending = self
            .store
            .list_describe_jobs(&JobFilter::new().statuses(&[DescribeStatus::Created]))
            .await?;
        self.dispatch(pending).await
    }

    /// Describe a connection now, ignoring cooldowns.
    ///
    /// With no resource types every applicable type is described. Fails with
    /// `NotFound` for an unknown connection or resource type and with
    /// `JobInProgress` if any requested pair already has an active job; in
    /// that case nothing is created.
    pub async fn trigger_describe(
        &self,
        connection_id: &str,
        resource_types: &[String],
        trigger: TriggerType,
    ) -> Result<Vec<JobId>> {
        let connection = self.directory.get_connection(connection_id).await?;
        if !connection.lifecycle_state.is_enabled() {
            return Err(Error::InvalidInput(format!(
                "connection {connection_id} is {}",
                connection.lifecycle_state
            )));
        }

        let specs: Vec<&ResourceTypeSpec> = if resource_types.is_empty() {
            self.registry.applicable_to(&connection).collect()
        } else {
            resource_types
                .iter()
                .map(|rt| {
                    self.registry
                        .get(rt)
                        .filter(|s| s.connector == connection.connector)
                        .ok_or_else(|| Error::NotFound(format!("resource type {rt}")))
                })
                .collect::<Result<_>>()?
        };

        let jobs = {
            let _planning = self.planning.lock().await;
            let mut jobs = Vec::with_capacity(specs.len());
            for spec in specs {
                if let Some(job) = self.plan_job(&connection, spec, trigger, false).await? {
                    jobs.push(job);
                }
            }
            self.insert_batch(jobs).await?
        };

        let ids = jobs.iter().map(|j| j.header.id).collect();
        self.dispatch(jobs).await?;
        Ok(ids)
    }
}

#[async_trait]
impl PeriodicTask for DescribeScheduler {
    fn name(&self) -> &'static str {
        "describe"
    }

    async fn tick(&self) -> Result<()> {
        let created = self.schedule_connections().await?;
        let rearmed = match self.retry_sweep().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Retry sweep failed");
                0
            }
        };
        let summary = self.dispatch_pending().await?;
        if created + rearmed + summary.queued > 0 {
            info!(created, rearmed, queued = summary.queued, "Describe cycle complete");
        }
        Ok(())
    }
}
