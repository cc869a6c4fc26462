//! Periodic analytics jobs.

use async_trait::async_trait;
use nimbus_config::AnalyticsConfig;
use nimbus_core::job::{AnalyticsJob, AnalyticsType, JobHeader, TaskStatus};
use nimbus_core::{Clock, Error, JobId, JobKind, Result};
use nimbus_db::{JobFilter, JobStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::admission::AdmissionController;
use crate::cutoff;
use crate::dispatcher::{Dispatcher, dispatch_created};
use crate::ticker::PeriodicTask;

pub struct AnalyticsScheduler {
    store: Arc<dyn JobStore>,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<Dispatcher>,
    config: AnalyticsConfig,
    clock: Arc<dyn Clock>,
    creating: Mutex<()>,
}

impl AnalyticsScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        admission: Arc<AdmissionController>,
        dispatcher: Arc<Dispatcher>,
        config: AnalyticsConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            admission,
            dispatcher,
            config,
            clock,
            creating: Mutex::new(()),
        }
    }

    /// Create an analytics job unless one is active. `JobInProgress` otherwise.
    pub async fn create_now(&self) -> Result<JobId> {
        let _creating = self.creating.lock().await;
        self.create_locked().await
    }

    async fn create_locked(&self) -> Result<JobId> {
        let active = self
            .store
            .count_jobs(
                JobKind::Analytics,
                &JobFilter::new().status_names(JobKind::Analytics.active_statuses()),
            )
            .await?;
        if active > 0 {
            return Err(Error::JobInProgress("analytics job is running".into()));
        }
        let job = AnalyticsJob {
            header: JobHeader::new(self.clock.now()),
            status: TaskStatus::Created,
            analytics_type: AnalyticsType::Normal,
        };
        self.store.insert_analytics_job(&job).await?;
        info!(job_id = %job.header.id, "Created analytics job");
        Ok(job.header.id)
    }

    /// Create the periodic job if the last one is older than the interval.
    async fn schedule(&self) -> Result<Option<JobId>> {
        let _creating = self.creating.lock().await;
        let since = cutoff(self.clock.now(), self.config.interval);
        let recent = self
            .store
            .count_jobs(JobKind::Analytics, &JobFilter::new().created_after(since))
            .await?;
        if recent > 0 {
            return Ok(None);
        }
        match self.create_locked().await {
            Ok(id) => Ok(Some(id)),
            Err(Error::JobInProgress(reason)) => {
                debug!(%reason, "Skipping analytics");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PeriodicTask for AnalyticsScheduler {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn tick(&self) -> Result<()> {
        self.schedule().await?;
        dispatch_created(
            self.store.as_ref(),
            &self.admission,
            &self.dispatcher,
            JobKind::Analytics,
            1,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use nimbus_core::Transition;
    use std::time::Duration;

    async fn all(h: &Harness) -> Vec<AnalyticsJob> {
        h.store.list_analytics_jobs(&JobFilter::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_creates_and_dispatches_once_per_interval() {
        let h = Harness::new();
        let scheduler = h.analytics();

        scheduler.tick().await.unwrap();
        let jobs = all(&h).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, TaskStatus::Queued);
        assert_eq!(h.substrate.try_next().unwrap().target, "analytics");

        let done = Transition::new(JobKind::Analytics, &[TaskStatus::Queued], TaskStatus::Succeeded);
        h.store.transition(jobs[0].header.id, &done).await.unwrap();
        h.advance(Duration::from_secs(60 * 60));
        scheduler.tick().await.unwrap();
        assert_eq!(all(&h).await.len(), 1);

        h.advance(Duration::from_secs(61 * 60));
        scheduler.tick().await.unwrap();
        assert_eq!(all(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn test_active_job_blocks_new_one() {
        let h = Harness::new();
        let scheduler = h.analytics();
        scheduler.tick().await.unwrap();
        h.advance(Duration::from_secs(3 * 60 * 60));

        scheduler.tick().await.unwrap();

        assert_eq!(all(&h).await.len(), 1);
        assert!(matches!(
            scheduler.create_now().await,
            Err(Error::JobInProgress(_))
        ));
    }
}
