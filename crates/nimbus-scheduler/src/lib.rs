//! Job orchestration for nimbus.
//!
//! Runs the scheduling loops (describe, compliance, analytics, sequencer),
//! admission control and dispatch, the result consumer with its timeout
//! sweeper, cancellation and the retention sweep. Loops coordinate only
//! through the job store.

pub mod admission;
pub mod analytics;
pub mod cancel;
pub mod compliance;
pub mod consumer;
pub mod describe;
pub mod dispatcher;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod retention;
pub mod sequencer;
pub mod ticker;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionController, BlockReason};
pub use analytics::AnalyticsScheduler;
pub use cancel::{CancelReport, CancellationService};
pub use compliance::{ComplianceScheduler, reduce_completion};
pub use consumer::{ResultConsumer, TimeoutSweeper};
pub use describe::DescribeScheduler;
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use metrics::{MetricsSink, NoopMetrics, TracingMetrics};
pub use orchestrator::{Collaborators, Orchestrator, RunHandle};
pub use progress::{JobProgress, job_progress};
pub use retention::RetentionSweeper;
pub use sequencer::{JobLauncher, SchedulerLauncher, SequencerService};
pub use ticker::{PeriodicTask, Schedule, spawn_periodic};

use chrono::{DateTime, TimeDelta, Utc};
use nimbus_core::{AnyJob, JobKind, Result};
use nimbus_db::{JobFilter, JobStore};
use std::time::Duration;

/// `now - age`, saturating at the earliest representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// List jobs of any kind through the matching typed query.
pub(crate) async fn list_jobs(
    store: &dyn JobStore,
    kind: JobKind,
    filter: &JobFilter,
) -> Result<Vec<AnyJob>> {
    Ok(match kind {
        JobKind::Describe => store
            .list_describe_jobs(filter)
            .await?
            .into_iter()
            .map(AnyJob::Describe)
            .collect(),
        JobKind::Compliance => store
            .list_compliance_jobs(filter)
            .await?
            .into_iter()
            .map(AnyJob::Compliance)
            .collect(),
        JobKind::ComplianceRunner => store
            .list_runners(filter)
            .await?
            .into_iter()
            .map(AnyJob::ComplianceRunner)
            .collect(),
        JobKind::ComplianceSummarizer => store
            .list_summarizers(filter)
            .await?
            .into_iter()
            .map(AnyJob::ComplianceSummarizer)
            .collect(),
        JobKind::Analytics => store
            .list_analytics_jobs(filter)
            .await?
            .into_iter()
            .map(AnyJob::Analytics)
            .collect(),
        JobKind::Sequencer => store
            .list_sequencers(filter)
            .await?
            .into_iter()
            .map(AnyJob::Sequencer)
            .collect(),
    })
}
