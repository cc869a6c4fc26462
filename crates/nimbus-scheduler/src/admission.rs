//! Admission control ahead of dispatch.
//!
//! Two layers: global ceilings that skip a whole cycle, and per resource
//! type ceilings that prune overflowing types from the cycle. Counts are
//! recomputed from the job store on every check.

use nimbus_config::AdmissionConfig;
use nimbus_core::job::{DescribeConnectionJob, TaskStatus};
use nimbus_core::{Clock, JobKind, Result};
use nimbus_db::{JobFilter, JobStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cutoff;
use crate::metrics::{ADMISSION_BLOCKED, MetricsSink};

/// Kinds handed to the execution substrate.
pub const DISPATCHED_KINDS: [JobKind; 4] = [
    JobKind::Describe,
    JobKind::ComplianceRunner,
    JobKind::ComplianceSummarizer,
    JobKind::Analytics,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    MaxQueued,
    MaxInRecentWindow,
}

impl BlockReason {
    pub const ALL: [BlockReason; 2] = [BlockReason::MaxQueued, BlockReason::MaxInRecentWindow];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::MaxQueued => "max_queued",
            BlockReason::MaxInRecentWindow => "max_in_10_minutes",
        }
    }
}

/// Outcome of admitting a batch of describe candidates.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The whole cycle is skipped; candidates stay `Created`.
    Blocked(BlockReason),
    Admitted {
        jobs: Vec<DescribeConnectionJob>,
        /// Resource types pruned this cycle, with their candidate counts.
        deferred: BTreeMap<String, usize>,
    },
}

/// Drop every resource type whose candidates plus in-flight jobs would
/// exceed its limit. Pruned candidates are not dispatched this cycle.
pub fn prune_overflow(
    candidates: Vec<DescribeConnectionJob>,
    in_flight: &HashMap<String, u64>,
    limit_for: impl Fn(&str) -> u64,
) -> (Vec<DescribeConnectionJob>, BTreeMap<String, usize>) {
    let mut per_type: BTreeMap<String, usize> = BTreeMap::new();
    for job in &candidates {
        *per_type.entry(job.resource_type.clone()).or_insert(0) += 1;
    }

    let deferred: BTreeMap<String, usize> = per_type
        .into_iter()
        .filter(|(rt, n)| {
            let running = in_flight.get(rt).copied().unwrap_or(0);
            running + *n as u64 > limit_for(rt)
        })
        .collect();

    let admitted = candidates
        .into_iter()
        .filter(|job| !deferred.contains_key(&job.resource_type))
        .collect();
    (admitted, deferred)
}

pub struct AdmissionController {
    store: Arc<dyn JobStore>,
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: AdmissionConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            metrics,
        }
    }

    /// Check the global ceilings. Updates the `admission_blocked` gauges.
    pub async fn check(&self) -> Result<Option<BlockReason>> {
        let since = cutoff(self.clock.now(), self.config.recent_window);
        let mut queued = 0;
        let mut recent = 0;
        for kind in DISPATCHED_KINDS {
            queued += self
                .store
                .count_jobs(kind, &JobFilter::new().status_names([TaskStatus::Queued.as_str()]))
                .await?;
            recent += self
                .store
                .count_jobs(kind, &JobFilter::new().started_after(since))
                .await?;
        }

        let blocked = if queued > self.config.max_queued {
            Some(BlockReason::MaxQueued)
        } else if recent > self.config.max_in_recent_window {
            Some(BlockReason::MaxInRecentWindow)
        } else {
            None
        };

        for reason in BlockReason::ALL {
            let value = if blocked == Some(reason) { 1.0 } else { 0.0 };
            self.metrics
                .set_gauge(ADMISSION_BLOCKED, &[("reason", reason.as_str())], value);
        }
        if let Some(reason) = blocked {
            info!(reason = reason.as_str(), queued, recent, "Admission blocked");
        }
        Ok(blocked)
    }

    /// Apply both layers to a batch of describe candidates.
    pub async fn admit_describe(&self, candidates: Vec<DescribeConnectionJob>) -> Result<Admission> {
        if let Some(reason) = self.check().await? {
            return Ok(Admission::Blocked(reason));
        }

        let in_flight = self.store.describe_in_flight_by_type().await?;
        let (jobs, deferred) =
            prune_overflow(candidates, &in_flight, |rt| self.config.limit_for(rt));
        for (resource_type, count) in &deferred {
            debug!(resource_type = %resource_type, candidates = count, "Resource type at limit, deferring");
        }
        Ok(Admission::Admitted { jobs, deferred })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use nimbus_core::connection::Connector;
    use nimbus_core::job::DescribeStatus;
    use nimbus_core::resource::{DiscoveryType, TriggerType};
    use nimbus_core::{JobPatch, ManualClock, Transition};
    use nimbus_db::MemoryJobStore;

    fn job(resource_type: &str) -> DescribeConnectionJob {
        DescribeConnectionJob::new(
            chrono::Utc::now(),
            "c1",
            Connector::Aws,
            resource_type,
            DiscoveryType::Fast,
            TriggerType::Scheduled,
        )
    }

    #[test]
    fn test_prune_removes_whole_overflowing_type() {
        let candidates = vec![job("A"), job("A"), job("A"), job("B"), job("B")];
        let in_flight = HashMap::from([("A".to_string(), 23)]);

        let (admitted, deferred) = prune_overflow(candidates, &in_flight, |_| 25);

        assert_eq!(admitted.len(), 2);
        assert!(admitted.iter().all(|j| j.resource_type == "B"));
        assert_eq!(deferred.get("A"), Some(&3));
    }

    #[test]
    fn test_prune_respects_overrides() {
        let candidates = vec![job("A"), job("B")];
        let (admitted, deferred) =
            prune_overflow(candidates, &HashMap::new(), |rt| if rt == "B" { 0 } else { 25 });
        assert_eq!(admitted.len(), 1);
        assert!(deferred.contains_key("B"));
    }

    #[test]
    fn test_prune_at_exact_limit_admits() {
        let candidates = vec![job("A"), job("A")];
        let in_flight = HashMap::from([("A".to_string(), 23)]);
        let (admitted, deferred) = prune_overflow(candidates, &in_flight, |_| 25);
        assert_eq!(admitted.len(), 2);
        assert!(deferred.is_empty());
    }

    #[tokio::test]
    async fn test_max_queued_blocks_cycle() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryJobStore::new(clock.clone()));
        let jobs = vec![job("A"), job("A")];
        store.insert_describe_jobs(&jobs).await.unwrap();
        let queue = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Queued);
        for j in &jobs {
            store.transition(j.header.id, &queue).await.unwrap();
        }

        let metrics = Arc::new(InMemoryMetrics::default());
        let controller = AdmissionController::new(
            store,
            AdmissionConfig {
                max_queued: 1,
                ..Default::default()
            },
            clock,
            metrics.clone(),
        );

        let admission = controller.admit_describe(vec![job("B")]).await.unwrap();
        assert_eq!(admission, Admission::Blocked(BlockReason::MaxQueued));
        assert_eq!(
            metrics.gauge(ADMISSION_BLOCKED, &[("reason", "max_queued")]),
            Some(1.0)
        );
        assert_eq!(
            metrics.gauge(ADMISSION_BLOCKED, &[("reason", "max_in_10_minutes")]),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_recent_window_blocks_until_it_passes() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryJobStore::new(clock.clone()));
        let jobs = vec![job("A"), job("A"), job("B")];
        store.insert_describe_jobs(&jobs).await.unwrap();
        let start = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Queued)
            .with_patch(JobPatch::default().started());
        let finish = Transition::describe(&[DescribeStatus::Queued], DescribeStatus::Succeeded);
        for j in &jobs {
            store.transition(j.header.id, &start).await.unwrap();
            store.transition(j.header.id, &finish).await.unwrap();
        }

        let metrics = Arc::new(InMemoryMetrics::default());
        let controller = AdmissionController::new(
            store,
            AdmissionConfig {
                max_in_recent_window: 2,
                recent_window: std::time::Duration::from_secs(600),
                ..Default::default()
            },
            clock.clone(),
            metrics.clone(),
        );

        let admission = controller.admit_describe(vec![job("C")]).await.unwrap();
        assert_eq!(admission, Admission::Blocked(BlockReason::MaxInRecentWindow));
        assert_eq!(
            metrics.gauge(ADMISSION_BLOCKED, &[("reason", "max_in_10_minutes")]),
            Some(1.0)
        );
        assert_eq!(
            metrics.gauge(ADMISSION_BLOCKED, &[("reason", "max_queued")]),
            Some(0.0)
        );

        clock.advance(chrono::Duration::minutes(11));
        let admission = controller.admit_describe(vec![job("C")]).await.unwrap();
        assert!(matches!(admission, Admission::Admitted { ref jobs, .. } if jobs.len() == 1));
        assert_eq!(
            metrics.gauge(ADMISSION_BLOCKED, &[("reason", "max_in_10_minutes")]),
            Some(0.0)
        );
    }
}
