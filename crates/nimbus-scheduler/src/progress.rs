//! Aggregated job counts by status.

use nimbus_core::{JobKind, Result};
use nimbus_db::{JobFilter, JobStore};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub kind: JobKind,
    /// Every status of the kind, zero when no job is in it.
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
}

/// Count jobs of `kind` matching `filter`, grouped by status.
pub async fn job_progress(
    store: &dyn JobStore,
    kind: JobKind,
    filter: &JobFilter,
) -> Result<JobProgress> {
    for status in &filter.statuses {
        kind.parse_status(status)?;
    }
    let mut counts: BTreeMap<String, u64> = kind
        .statuses()
        .into_iter()
        .map(|s| (s.to_string(), 0))
        .collect();
    counts.extend(store.count_by_status(kind, filter).await?);
    let total = counts.values().sum();
    Ok(JobProgress {
        kind,
        counts,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use nimbus_core::{Clock, Error};
    use nimbus_core::Transition;
    use nimbus_core::job::DescribeStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_counts_by_status() {
        let h = Harness::new();
        h.created_describe("c1", "AWS::EC2::Instance").await;
        h.created_describe("c1", "AWS::IAM::Role").await;
        let failed = h.created_describe("c2", "AWS::EC2::Instance").await;
        let fail = Transition::describe(&[DescribeStatus::Created], DescribeStatus::Failed);
        h.store.transition(failed.header.id, &fail).await.unwrap();

        let progress = job_progress(h.store.as_ref(), JobKind::Describe, &JobFilter::new())
            .await
            .unwrap();

        assert_eq!(progress.total, 3);
        assert_eq!(progress.counts["CREATED"], 2);
        assert_eq!(progress.counts["FAILED"], 1);
        assert_eq!(progress.counts["SUCCEEDED"], 0);
    }

    #[tokio::test]
    async fn test_filters_by_connection_and_time() {
        let h = Harness::new();
        h.created_describe("c1", "AWS::EC2::Instance").await;
        let since = h.clock.now();
        h.advance(Duration::from_secs(60));
        h.created_describe("c1", "AWS::IAM::Role").await;
        h.created_describe("c2", "AWS::IAM::Role").await;

        let filter = JobFilter::new().connection("c1").created_after(since);
        let progress = job_progress(h.store.as_ref(), JobKind::Describe, &filter)
            .await
            .unwrap();

        assert_eq!(progress.total, 1);
    }

    #[tokio::test]
    async fn test_unknown_status_is_invalid() {
        let h = Harness::new();
        let filter = JobFilter::new().status_names(["RUNNERS_IN_PROGRESS"]);

        let err = job_progress(h.store.as_ref(), JobKind::Describe, &filter)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
