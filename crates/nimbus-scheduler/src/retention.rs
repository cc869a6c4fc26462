//! Age-based deletion of finished job records.
//!
//! Compliance jobs and their children are purged by the compliance loop.

use async_trait::async_trait;
use nimbus_config::RetentionConfig;
use nimbus_core::{Clock, JobKind, Result};
use nimbus_db::JobStore;
use std::sync::Arc;
use tracing::info;

use crate::cutoff;
use crate::ticker::PeriodicTask;

const SWEPT_KINDS: [JobKind; 3] = [JobKind::Describe, JobKind::Analytics, JobKind::Sequencer];

pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    config: RetentionConfig,
    clock: Arc<dyn Clock>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, config: RetentionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Delete terminal records last updated before the retention cutoff.
    pub async fn sweep(&self) -> Result<u64> {
        let before = cutoff(self.clock.now(), self.config.describe_jobs);
        let mut total = 0;
        for kind in SWEPT_KINDS {
            let deleted = self.store.delete_terminal_jobs(kind, before).await?;
            if deleted > 0 {
                info!(kind = %kind, deleted, "Deleted old jobs");
            }
            total += deleted;
        }
        Ok(total)
    }
}

#[async_trait]
impl PeriodicTask for RetentionSweeper {
    fn name(&self) -> &'static str {
        "retention"
    }

    async fn tick(&self) -> Result<()> {
        self.sweep().await?;
        Ok(())
    }
}
