//! Cancellable periodic tasks.
//!
//! A task runs once after a random initial delay and then every `period`.
//! Ticks that fall behind are skipped rather than bunched. Tests call
//! [`PeriodicTask::tick`] directly instead of waiting on the clock.

use async_trait::async_trait;
use nimbus_core::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Loop name used for the tracing span.
    fn name(&self) -> &'static str;

    /// One scheduling cycle. Errors are logged and the loop carries on.
    async fn tick(&self) -> Result<()>;
}

/// Timing of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub period: Duration,
    /// Upper bound of the random delay before the first tick.
    pub initial_jitter: Duration,
}

impl Schedule {
    pub fn new(period: Duration, initial_jitter: Duration) -> Self {
        Self {
            period,
            initial_jitter,
        }
    }

    fn first_delay(&self) -> Duration {
        let max = self.initial_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

/// Spawn `task` on the runtime. The returned handle completes once
/// `shutdown` is cancelled and any in-progress tick has finished.
pub fn spawn_periodic(
    task: Arc<dyn PeriodicTask>,
    schedule: Schedule,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let span = info_span!("loop", name = task.name());
    tokio::spawn(
        async move {
            let delay = schedule.first_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for first tick");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut interval = tokio::time::interval_at(Instant::now(), schedule.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_secs = schedule.period.as_secs(), "Loop started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = task.tick().await {
                            warn!(error = %e, retryable = e.is_retryable(), "Tick failed");
                        }
                    }
                }
            }
            info!("Loop stopped");
        }
        .instrument(span),
    )
}
