//! Wires the services together and runs their loops.

use futures::future::join_all;
use nimbus_config::OrchestratorConfig;
use nimbus_core::cleanup::CleanupTarget;
use nimbus_core::compliance::{ComplianceCatalog, FindingIndex};
use nimbus_core::connection::{ConnectionDirectory, CredentialVault};
use nimbus_core::resource::ResourceTypeRegistry;
use nimbus_core::substrate::{ExecutionSubstrate, ResultStream};
use nimbus_core::Clock;
use nimbus_db::JobStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::admission::AdmissionController;
use crate::analytics::AnalyticsScheduler;
use crate::cancel::CancellationService;
use crate::compliance::ComplianceScheduler;
use crate::consumer::{ResultConsumer, TimeoutSweeper};
use crate::describe::DescribeScheduler;
use crate::dispatcher::Dispatcher;
use crate::metrics::MetricsSink;
use crate::retention::RetentionSweeper;
use crate::sequencer::{SchedulerLauncher, SequencerService};
use crate::ticker::{PeriodicTask, Schedule, spawn_periodic};

/// External systems the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn ConnectionDirectory>,
    pub vault: Arc<dyn CredentialVault>,
    pub catalog: Arc<dyn ComplianceCatalog>,
    pub finding_index: Arc<dyn FindingIndex>,
    pub cleanup: Arc<dyn CleanupTarget>,
    pub substrate: Arc<dyn ExecutionSubstrate>,
    pub results: Arc<dyn ResultStream>,
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    config: OrchestratorConfig,
    describe: Arc<DescribeScheduler>,
    compliance: Arc<ComplianceScheduler>,
    analytics: Arc<AnalyticsScheduler>,
    sequencer: Arc<SequencerService>,
    consumer: Arc<ResultConsumer>,
    sweeper: Arc<TimeoutSweeper>,
    retention: Arc<RetentionSweeper>,
    cancellation: Arc<CancellationService>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: OrchestratorConfig,
        collaborators: Collaborators,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ResourceTypeRegistry::new(config.resource_types.clone()));
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            config.admission.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            collaborators.substrate.clone(),
            collaborators.directory.clone(),
            collaborators.vault.clone(),
            metrics.clone(),
            config.describe.max_dispatch_workers,
        ));

        let describe = Arc::new(DescribeScheduler::new(
            store.clone(),
            collaborators.directory.clone(),
            registry,
            admission.clone(),
            dispatcher.clone(),
            config.describe.clone(),
            clock.clone(),
        ));
        let compliance = Arc::new(ComplianceScheduler::new(
            store.clone(),
            collaborators.catalog.clone(),
            collaborators.directory.clone(),
            collaborators.finding_index.clone(),
            admission.clone(),
            dispatcher.clone(),
            config.compliance.clone(),
            clock.clone(),
        ));
        let analytics = Arc::new(AnalyticsScheduler::new(
            store.clone(),
            admission,
            dispatcher,
            config.analytics.clone(),
            clock.clone(),
        ));
        let launcher = Arc::new(SchedulerLauncher::new(
            describe.clone(),
            compliance.clone(),
            analytics.clone(),
        ));
        let sequencer = Arc::new(SequencerService::new(store.clone(), launcher, clock.clone()));
        let consumer = Arc::new(ResultConsumer::new(
            store.clone(),
            collaborators.results.clone(),
            collaborators.cleanup.clone(),
            metrics.clone(),
        ));
        let sweeper = Arc::new(TimeoutSweeper::new(
            store.clone(),
            &config,
            clock.clone(),
            metrics,
        ));
        let retention = Arc::new(RetentionSweeper::new(
            store.clone(),
            config.retention.clone(),
            clock,
        ));
        let cancellation = Arc::new(CancellationService::new(
            store.clone(),
            collaborators.substrate,
        ));

        Self {
            store,
            config,
            describe,
            compliance,
            analytics,
            sequencer,
            consumer,
            sweeper,
            retention,
            cancellation,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn describe(&self) -> &Arc<DescribeScheduler> {
        &self.describe
    }

    pub fn compliance(&self) -> &Arc<ComplianceScheduler> {
        &self.compliance
    }

    pub fn analytics(&self) -> &Arc<AnalyticsScheduler> {
        &self.analytics
    }

    pub fn sequencer(&self) -> &Arc<SequencerService> {
        &self.sequencer
    }

    pub fn cancellation(&self) -> &Arc<CancellationService> {
        &self.cancellation
    }

    /// Spawn every loop and the result consumer. All of them stop once
    /// `shutdown` is cancelled.
    pub fn start(&self, shutdown: CancellationToken) -> RunHandle {
        let jitter = self.config.initial_jitter;
        let spawn = |task: Arc<dyn PeriodicTask>, period| {
            spawn_periodic(task, Schedule::new(period, jitter), shutdown.clone())
        };
        let mut handles: Vec<JoinHandle<()>> = vec![
            spawn(self.describe.clone(), self.config.describe.tick),
            spawn(self.compliance.clone(), self.config.compliance.tick),
            spawn(self.analytics.clone(), self.config.analytics.tick),
            spawn(self.sequencer.clone(), self.config.sequencer.tick),
            spawn(self.sweeper.clone(), self.config.results.sweep_interval),
            spawn(self.retention.clone(), self.config.retention.tick),
        ];

        let consumer = self.consumer.clone();
        handles.push(tokio::spawn(
            async move { consumer.run(shutdown).await }.instrument(info_span!("consumer")),
        ));

        info!(tasks = handles.len(), "Orchestrator started");
        RunHandle { handles }
    }
}

/// Handles of the tasks spawned by [`Orchestrator::start`].
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for every task to finish after shutdown was requested.
    pub async fn wait_for_shutdown(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Orchestrator task panicked");
            }
        }
        info!("Orchestrator stopped");
    }
}
