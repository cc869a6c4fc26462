//! In-memory collaborators and a wired-up harness for scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_config::OrchestratorConfig;
use nimbus_core::cleanup::{CleanupTarget, ResourceIdPage};
use nimbus_core::compliance::{Benchmark, ComplianceCatalog, Control, FindingIndex};
use nimbus_core::connection::{
    Connection, ConnectionDirectory, ConnectionFilter, Connector, CredentialType,
    CredentialVault, HealthState, LifecycleState,
};
use nimbus_core::job::{
    AnalyticsJob, ComplianceJob, ComplianceRunner, ComplianceSummarizer, DescribeConnectionJob,
    JobSequencer,
};
use nimbus_core::resource::{DiscoveryType, ResourceTypeRegistry, ResourceTypeSpec, TriggerType};
use nimbus_core::sequence::NextJobParameters;
use nimbus_core::{
    AnyJob, AnyStatus, Clock, Error, JobId, JobKind, ManualClock, Result, Transition,
};
use nimbus_db::{DbError, DbResult, JobFilter, JobStore, MemoryJobStore};
use nimbus_executor::{ChannelResultStream, ChannelSubstrate, ResultPublisher, result_channel};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::admission::AdmissionController;
use crate::analytics::AnalyticsScheduler;
use crate::cancel::CancellationService;
use crate::compliance::ComplianceScheduler;
use crate::consumer::{ResultConsumer, TimeoutSweeper};
use crate::describe::DescribeScheduler;
use crate::dispatcher::Dispatcher;
use crate::metrics::InMemoryMetrics;
use crate::retention::RetentionSweeper;
use crate::sequencer::{JobLauncher, SequencerService};

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn connection(id: &str, connector: Connector) -> Connection {
    Connection {
        id: id.to_string(),
        connector,
        lifecycle_state: LifecycleState::Onboard,
        health_state: HealthState::Healthy,
        credential_type: match connector {
            Connector::Aws => CredentialType::AutoAws,
            Connector::Azure => CredentialType::AutoAzure,
        },
        credential_id: format!("secret-{id}"),
        resource_types: vec![],
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    connections: Mutex<BTreeMap<String, Connection>>,
}

impl FakeDirectory {
    pub fn add(&self, connection: Connection) {
        locked(&self.connections).insert(connection.id.clone(), connection);
    }

    pub fn update(&self, id: &str, f: impl FnOnce(&mut Connection)) {
        if let Some(c) = locked(&self.connections).get_mut(id) {
            f(c);
        }
    }

    pub fn set_health(&self, id: &str, health: HealthState) {
        self.update(id, |c| c.health_state = health);
    }
}

#[async_trait]
impl ConnectionDirectory for FakeDirectory {
    async fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>> {
        Ok(locked(&self.connections)
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn get_connection(&self, id: &str) -> Result<Connection> {
        locked(&self.connections)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))
    }
}

#[derive(Default)]
pub struct FakeVault {
    failing: Mutex<HashSet<String>>,
}

impl FakeVault {
    pub fn fail_for(&self, connection_id: &str) {
        locked(&self.failing).insert(connection_id.to_string());
    }
}

#[async_trait]
impl CredentialVault for FakeVault {
    async fn credential_ref(&self, connection: &Connection) -> Result<String> {
        if locked(&self.failing).contains(&connection.id) {
            return Err(Error::Credential(format!(
                "cannot decrypt {}",
                connection.credential_id
            )));
        }
        Ok(format!("cred-{}", connection.id))
    }
}

#[derive(Default)]
pub struct FakeCatalog {
    benchmarks: Mutex<HashMap<String, Benchmark>>,
}

impl FakeCatalog {
    pub fn add(&self, id: &str, controls: &[&str], children: &[&str]) {
        locked(&self.benchmarks).insert(
            id.to_string(),
            Benchmark {
                id: id.to_string(),
                title: id.to_uppercase(),
                controls: controls.iter().map(|c| c.to_string()).collect(),
                children: children.iter().map(|c| c.to_string()).collect(),
            },
        );
    }
}

#[async_trait]
impl ComplianceCatalog for FakeCatalog {
    async fn get_benchmark(&self, id: &str) -> Result<Benchmark> {
        locked(&self.benchmarks)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("benchmark {id}")))
    }

    async fn list_controls(&self, ids: &[String]) -> Result<Vec<Control>> {
        Ok(ids
            .iter()
            .map(|id| Control {
                id: id.clone(),
                title: id.clone(),
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeFindingIndex {
    findings: Mutex<HashMap<JobId, u64>>,
    summaries: Mutex<HashSet<JobId>>,
}

impl FakeFindingIndex {
    pub fn set_findings(&self, job_id: JobId, count: u64) {
        locked(&self.findings).insert(job_id, count);
    }

    pub fn mark_summary_indexed(&self, job_id: JobId) {
        locked(&self.summaries).insert(job_id);
    }
}

#[async_trait]
impl FindingIndex for FakeFindingIndex {
    async fn count_findings(&self, job_id: JobId) -> Result<u64> {
        Ok(locked(&self.findings).get(&job_id).copied().unwrap_or(0))
    }

    async fn summary_indexed(&self, job_id: JobId) -> Result<bool> {
        Ok(locked(&self.summaries).contains(&job_id))
    }
}

/// Resource index keyed by (connection, resource type), paged two ids at a time.
#[derive(Default)]
pub struct FakeCleanup {
    existing: Mutex<HashMap<(String, String), Vec<String>>>,
    deleted: Mutex<Vec<String>>,
    delete_calls: AtomicUsize,
}

impl FakeCleanup {
    const PAGE: usize = 2;

    pub fn seed(&self, connection_id: &str, resource_type: &str, ids: &[&str]) {
        locked(&self.existing).insert(
            (connection_id.to_string(), resource_type.to_string()),
            ids.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn deleted(&self) -> Vec<String> {
        locked(&self.deleted).clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CleanupTarget for FakeCleanup {
    async fn existing_resource_ids(
        &self,
        connection_id: &str,
        resource_type: &str,
        cursor: Option<String>,
    ) -> Result<ResourceIdPage> {
        let all = locked(&self.existing)
            .get(&(connection_id.to_string(), resource_type.to_string()))
            .cloned()
            .unwrap_or_default();
        let start: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| Error::InvalidInput(format!("bad cursor {c}")))?,
            None => 0,
        };
        let end = (start + Self::PAGE).min(all.len());
        Ok(ResourceIdPage {
            ids: all.get(start..end).map(<[String]>::to_vec).unwrap_or_default(),
            next: (end < all.len()).then(|| end.to_string()),
        })
    }

    async fn delete_resources(
        &self,
        connection_id: &str,
        resource_type: &str,
        ids: &[String],
    ) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(existing) =
            locked(&self.existing).get_mut(&(connection_id.to_string(), resource_type.to_string()))
        {
            existing.retain(|id| !ids.contains(id));
        }
        locked(&self.deleted).extend(ids.iter().cloned());
        Ok(())
    }
}

/// Records every launch; optionally fails them.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launched: Mutex<Vec<NextJobParameters>>,
    pub failure: Option<fn() -> Error>,
}

#[async_trait]
impl JobLauncher for RecordingLauncher {
    async fn launch(&self, params: &NextJobParameters) -> Result<Vec<JobId>> {
        // Yield so concurrent ticks interleave.
        tokio::task::yield_now().await;
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        locked(&self.launched).push(params.clone());
        Ok(vec![JobId::new()])
    }
}

/// A memory store whose runner inserts fail while `failure` is set.
pub struct FailingRunnerStore {
    pub inner: Arc<MemoryJobStore>,
    pub failure: Mutex<Option<fn() -> DbError>>,
}

impl FailingRunnerStore {
    pub fn new(inner: Arc<MemoryJobStore>, failure: fn() -> DbError) -> Self {
        Self {
            inner,
            failure: Mutex::new(Some(failure)),
        }
    }

    pub fn heal(&self) {
        *locked(&self.failure) = None;
    }
}

#[async_trait]
impl JobStore for FailingRunnerStore {
    async fn insert_describe_jobs(&self, jobs: &[DescribeConnectionJob]) -> DbResult<()> {
        self.inner.insert_describe_jobs(jobs).await
    }

    async fn get_describe_job(&self, id: JobId) -> DbResult<DescribeConnectionJob> {
        self.inner.get_describe_job(id).await
    }

    async fn last_describe_job(
        &self,
        connection_id: &str,
        resource_type: &str,
    ) -> DbResult<Option<DescribeConnectionJob>> {
        self.inner.last_describe_job(connection_id, resource_type).await
    }

    async fn list_describe_jobs(&self, filter: &JobFilter) -> DbResult<Vec<DescribeConnectionJob>> {
        self.inner.list_describe_jobs(filter).await
    }

    async fn describe_in_flight_by_type(&self) -> DbResult<HashMap<String, u64>> {
        self.inner.describe_in_flight_by_type().await
    }

    async fn insert_compliance_job(&self, job: &ComplianceJob) -> DbResult<()> {
        self.inner.insert_compliance_job(job).await
    }

    async fn get_compliance_job(&self, id: JobId) -> DbResult<ComplianceJob> {
        self.inner.get_compliance_job(id).await
    }

    async fn list_compliance_jobs(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceJob>> {
        self.inner.list_compliance_jobs(filter).await
    }

    async fn insert_runners(&self, runners: &[ComplianceRunner]) -> DbResult<()> {
        let failure = *locked(&self.failure);
        match failure {
            Some(failure) => Err(failure()),
            None => self.inner.insert_runners(runners).await,
        }
    }

    async fn list_runners(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceRunner>> {
        self.inner.list_runners(filter).await
    }

    async fn insert_summarizer(&self, summarizer: &ComplianceSummarizer) -> DbResult<()> {
        self.inner.insert_summarizer(summarizer).await
    }

    async fn list_summarizers(&self, filter: &JobFilter) -> DbResult<Vec<ComplianceSummarizer>> {
        self.inner.list_summarizers(filter).await
    }

    async fn purge_compliance_jobs(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        self.inner.purge_compliance_jobs(cutoff).await
    }

    async fn insert_analytics_job(&self, job: &AnalyticsJob) -> DbResult<()> {
        self.inner.insert_analytics_job(job).await
    }

    async fn list_analytics_jobs(&self, filter: &JobFilter) -> DbResult<Vec<AnalyticsJob>> {
        self.inner.list_analytics_jobs(filter).await
    }

    async fn insert_sequencer(&self, sequencer: &JobSequencer) -> DbResult<()> {
        self.inner.insert_sequencer(sequencer).await
    }

    async fn list_sequencers(&self, filter: &JobFilter) -> DbResult<Vec<JobSequencer>> {
        self.inner.list_sequencers(filter).await
    }

    async fn get_job(&self, kind: JobKind, id: JobId) -> DbResult<AnyJob> {
        self.inner.get_job(kind, id).await
    }

    async fn job_statuses(
        &self,
        kind: JobKind,
        ids: &[JobId],
    ) -> DbResult<HashMap<JobId, AnyStatus>> {
        self.inner.job_statuses(kind, ids).await
    }

    async fn transition(&self, id: JobId, transition: &Transition) -> DbResult<bool> {
        self.inner.transition(id, transition).await
    }

    async fn count_jobs(&self, kind: JobKind, filter: &JobFilter) -> DbResult<u64> {
        self.inner.count_jobs(kind, filter).await
    }

    async fn count_by_status(
        &self,
        kind: JobKind,
        filter: &JobFilter,
    ) -> DbResult<BTreeMap<String, u64>> {
        self.inner.count_by_status(kind, filter).await
    }

    async fn delete_terminal_jobs(&self, kind: JobKind, cutoff: DateTime<Utc>) -> DbResult<u64> {
        self.inner.delete_terminal_jobs(kind, cutoff).await
    }
}

pub fn resource_types() -> Vec<ResourceTypeSpec> {
    let spec = |name: &str, connector, fast, cost| ResourceTypeSpec {
        name: name.to_string(),
        connector,
        fast,
        cost,
    };
    vec![
        spec("AWS::EC2::Instance", Connector::Aws, true, false),
        spec("AWS::IAM::Role", Connector::Aws, false, false),
        spec("AWS::CostExplorer::ByServiceDaily", Connector::Aws, false, true),
        spec("Microsoft.Compute/virtualMachines", Connector::Azure, true, false),
    ]
}

pub fn registry() -> ResourceTypeRegistry {
    ResourceTypeRegistry::new(resource_types())
}

/// Every collaborator faked, every service sharing one store and clock.
pub struct Harness {
    pub config: OrchestratorConfig,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryJobStore>,
    pub metrics: Arc<InMemoryMetrics>,
    pub substrate: Arc<ChannelSubstrate>,
    pub directory: Arc<FakeDirectory>,
    pub vault: Arc<FakeVault>,
    pub catalog: Arc<FakeCatalog>,
    pub findings: Arc<FakeFindingIndex>,
    pub cleanup: Arc<FakeCleanup>,
    pub registry: Arc<ResourceTypeRegistry>,
    pub admission: Arc<AdmissionController>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default(), 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(OrchestratorConfig::default(), capacity)
    }

    pub fn with_config(mut config: OrchestratorConfig, capacity: usize) -> Self {
        config.initial_jitter = Duration::ZERO;
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryJobStore::new(clock.clone()));
        let metrics = Arc::new(InMemoryMetrics::default());
        let substrate = Arc::new(ChannelSubstrate::new(capacity));
        let directory = Arc::new(FakeDirectory::default());
        directory.add(connection("c1", Connector::Aws));
        let vault = Arc::new(FakeVault::default());

        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            config.admission.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            substrate.clone(),
            directory.clone(),
            vault.clone(),
            metrics.clone(),
            config.describe.max_dispatch_workers,
        ));

        Self {
            config,
            clock,
            store,
            metrics,
            substrate,
            directory,
            vault,
            catalog: Arc::new(FakeCatalog::default()),
            findings: Arc::new(FakeFindingIndex::default()),
            cleanup: Arc::new(FakeCleanup::default()),
            registry: Arc::new(registry()),
            admission,
            dispatcher,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero()));
    }

    /// Insert a `Created` fast describe job.
    pub async fn created_describe(
        &self,
        connection_id: &str,
        resource_type: &str,
    ) -> DescribeConnectionJob {
        let job = DescribeConnectionJob::new(
            self.clock.now(),
            connection_id,
            Connector::Aws,
            resource_type,
            DiscoveryType::Fast,
            TriggerType::Scheduled,
        );
        self.store
            .insert_describe_jobs(std::slice::from_ref(&job))
            .await
            .unwrap();
        job
    }

    pub fn describe(&self) -> DescribeScheduler {
        DescribeScheduler::new(
            self.store.clone(),
            self.directory.clone(),
            self.registry.clone(),
            self.admission.clone(),
            self.dispatcher.clone(),
            self.config.describe.clone(),
            self.clock.clone(),
        )
    }

    pub fn compliance(&self) -> ComplianceScheduler {
        self.compliance_on(self.store.clone())
    }

    /// A compliance scheduler writing through `store`.
    pub fn compliance_on(&self, store: Arc<dyn JobStore>) -> ComplianceScheduler {
        ComplianceScheduler::new(
            store,
            self.catalog.clone(),
            self.directory.clone(),
            self.findings.clone(),
            self.admission.clone(),
            self.dispatcher.clone(),
            self.config.compliance.clone(),
            self.clock.clone(),
        )
    }

    pub fn analytics(&self) -> AnalyticsScheduler {
        AnalyticsScheduler::new(
            self.store.clone(),
            self.admission.clone(),
            self.dispatcher.clone(),
            self.config.analytics.clone(),
            self.clock.clone(),
        )
    }

    pub fn sequencer(&self, launcher: Arc<dyn JobLauncher>) -> SequencerService {
        SequencerService::new(self.store.clone(), launcher, self.clock.clone())
    }

    /// A consumer reading from a fresh result channel.
    pub fn consumer(&self) -> (ResultPublisher, Arc<ChannelResultStream>, ResultConsumer) {
        let (publisher, stream) = result_channel(64);
        let stream = Arc::new(stream);
        let consumer = ResultConsumer::new(
            self.store.clone(),
            stream.clone(),
            self.cleanup.clone(),
            self.metrics.clone(),
        );
        (publisher, stream, consumer)
    }

    pub fn sweeper(&self) -> TimeoutSweeper {
        TimeoutSweeper::new(
            self.store.clone(),
            &self.config,
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    pub fn cancellation(&self) -> CancellationService {
        CancellationService::new(self.store.clone(), self.substrate.clone())
    }

    pub fn retention(&self) -> RetentionSweeper {
        RetentionSweeper::new(
            self.store.clone(),
            self.config.retention.clone(),
            self.clock.clone(),
        )
    }
}
