//! Job kinds, status machines and job records.
//!
//! Every record is a [`JobHeader`] plus a kind-specific payload. Status enums
//! are kind-specific but share the same shape: a set of non-terminal states
//! that only move forward, a set of terminal states, and a retry edge from the
//! failure states back to `Created` that is guarded by the retry ceiling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::connection::Connector;
use crate::resource::{DiscoveryType, TriggerType};
use crate::{Error, JobId, Result};

string_enum! {
    /// The kinds of job the orchestrator persists.
    pub enum JobKind {
        Describe => "describe",
        Compliance => "compliance",
        ComplianceRunner => "compliance-runner",
        ComplianceSummarizer => "compliance-summarizer",
        Analytics => "analytics",
        Sequencer => "sequencer",
    }
}

impl JobKind {
    /// Parse a status string belonging to this kind.
    pub fn parse_status(&self, status: &str) -> Result<AnyStatus> {
        Ok(match self {
            JobKind::Describe => AnyStatus::Describe(status.parse()?),
            JobKind::Compliance => AnyStatus::Compliance(status.parse()?),
            JobKind::ComplianceRunner | JobKind::ComplianceSummarizer | JobKind::Analytics => {
                AnyStatus::Task(status.parse()?)
            }
            JobKind::Sequencer => AnyStatus::Sequencer(status.parse()?),
        })
    }

    /// Every status string this kind can be in.
    pub fn statuses(&self) -> Vec<&'static str> {
        match self {
            JobKind::Describe => DescribeStatus::ALL.iter().map(|s| s.as_str()).collect(),
            JobKind::Compliance => ComplianceJobStatus::ALL.iter().map(|s| s.as_str()).collect(),
            JobKind::ComplianceRunner | JobKind::ComplianceSummarizer | JobKind::Analytics => {
                TaskStatus::ALL.iter().map(|s| s.as_str()).collect()
            }
            JobKind::Sequencer => SequencerStatus::ALL.iter().map(|s| s.as_str()).collect(),
        }
    }

    /// Status strings that are not terminal for this kind.
    pub fn active_statuses(&self) -> Vec<&'static str> {
        self.statuses()
            .into_iter()
            .filter(|s| {
                self.parse_status(s)
                    .map(|status| !status.is_terminal())
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Behaviour shared by every per-kind status enum.
pub trait JobState:
    Copy + Eq + fmt::Debug + fmt::Display + FromStr<Err = Error> + Send + Sync + 'static
{
    fn name(&self) -> &'static str;

    fn is_terminal(&self) -> bool;

    /// Whether the state machine has an edge from `self` to `next`.
    fn can_transition_to(&self, next: Self) -> bool;
}

string_enum! {
    /// Status of a describe job for one (connection, resource type) pair.
    pub enum DescribeStatus {
        Created => "CREATED",
        Queued => "QUEUED",
        InProgress => "IN_PROGRESS",
        /// Result received; resources no longer reported are being deleted.
        OldResourceDeletion => "OLD_RESOURCE_DELETION",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Timeout => "TIMEOUT",
        Canceled => "CANCELED",
    }
}

impl JobState for DescribeStatus {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            DescribeStatus::Succeeded
                | DescribeStatus::Failed
                | DescribeStatus::Timeout
                | DescribeStatus::Canceled
        )
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use DescribeStatus::*;
        match self {
            Created => matches!(next, Queued | Failed | Timeout | Canceled),
            Queued => matches!(
                next,
                InProgress | OldResourceDeletion | Succeeded | Failed | Timeout | Canceled
            ),
            InProgress => matches!(next, OldResourceDeletion | Succeeded | Failed | Timeout),
            OldResourceDeletion => matches!(next, Succeeded | Failed | Timeout),
            Failed | Timeout => next == Created,
            Succeeded | Canceled => false,
        }
    }
}

string_enum! {
    /// Status of a benchmark evaluation (the parent of runners and the summarizer).
    pub enum ComplianceJobStatus {
        Created => "CREATED",
        RunnersInProgress => "RUNNERS_IN_PROGRESS",
        SummarizerInProgress => "SUMMARIZER_IN_PROGRESS",
        SinkInProgress => "SINK_IN_PROGRESS",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Canceled => "CANCELED",
        TimeOut => "TIMEOUT",
    }
}

impl JobState for ComplianceJobStatus {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComplianceJobStatus::Succeeded
                | ComplianceJobStatus::Failed
                | ComplianceJobStatus::Canceled
                | ComplianceJobStatus::TimeOut
        )
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use ComplianceJobStatus::*;
        match self {
            Created => matches!(next, RunnersInProgress | Failed | Canceled | TimeOut),
            RunnersInProgress => {
                matches!(next, Created | SummarizerInProgress | Failed | TimeOut)
            }
            SummarizerInProgress => matches!(next, SinkInProgress | Succeeded | Failed | TimeOut),
            SinkInProgress => matches!(next, Succeeded | Failed | TimeOut),
            Succeeded | Failed | Canceled | TimeOut => false,
        }
    }
}

string_enum! {
    /// Status of a dispatched unit of work: compliance runners, summarizers and
    /// analytics jobs all share this machine.
    pub enum TaskStatus {
        Created => "CREATED",
        Queued => "QUEUED",
        InProgress => "IN_PROGRESS",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        TimeOut => "TIMEOUT",
        Canceled => "CANCELED",
    }
}

impl TaskStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::TimeOut)
    }
}

impl JobState for TaskStatus {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimeOut | TaskStatus::Canceled
        )
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use TaskStatus::*;
        match self {
            Created => matches!(next, Queued | Failed | TimeOut | Canceled),
            Queued => matches!(next, InProgress | Succeeded | Failed | TimeOut | Canceled),
            InProgress => matches!(next, Succeeded | Failed | TimeOut),
            Failed | TimeOut => next == Created,
            Succeeded | Canceled => false,
        }
    }
}

string_enum! {
    pub enum SequencerStatus {
        WaitingForDependencies => "WAITING_FOR_DEPENDENCIES",
        /// Claimed by one tick; the next job is being created.
        Launching => "LAUNCHING",
        Finished => "FINISHED",
        Failed => "FAILED",
    }
}

impl JobState for SequencerStatus {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SequencerStatus::Finished | SequencerStatus::Failed)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use SequencerStatus::*;
        match self {
            WaitingForDependencies => matches!(next, Launching | Failed),
            Launching => matches!(next, WaitingForDependencies | Finished | Failed),
            Finished | Failed => false,
        }
    }
}

/// A status of any kind, for code that handles jobs generically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyStatus {
    Describe(DescribeStatus),
    Compliance(ComplianceJobStatus),
    Task(TaskStatus),
    Sequencer(SequencerStatus),
}

impl AnyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnyStatus::Describe(s) => s.as_str(),
            AnyStatus::Compliance(s) => s.as_str(),
            AnyStatus::Task(s) => s.as_str(),
            AnyStatus::Sequencer(s) => s.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            AnyStatus::Describe(s) => s.is_terminal(),
            AnyStatus::Compliance(s) => s.is_terminal(),
            AnyStatus::Task(s) => s.is_terminal(),
            AnyStatus::Sequencer(s) => s.is_terminal(),
        }
    }
}

impl fmt::Display for AnyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields every job record carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHeader {
    pub id: JobId,
    /// Owning job or scheduling batch.
    pub parent_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    /// Heartbeat used for timeout detection; bumped on every transition.
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub failure_message: Option<String>,
    pub error_code: Option<String>,
}

impl JobHeader {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            parent_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            retry_count: 0,
            failure_message: None,
            error_code: None,
        }
    }

    pub fn with_parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Read access shared by all job records.
pub trait JobRecord {
    fn kind(&self) -> JobKind;

    fn header(&self) -> &JobHeader;

    fn any_status(&self) -> AnyStatus;

    fn id(&self) -> JobId {
        self.header().id
    }

    fn is_terminal(&self) -> bool {
        self.any_status().is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescribeConnectionJob {
    #[serde(flatten)]
    pub header: JobHeader,
    pub status: DescribeStatus,
    pub connection_id: String,
    pub connector: Connector,
    pub resource_type: String,
    pub discovery_type: DiscoveryType,
    pub trigger_type: TriggerType,
    pub described_resource_count: u64,
    pub deleting_count: u64,
}

impl DescribeConnectionJob {
    pub fn new(
        now: DateTime<Utc>,
        connection_id: impl Into<String>,
        connector: Connector,
        resource_type: impl Into<String>,
        discovery_type: DiscoveryType,
        trigger_type: TriggerType,
    ) -> Self {
        Self {
            header: JobHeader::new(now),
            status: DescribeStatus::Created,
            connection_id: connection_id.into(),
            connector,
            resource_type: resource_type.into(),
            discovery_type,
            trigger_type,
            described_resource_count: 0,
            deleting_count: 0,
        }
    }
}

impl JobRecord for DescribeConnectionJob {
    fn kind(&self) -> JobKind {
        JobKind::Describe
    }

    fn header(&self) -> &JobHeader {
        &self.header
    }

    fn any_status(&self) -> AnyStatus {
        AnyStatus::Describe(self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceJob {
    #[serde(flatten)]
    pub header: JobHeader,
    pub status: ComplianceJobStatus,
    pub benchmark_id: String,
    pub connection_ids: Vec<String>,
    /// Restricts the run to these controls; empty means the whole benchmark.
    pub control_ids: Vec<String>,
    pub trigger_type: TriggerType,
}

impl JobRecord for ComplianceJob {
    fn kind(&self) -> JobKind {
        JobKind::Compliance
    }

    fn header(&self) -> &JobHeader {
        &self.header
    }

    fn any_status(&self) -> AnyStatus {
        AnyStatus::Compliance(self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRunner {
    /// `parent_id` is the owning [`ComplianceJob`].
    #[serde(flatten)]
    pub header: JobHeader,
    pub status: TaskStatus,
    pub benchmark_id: String,
    pub control_ids: Vec<String>,
    pub connection_ids: Vec<String>,
    pub total_finding_count: u64,
}

impl JobRecord for ComplianceRunner {
    fn kind(&self) -> JobKind {
        JobKind::ComplianceRunner
    }

    fn header(&self) -> &JobHeader {
        &self.header
    }

    fn any_status(&self) -> AnyStatus {
        AnyStatus::Task(self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSummarizer {
    #[serde(flatten)]
    pub header: JobHeader,
    pub status: TaskStatus,
    pub benchmark_id: String,
}

impl JobRecord for ComplianceSummarizer {
    fn kind(&self) -> JobKind {
        JobKind::ComplianceSummarizer
    }

    fn header(&self) -> &JobHeader {
        &self.header
    }

    fn any_status(&self) -> AnyStatus {
        AnyStatus::Task(self.status)
    }
}

string_enum! {
    pub enum AnalyticsType {
        Normal => "normal",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsJob {
    #[serde(flatten)]
    pub header: JobHeader,
    pub status: TaskStatus,
    pub analytics_type: AnalyticsType,
}

impl JobRecord for AnalyticsJob {
    fn kind(&self) -> JobKind {
        JobKind::Analytics
    }

    fn header(&self) -> &JobHeader {
        &self.header
    }

    fn any_status(&self) -> AnyStatus {
        AnyStatus::Task(self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSequencer {
    #[serde(flatten)]
    pub header: JobHeader,
    pub status: SequencerStatus,
    pub dependency_source: JobKind,
    pub dependency_list: Vec<JobId>,
    pub next_job: JobKind,
    /// Serialized [`crate::sequence::NextJobParameters`]; decoded only when launching.
    pub next_job_parameters: serde_json::Value,
    /// Jobs created by the launch, kept for observability.
    pub next_job_ids: Vec<JobId>,
}

impl JobRecord for JobSequencer {
    fn kind(&self) -> JobKind {
        JobKind::Sequencer
    }

    fn header(&self) -> &JobHeader {
        &self.header
    }

    fn any_status(&self) -> AnyStatus {
        AnyStatus::Sequencer(self.status)
    }
}

/// A job record of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AnyJob {
    Describe(DescribeConnectionJob),
    Compliance(ComplianceJob),
    ComplianceRunner(ComplianceRunner),
    ComplianceSummarizer(ComplianceSummarizer),
    Analytics(AnalyticsJob),
    Sequencer(JobSequencer),
}

impl AnyJob {
    fn record(&self) -> &dyn JobRecord {
        match self {
            AnyJob::Describe(j) => j,
            AnyJob::Compliance(j) => j,
            AnyJob::ComplianceRunner(j) => j,
            AnyJob::ComplianceSummarizer(j) => j,
            AnyJob::Analytics(j) => j,
            AnyJob::Sequencer(j) => j,
        }
    }
}

impl JobRecord for AnyJob {
    fn kind(&self) -> JobKind {
        self.record().kind()
    }

    fn header(&self) -> &JobHeader {
        self.record().header()
    }

    fn any_status(&self) -> AnyStatus {
        self.record().any_status()
    }
}

/// Field updates applied together with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub failure_message: Option<String>,
    pub error_code: Option<String>,
    pub described_resource_count: Option<u64>,
    pub deleting_count: Option<u64>,
    pub total_finding_count: Option<u64>,
    pub next_job_ids: Option<Vec<JobId>>,
    /// Set `started_at` to the transition time if it is unset.
    pub mark_started: bool,
    pub increment_retry: bool,
    /// Clear `failure_message` and `error_code` (used when re-arming a retry).
    pub clear_failure: bool,
}

impl JobPatch {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            failure_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn started(mut self) -> Self {
        self.mark_started = true;
        self
    }

    /// Apply the header-level parts of the patch.
    pub fn apply_to_header(&self, header: &mut JobHeader, now: DateTime<Utc>) {
        header.updated_at = now;
        if self.clear_failure {
            header.failure_message = None;
            header.error_code = None;
        }
        if let Some(message) = &self.failure_message {
            header.failure_message = Some(message.clone());
        }
        if let Some(code) = &self.error_code {
            header.error_code = Some(code.clone());
        }
        if self.mark_started && header.started_at.is_none() {
            header.started_at = Some(now);
        }
        if self.increment_retry {
            header.retry_count += 1;
        }
    }
}

/// A compare-and-set status update: applied only if the job is currently in
/// one of `from` (and, for retries, below the retry ceiling).
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: JobKind,
    pub from: Vec<&'static str>,
    pub to: &'static str,
    pub patch: JobPatch,
    pub max_retries: Option<u32>,
}

impl Transition {
    pub fn new<S: JobState>(kind: JobKind, from: &[S], to: S) -> Self {
        debug_assert!(
            from.iter().all(|s| s.can_transition_to(to)),
            "illegal {kind} transition {from:?} -> {to}"
        );
        Self {
            kind,
            from: from.iter().map(|s| s.name()).collect(),
            to: to.name(),
            patch: JobPatch::default(),
            max_retries: None,
        }
    }

    pub fn describe(from: &[DescribeStatus], to: DescribeStatus) -> Self {
        Self::new(JobKind::Describe, from, to)
    }

    pub fn compliance(from: &[ComplianceJobStatus], to: ComplianceJobStatus) -> Self {
        Self::new(JobKind::Compliance, from, to)
    }

    pub fn sequencer(from: &[SequencerStatus], to: SequencerStatus) -> Self {
        Self::new(JobKind::Sequencer, from, to)
    }

    pub fn with_patch(mut self, patch: JobPatch) -> Self {
        self.patch = patch;
        self
    }

    /// Turn this into a retry re-arm: bumps `retry_count`, clears the failure,
    /// and only applies while `retry_count < max_retries`.
    pub fn retry(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self.patch.increment_retry = true;
        self.patch.clear_failure = true;
        self
    }

    /// Whether a job in `current` with `retry_count` retries matches the guard.
    pub fn allows(&self, current: &str, retry_count: u32) -> bool {
        self.from.contains(&current) && self.max_retries.is_none_or(|max| retry_count < max)
    }
}
