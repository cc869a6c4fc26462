//! Orchestrator configuration parsing.
//!
//! Every section is optional; anything left out keeps its default.
//!
//! ```kdl
//! initial-jitter "5s"
//! admission {
//!     max-queued 5000
//!     per-type-limit 25
//!     override "AWS::CloudTrail::Trail" 5
//! }
//! describe {
//!     fast-interval "6h"
//!     timeout "4h"
//! }
//! resource-types {
//!     resource-type "AWS::EC2::Instance" connector="aws" fast=#true
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use nimbus_core::connection::Connector;
use nimbus_core::resource::{DiscoveryType, ResourceTypeSpec};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound of the random delay before a loop's first tick.
    pub initial_jitter: Duration,
    pub admission: AdmissionConfig,
    pub describe: DescribeConfig,
    pub compliance: ComplianceConfig,
    pub analytics: AnalyticsConfig,
    pub sequencer: SequencerConfig,
    pub results: ResultsConfig,
    pub retention: RetentionConfig,
    pub resource_types: Vec<ResourceTypeSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            initial_jitter: Duration::from_secs(5),
            admission: AdmissionConfig::default(),
            describe: DescribeConfig::default(),
            compliance: ComplianceConfig::default(),
            analytics: AnalyticsConfig::default(),
            sequencer: SequencerConfig::default(),
            results: ResultsConfig::default(),
            retention: RetentionConfig::default(),
            resource_types: Vec::new(),
        }
    }
}

/// Backpressure ceilings applied before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Skip a cycle when more jobs than this are queued.
    pub max_queued: u64,
    /// Skip a cycle when more jobs than this started inside `recent_window`.
    pub max_in_recent_window: u64,
    pub recent_window: Duration,
    /// Concurrently in-flight jobs allowed per resource type.
    pub per_type_limit: u64,
    pub overrides: BTreeMap<String, u64>,
}

impl AdmissionConfig {
    pub fn limit_for(&self, resource_type: &str) -> u64 {
        self.overrides
            .get(resource_type)
            .copied()
            .unwrap_or(self.per_type_limit)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queued: 5000,
            max_in_recent_window: 5000,
            recent_window: 10 * MINUTE,
            per_type_limit: 25,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescribeConfig {
    pub tick: Duration,
    pub fast_interval: Duration,
    pub full_interval: Duration,
    pub cost_interval: Duration,
    /// Non-terminal jobs not updated for this long are timed out.
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_dispatch_workers: usize,
}

impl DescribeConfig {
    pub fn interval_for(&self, discovery: DiscoveryType) -> Duration {
        match discovery {
            DiscoveryType::Fast => self.fast_interval,
            DiscoveryType::Full => self.full_interval,
            DiscoveryType::Cost => self.cost_interval,
        }
    }
}

impl Default for DescribeConfig {
    fn default() -> Self {
        Self {
            tick: MINUTE,
            fast_interval: 6 * HOUR,
            full_interval: 2 * DAY,
            cost_interval: DAY,
            timeout: 4 * HOUR,
            max_retries: 3,
            max_dispatch_workers: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceConfig {
    pub tick: Duration,
    pub runner_timeout: Duration,
    pub summarizer_timeout: Duration,
    pub sink_timeout: Duration,
    /// Failed units younger than this are re-armed.
    pub retry_window: Duration,
    pub max_retries: u32,
    /// Jobs and their children older than this are purged.
    pub retention: Duration,
    /// Share of the expected finding volume that makes runners "effectively complete".
    pub completion_threshold: f64,
    /// How long runners must have been quiet before the threshold applies.
    pub completion_grace: Duration,
    pub batch_size: usize,
    pub controls_per_runner: usize,
    /// Route succeeded jobs through the sink stage.
    pub sink: bool,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            runner_timeout: HOUR,
            summarizer_timeout: HOUR,
            sink_timeout: HOUR,
            retry_window: 5 * MINUTE,
            max_retries: 3,
            retention: 7 * DAY,
            completion_threshold: 0.9,
            completion_grace: HOUR,
            batch_size: 500,
            controls_per_runner: 1,
            sink: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub tick: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            tick: MINUTE,
            interval: 2 * HOUR,
            timeout: 2 * HOUR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfig {
    pub tick: Duration,
    /// Sequencers stuck launching for this long are failed.
    pub timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            timeout: HOUR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsConfig {
    pub sweep_interval: Duration,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            sweep_interval: MINUTE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub tick: Duration,
    /// Terminal describe, analytics and sequencer records older than this are deleted.
    pub describe_jobs: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            tick: HOUR,
            describe_jobs: 7 * DAY,
        }
    }
}

/// Read and parse a configuration file.
pub fn load_orchestrator_config(path: impl AsRef<Path>) -> ConfigResult<OrchestratorConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_orchestrator_config(&content)
}

/// Parse orchestrator configuration from KDL text.
pub fn parse_orchestrator_config(kdl: &str) -> ConfigResult<OrchestratorConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = OrchestratorConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "initial-jitter" => config.initial_jitter = duration_arg(node)?,
            "admission" => parse_admission(node, &mut config.admission)?,
            "describe" => parse_describe(node, &mut config.describe)?,
            "compliance" => parse_compliance(node, &mut config.compliance)?,
            "analytics" => parse_analytics(node, &mut config.analytics)?,
            "sequencer" => parse_sequencer(node, &mut config.sequencer)?,
            "results" => {
                for child in children(node) {
                    if child.name().value() == "sweep-interval" {
                        config.results.sweep_interval = duration_arg(child)?;
                    }
                }
            }
            "retention" => {
                for child in children(node) {
                    match child.name().value() {
                        "tick" => config.retention.tick = duration_arg(child)?,
                        "describe-jobs" => config.retention.describe_jobs = duration_arg(child)?,
                        _ => {}
                    }
                }
            }
            "resource-types" => config.resource_types = parse_resource_types(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&config)?;
    Ok(config)
}

fn parse_admission(node: &KdlNode, admission: &mut AdmissionConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "max-queued" => admission.max_queued = u64_arg(child)?,
            "max-in-10-minutes" => admission.max_in_recent_window = u64_arg(child)?,
            "recent-window" => admission.recent_window = duration_arg(child)?,
            "per-type-limit" => admission.per_type_limit = u64_arg(child)?,
            "override" => {
                let resource_type = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("override resource type".into()))?;
                let limit = child
                    .entries()
                    .iter()
                    .filter(|e| e.name().is_none())
                    .find_map(|e| e.value().as_integer())
                    .ok_or_else(|| {
                        ConfigError::MissingField(format!("limit for override '{resource_type}'"))
                    })?;
                let limit = u64::try_from(limit)
                    .map_err(|_| ConfigError::invalid("override", "limit must be positive"))?;
                if admission.overrides.insert(resource_type.clone(), limit).is_some() {
                    return Err(ConfigError::Duplicate(format!("override '{resource_type}'")));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_describe(node: &KdlNode, describe: &mut DescribeConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "tick" => describe.tick = duration_arg(child)?,
            "fast-interval" => describe.fast_interval = duration_arg(child)?,
            "full-interval" => describe.full_interval = duration_arg(child)?,
            "cost-interval" => describe.cost_interval = duration_arg(child)?,
            "timeout" => describe.timeout = duration_arg(child)?,
            "max-retries" => describe.max_retries = u32_arg(child)?,
            "max-dispatch-workers" => describe.max_dispatch_workers = usize_arg(child)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_compliance(node: &KdlNode, compliance: &mut ComplianceConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "tick" => compliance.tick = duration_arg(child)?,
            "runner-timeout" => compliance.runner_timeout = duration_arg(child)?,
            "summarizer-timeout" => compliance.summarizer_timeout = duration_arg(child)?,
            "sink-timeout" => compliance.sink_timeout = duration_arg(child)?,
            "retry-window" => compliance.retry_window = duration_arg(child)?,
            "max-retries" => compliance.max_retries = u32_arg(child)?,
            "retention" => compliance.retention = duration_arg(child)?,
            "completion-threshold" => compliance.completion_threshold = f64_arg(child)?,
            "completion-grace" => compliance.completion_grace = duration_arg(child)?,
            "batch-size" => compliance.batch_size = usize_arg(child)?,
            "controls-per-runner" => compliance.controls_per_runner = usize_arg(child)?,
            "sink" => compliance.sink = bool_arg(child)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_analytics(node: &KdlNode, analytics: &mut AnalyticsConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "tick" => analytics.tick = duration_arg(child)?,
            "interval" => analytics.interval = duration_arg(child)?,
            "timeout" => analytics.timeout = duration_arg(child)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_sequencer(node: &KdlNode, sequencer: &mut SequencerConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "tick" => sequencer.tick = duration_arg(child)?,
            "timeout" => sequencer.timeout = duration_arg(child)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_resource_types(node: &KdlNode) -> ConfigResult<Vec<ResourceTypeSpec>> {
    let mut specs = Vec::new();
    let mut seen = HashSet::new();

    for child in children(node) {
        if child.name().value() != "resource-type" {
            continue;
        }
        let name = get_first_string_arg(child)
            .ok_or_else(|| ConfigError::MissingField("resource-type name".to_string()))?;
        let connector = get_string_prop(child, "connector")
            .ok_or_else(|| ConfigError::MissingField(format!("connector for '{name}'")))?;
        let connector = match connector.to_ascii_lowercase().as_str() {
            "aws" => Connector::Aws,
            "azure" => Connector::Azure,
            other => {
                return Err(ConfigError::invalid(
                    "connector",
                    format!("unknown connector '{other}' for '{name}'"),
                ));
            }
        };
        if !seen.insert(name.clone()) {
            return Err(ConfigError::Duplicate(format!("resource-type '{name}'")));
        }
        specs.push(ResourceTypeSpec {
            name,
            connector,
            fast: get_bool_prop(child, "fast").unwrap_or(false),
            cost: get_bool_prop(child, "cost").unwrap_or(false),
        });
    }

    Ok(specs)
}

fn validate(config: &OrchestratorConfig) -> ConfigResult<()> {
    let threshold = config.compliance.completion_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ConfigError::invalid(
            "completion-threshold",
            format!("{threshold} is outside (0, 1]"),
        ));
    }
    if config.compliance.batch_size == 0 {
        return Err(ConfigError::invalid("batch-size", "must be at least 1"));
    }
    if config.compliance.controls_per_runner == 0 {
        return Err(ConfigError::invalid("controls-per-runner", "must be at least 1"));
    }
    if config.admission.per_type_limit == 0 {
        return Err(ConfigError::invalid("per-type-limit", "must be at least 1"));
    }
    if config.describe.max_dispatch_workers == 0 {
        return Err(ConfigError::invalid("max-dispatch-workers", "must be at least 1"));
    }
    for (name, tick) in [
        ("describe tick", config.describe.tick),
        ("compliance tick", config.compliance.tick),
        ("analytics tick", config.analytics.tick),
        ("sequencer tick", config.sequencer.tick),
        ("sweep-interval", config.results.sweep_interval),
        ("retention tick", config.retention.tick),
    ] {
        if tick.is_zero() {
            return Err(ConfigError::invalid(name, "must be greater than zero"));
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .map(|doc| doc.nodes())
        .unwrap_or_default()
        .iter()
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn field(node: &KdlNode) -> &str {
    node.name().value()
}

fn u64_arg(node: &KdlNode) -> ConfigResult<u64> {
    let value = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::invalid(field(node), "expected an integer"))?;
    u64::try_from(value).map_err(|_| ConfigError::invalid(field(node), "must not be negative"))
}

fn u32_arg(node: &KdlNode) -> ConfigResult<u32> {
    let value = u64_arg(node)?;
    u32::try_from(value).map_err(|_| ConfigError::invalid(field(node), "value too large"))
}

fn usize_arg(node: &KdlNode) -> ConfigResult<usize> {
    let value = u64_arg(node)?;
    usize::try_from(value).map_err(|_| ConfigError::invalid(field(node), "value too large"))
}

fn f64_arg(node: &KdlNode) -> ConfigResult<f64> {
    let value = first_arg(node)
        .ok_or_else(|| ConfigError::invalid(field(node), "expected a number"))?;
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
        .ok_or_else(|| ConfigError::invalid(field(node), "expected a number"))
}

fn bool_arg(node: &KdlNode) -> ConfigResult<bool> {
    first_arg(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ConfigError::invalid(field(node), "expected #true or #false"))
}

fn duration_arg(node: &KdlNode) -> ConfigResult<Duration> {
    let text = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::invalid(field(node), "expected a duration like \"30s\""))?;
    parse_duration(&text).map_err(|message| ConfigError::invalid(field(node), message))
}

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(ms|s|m|h|d)\s*$").expect("duration pattern is valid")
});

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"` or `"7d"`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let caps = DURATION_PATTERN
        .captures(text)
        .ok_or_else(|| format!("'{text}' is not a duration (use ms, s, m, h or d)"))?;
    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| format!("'{text}' is out of range"))?;
    let unit = match &caps[2] {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => 24 * 60 * 60,
    };
    amount
        .checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("'{text}' is out of range"))
}
