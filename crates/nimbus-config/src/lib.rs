//! KDL configuration parsing for the nimbus orchestrator.
//!
//! This crate handles parsing of the orchestrator configuration (`nimbus.kdl`):
//! admission ceilings, loop intervals, timeout and retry policy, and the
//! registry of describable resource types.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    AdmissionConfig, AnalyticsConfig, ComplianceConfig, DescribeConfig, OrchestratorConfig,
    ResultsConfig, RetentionConfig, SequencerConfig, load_orchestrator_config,
    parse_orchestrator_config,
};
