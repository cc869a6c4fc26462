//! Core domain types and traits for the nimbus orchestration engine.
//!
//! This crate contains:
//! - Job identifiers, job kinds and their status machines
//! - Job records (common header plus kind-specific payload)
//! - Connection, resource-type and compliance catalog types
//! - Execution substrate trait and result wire messages
//! - Collaborator traits (connection directory, cleanup target, finding index)

#[macro_use]
mod macros;

pub mod cleanup;
pub mod clock;
pub mod compliance;
pub mod connection;
pub mod error;
pub mod id;
pub mod job;
pub mod resource;
pub mod sequence;
pub mod substrate;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::JobId;
pub use job::{AnyJob, AnyStatus, JobHeader, JobKind, JobPatch, JobRecord, JobState, Transition};
