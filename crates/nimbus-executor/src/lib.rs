//! Execution substrates for the nimbus orchestrator.
//!
//! Provides substrate implementations for handing jobs to workers:
//! - In-process channels (single binary deployments and tests)
//! - HTTP (remote worker fleet)

pub mod channel;
pub mod http;

pub use channel::{ChannelResultStream, ChannelSubstrate, ResultPublisher, result_channel};
pub use http::HttpSubstrate;
pub use nimbus_core::substrate::{
    Delivery, EnqueueOutcome, ExecutionPayload, ExecutionSubstrate, JobResultMessage,
    ResultStatus, ResultStream,
};
