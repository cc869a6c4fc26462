//! Application state.

use nimbus_executor::ResultPublisher;
use nimbus_scheduler::Orchestrator;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Feeds results posted by workers into the orchestrator's consumer.
    pub results: ResultPublisher,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, results: ResultPublisher) -> Self {
        Self {
            orchestrator,
            results,
        }
    }
}
