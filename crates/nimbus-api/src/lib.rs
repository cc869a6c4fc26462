//! Trigger API server for the nimbus orchestrator.
//!
//! Exposes manual triggers, cancellation, progress and the executor result
//! endpoint over HTTP, plus clients for the external services.

pub mod error;
pub mod routes;
pub mod services;
pub mod settings;
pub mod state;

pub use settings::Settings;
pub use state::AppState;
