//! Cloud connections as reported by the onboarding directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

string_enum! {
    /// Cloud provider integration.
    pub enum Connector {
        Aws => "AWS",
        Azure => "Azure",
    }
}

string_enum! {
    pub enum LifecycleState {
        NotOnboard => "NOT_ONBOARD",
        InProgress => "IN_PROGRESS",
        Onboard => "ONBOARD",
        Disabled => "DISABLED",
        Archived => "ARCHIVED",
    }
}

impl LifecycleState {
    /// States in which the connection takes part in scheduled discovery.
    pub fn is_enabled(&self) -> bool {
        matches!(self, LifecycleState::Onboard | LifecycleState::InProgress)
    }
}

string_enum! {
    pub enum HealthState {
        Initial => "initial",
        Healthy => "healthy",
        Unhealthy => "unhealthy",
    }
}

string_enum! {
    pub enum CredentialType {
        AutoAws => "auto-aws",
        ManualAwsOrganization => "manual-aws-org",
        AutoAzure => "auto-azure",
        ManualAzureSpn => "manual-azure-spn",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub connector: Connector,
    pub lifecycle_state: LifecycleState,
    pub health_state: HealthState,
    pub credential_type: CredentialType,
    pub credential_id: String,
    /// Resource types this connection may be described for. Empty means every
    /// registered type of the connector.
    #[serde(default)]
    pub resource_types: Vec<String>,
}

impl Connection {
    pub fn is_healthy(&self) -> bool {
        self.health_state == HealthState::Healthy
    }

    pub fn supports(&self, resource_type: &str) -> bool {
        self.resource_types.is_empty() || self.resource_types.iter().any(|t| t == resource_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionFilter {
    pub connector: Option<Connector>,
    /// Empty matches every lifecycle state.
    pub lifecycle_states: Vec<LifecycleState>,
}

impl ConnectionFilter {
    pub fn enabled() -> Self {
        Self {
            connector: None,
            lifecycle_states: vec![LifecycleState::Onboard, LifecycleState::InProgress],
        }
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        self.connector.is_none_or(|c| c == connection.connector)
            && (self.lifecycle_states.is_empty()
                || self.lifecycle_states.contains(&connection.lifecycle_state))
    }
}

/// The external onboarding service.
#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>>;

    /// Returns `Error::NotFound` for unknown ids.
    async fn get_connection(&self, id: &str) -> Result<Connection>;
}

/// Resolves a connection's credential to a reference executors can use.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn credential_ref(&self, connection: &Connection) -> Result<String>;
}
