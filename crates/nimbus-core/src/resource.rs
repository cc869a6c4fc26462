//! Resource types and discovery classes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::connection::{Connection, Connector};

string_enum! {
    /// How often a resource type is described.
    pub enum DiscoveryType {
        /// Frequent, narrow resource set.
        Fast => "fast",
        /// Infrequent, exhaustive.
        Full => "full",
        /// Billing tables.
        Cost => "cost",
    }
}

string_enum! {
    pub enum TriggerType {
        Scheduled => "scheduled",
        Manual => "manual",
        InitialDiscovery => "initial-discovery",
        Stack => "stack",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeSpec {
    pub name: String,
    pub connector: Connector,
    pub fast: bool,
    pub cost: bool,
}

impl ResourceTypeSpec {
    pub fn discovery_type(&self) -> DiscoveryType {
        if self.cost {
            DiscoveryType::Cost
        } else if self.fast {
            DiscoveryType::Fast
        } else {
            DiscoveryType::Full
        }
    }
}

/// Resource types known to the describers, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ResourceTypeRegistry {
    types: BTreeMap<String, ResourceTypeSpec>,
}

impl ResourceTypeRegistry {
    pub fn new(specs: impl IntoIterator<Item = ResourceTypeSpec>) -> Self {
        Self {
            types: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResourceTypeSpec> {
        self.types.get(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Types that apply to the given connection: same connector and supported
    /// by the connection.
    pub fn applicable_to<'a>(
        &'a self,
        connection: &'a Connection,
    ) -> impl Iterator<Item = &'a ResourceTypeSpec> + 'a {
        self.types
            .values()
            .filter(move |s| s.connector == connection.connector && connection.supports(&s.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CredentialType, HealthState, LifecycleState};

    fn spec(name: &str, connector: Connector, fast: bool, cost: bool) -> ResourceTypeSpec {
        ResourceTypeSpec {
            name: name.to_string(),
            connector,
            fast,
            cost,
        }
    }

    #[test]
    fn test_discovery_type_precedence() {
        assert_eq!(
            spec("AWS::CostExplorer::ByServiceDaily", Connector::Aws, true, true).discovery_type(),
            DiscoveryType::Cost
        );
        assert_eq!(
            spec("AWS::EC2::Instance", Connector::Aws, true, false).discovery_type(),
            DiscoveryType::Fast
        );
        assert_eq!(
            spec("AWS::IAM::Role", Connector::Aws, false, false).discovery_type(),
            DiscoveryType::Full
        );
    }

    #[test]
    fn test_applicable_types_respect_connector_and_support_list() {
        let registry = ResourceTypeRegistry::new(vec![
            spec("AWS::EC2::Instance", Connector::Aws, true, false),
            spec("AWS::S3::Bucket", Connector::Aws, false, false),
            spec("Microsoft.Compute/virtualMachines", Connector::Azure, true, false),
        ]);
        let mut connection = Connection {
            id: "123456789012".into(),
            connector: Connector::Aws,
            lifecycle_state: LifecycleState::Onboard,
            health_state: HealthState::Healthy,
            credential_type: CredentialType::AutoAws,
            credential_id: "cred-1".into(),
            resource_types: vec![],
        };
        assert_eq!(registry.applicable_to(&connection).count(), 2);

        connection.resource_types = vec!["AWS::S3::Bucket".into()];
        let names: Vec<_> = registry
            .applicable_to(&connection)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["AWS::S3::Bucket"]);
    }
}
