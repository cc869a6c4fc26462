//! Resource index used to tombstone resources that disappeared.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceIdPage {
    pub ids: Vec<String>,
    /// Cursor for the next page, `None` on the last page.
    pub next: Option<String>,
}

#[async_trait]
pub trait CleanupTarget: Send + Sync {
    async fn existing_resource_ids(
        &self,
        connection_id: &str,
        resource_type: &str,
        cursor: Option<String>,
    ) -> Result<ResourceIdPage>;

    async fn delete_resources(
        &self,
        connection_id: &str,
        resource_type: &str,
        ids: &[String],
    ) -> Result<()>;
}
