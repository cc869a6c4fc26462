//! Trigger commands.

use anyhow::Result;
use serde_json::json;

use super::{ApiClient, print};

pub async fn describe(api: &ApiClient, connection: &str, resource_types: Vec<String>) -> Result<()> {
    let body = json!({
        "connection_id": connection,
        "resource_types": resource_types,
    });
    print(&api.post("trigger/describe", &body).await?)
}

pub async fn benchmark(
    api: &ApiClient,
    benchmark: &str,
    connections: Vec<String>,
    controls: Vec<String>,
) -> Result<()> {
    let body = json!({
        "connection_ids": connections,
        "control_ids": controls,
    });
    print(&api.post(&format!("trigger/benchmarks/{}", benchmark), &body).await?)
}
