//! Job commands: progress and cancellation.

use anyhow::Result;
use clap::Args;
use serde_json::{Map, Value, json};

use super::{ApiClient, print};

#[derive(Debug, Default, Args)]
pub struct FilterArgs {
    /// Only jobs in these statuses
    #[arg(long = "status", value_delimiter = ',')]
    pub statuses: Vec<String>,
    /// Only jobs of this connection
    #[arg(long)]
    pub connection: Option<String>,
    /// Only jobs of this resource type
    #[arg(long)]
    pub resource_type: Option<String>,
    /// Only jobs of this benchmark
    #[arg(long)]
    pub benchmark: Option<String>,
}

impl FilterArgs {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.statuses.is_empty() {
            pairs.push(("status", self.statuses.join(",")));
        }
        if let Some(c) = &self.connection {
            pairs.push(("connection_id", c.clone()));
        }
        if let Some(t) = &self.resource_type {
            pairs.push(("resource_type", t.clone()));
        }
        if let Some(b) = &self.benchmark {
            pairs.push(("benchmark_id", b.clone()));
        }
        pairs
    }

    fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v)))
            .collect();
        Value::Object(map)
    }
}

pub async fn progress(api: &ApiClient, kind: &str, filter: &FilterArgs) -> Result<()> {
    print(&api.get(&format!("jobs/{}/progress", kind), &filter.pairs()).await?)
}

pub async fn cancel(api: &ApiClient, kind: &str, id: &str) -> Result<()> {
    print(&api.post(&format!("jobs/{}/{}/cancel", kind, id), &json!({})).await?)
}

pub async fn cancel_matching(api: &ApiClient, kind: &str, filter: &FilterArgs) -> Result<()> {
    print(&api.post(&format!("jobs/{}/cancel", kind), &filter.to_json()).await?)
}
