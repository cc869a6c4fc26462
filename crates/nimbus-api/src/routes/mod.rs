//! API routes.

pub mod health;
pub mod jobs;
pub mod triggers;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/trigger", triggers::router())
        .merge(jobs::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use nimbus_config::OrchestratorConfig;
    use nimbus_core::cleanup::{CleanupTarget, ResourceIdPage};
    use nimbus_core::compliance::{Benchmark, ComplianceCatalog, Control, FindingIndex};
    use nimbus_core::connection::{
        Connection, ConnectionDirectory, ConnectionFilter, Connector, CredentialType,
        CredentialVault, HealthState, LifecycleState,
    };
    use nimbus_core::resource::ResourceTypeSpec;
    use nimbus_core::{Error, JobId, Result, SystemClock};
    use nimbus_db::MemoryJobStore;
    use nimbus_executor::{ChannelSubstrate, result_channel};
    use nimbus_scheduler::{Collaborators, NoopMetrics, Orchestrator};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// One AWS connection and one benchmark with two controls.
    struct Services;

    #[async_trait]
    impl ConnectionDirectory for Services {
        async fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>> {
            Ok(vec![self.get_connection("c1").await?]
                .into_iter()
                .filter(|c| filter.matches(c))
                .collect())
        }

        async fn get_connection(&self, id: &str) -> Result<Connection> {
            if id != "c1" {
                return Err(Error::NotFound(format!("connection {id}")));
            }
            Ok(Connection {
                id: id.to_string(),
                connector: Connector::Aws,
                lifecycle_state: LifecycleState::Onboard,
                health_state: HealthState::Healthy,
                credential_type: CredentialType::AutoAws,
                credential_id: "secret".to_string(),
                resource_types: vec![],
            })
        }
    }

    #[async_trait]
    impl CredentialVault for Services {
        async fn credential_ref(&self, connection: &Connection) -> Result<String> {
            Ok(format!("cred-{}", connection.id))
        }
    }

    #[async_trait]
    impl ComplianceCatalog for Services {
        async fn get_benchmark(&self, id: &str) -> Result<Benchmark> {
            if id != "cis" {
                return Err(Error::NotFound(format!("benchmark {id}")));
            }
            Ok(Benchmark {
                id: id.to_string(),
                title: "CIS".to_string(),
                controls: vec!["cis_1".to_string(), "cis_2".to_string()],
                children: vec![],
            })
        }

        async fn list_controls(&self, ids: &[String]) -> Result<Vec<Control>> {
            Ok(ids
                .iter()
                .map(|id| Control {
                    id: id.clone(),
                    title: id.clone(),
                })
                .collect())
        }
    }

    #[async_trait]
    impl FindingIndex for Services {
        async fn count_findings(&self, _job_id: JobId) -> Result<u64> {
            Ok(0)
        }

        async fn summary_indexed(&self, _job_id: JobId) -> Result<bool> {
            Ok(true)
        }
    }

    #[async_trait]
    impl CleanupTarget for Services {
        async fn existing_resource_ids(
            &self,
            _connection_id: &str,
            _resource_type: &str,
            _cursor: Option<String>,
        ) -> Result<ResourceIdPage> {
            Ok(ResourceIdPage::default())
        }

        async fn delete_resources(
            &self,
            _connection_id: &str,
            _resource_type: &str,
            _ids: &[String],
        ) -> Result<()> {
            Ok(())
        }
    }

    fn app() -> Router {
        let mut config = OrchestratorConfig::default();
        config.resource_types = vec![ResourceTypeSpec {
            name: "AWS::EC2::Instance".to_string(),
            connector: Connector::Aws,
            fast: true,
            cost: false,
        }];
        let clock = Arc::new(SystemClock);
        let services = Arc::new(Services);
        let (publisher, stream) = result_channel(16);
        let collaborators = Collaborators {
            directory: services.clone(),
            vault: services.clone(),
            catalog: services.clone(),
            finding_index: services.clone(),
            cleanup: services,
            substrate: Arc::new(ChannelSubstrate::new(16)),
            results: Arc::new(stream),
        };
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryJobStore::new(clock.clone())),
            config,
            collaborators,
            Arc::new(NoopMetrics),
            clock,
        );
        router(AppState::new(Arc::new(orchestrator), publisher))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        let (status, _) = call(&app, "GET", "/health/ready", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_trigger_describe_status_codes() {
        let app = app();
        let request = json!({ "connection_id": "c1", "resource_types": ["AWS::EC2::Instance"] });

        let (status, body) = call(&app, "POST", "/api/v1/trigger/describe", Some(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_ids"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "POST", "/api/v1/trigger/describe", Some(request)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());

        let unknown = json!({ "connection_id": "nope", "resource_types": ["AWS::EC2::Instance"] });
        let (status, _) = call(&app, "POST", "/api/v1/trigger/describe", Some(unknown)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trigger_benchmark_status_codes() {
        let app = app();
        let request = json!({ "connection_ids": ["c1"] });

        let (status, body) = call(&app, "POST", "/api/v1/trigger/benchmarks/cis", Some(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["job_id"].is_string());

        let (status, _) = call(&app, "POST", "/api/v1/trigger/benchmarks/cis", Some(request.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "POST", "/api/v1/trigger/benchmarks/missing", Some(request)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_progress_and_cancel() {
        let app = app();
        let request = json!({ "connection_id": "c1", "resource_types": ["AWS::EC2::Instance"] });
        let (_, body) = call(&app, "POST", "/api/v1/trigger/describe", Some(request)).await;
        let id = body["job_ids"][0].as_str().unwrap().to_string();

        let (status, body) = call(&app, "GET", "/api/v1/jobs/describe/progress?connection_id=c1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["counts"]["QUEUED"], 1);

        let (status, _) = call(&app, "POST", &format!("/api/v1/jobs/describe/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, "POST", &format!("/api/v1/jobs/describe/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already finished"));

        let (status, _) = call(&app, "GET", "/api/v1/jobs/describe/progress?status=RUNNING", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "GET", "/api/v1/jobs/widgets/progress", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_sequencer_and_post_result() {
        let app = app();
        let request = json!({
            "dependency_source": "describe",
            "dependency_list": [JobId::new()],
            "next_job": { "kind": "analytics" },
        });
        let (status, body) = call(&app, "POST", "/api/v1/sequencers", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["job_id"].is_string());

        let result = json!({ "job_id": JobId::new(), "kind": "describe", "status": "SUCCEEDED" });
        let (status, _) = call(&app, "POST", "/api/v1/results", Some(result)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
