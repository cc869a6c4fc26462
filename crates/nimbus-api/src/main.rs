//! nimbus API server and orchestrator.

use nimbus_api::services::{ComplianceClient, IndexClient, OnboardingClient};
use nimbus_api::{AppState, Settings, routes};
use nimbus_config::{OrchestratorConfig, load_orchestrator_config};
use nimbus_core::{Clock, SystemClock};
use nimbus_db::{JobStore, MemoryJobStore, PgJobStore, create_pool, run_migrations};
use nimbus_executor::{HttpSubstrate, result_channel};
use nimbus_scheduler::{Collaborators, Orchestrator, TracingMetrics};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("NIMBUS_LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = Settings::from_env()?;
    let config = match &settings.config_path {
        Some(path) => {
            info!(path = %path.display(), "Loading orchestrator config");
            load_orchestrator_config(path)?
        }
        None => OrchestratorConfig::default(),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn JobStore> = match &settings.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, jobs are kept in memory");
            Arc::new(MemoryJobStore::new(clock.clone()))
        }
    };

    let http = reqwest::Client::new();
    let onboarding = Arc::new(OnboardingClient::new(http.clone(), settings.onboarding_url.clone()));
    let index = Arc::new(IndexClient::new(http.clone(), settings.index_url.clone()));
    let (publisher, results) = result_channel(1024);
    let collaborators = Collaborators {
        directory: onboarding.clone(),
        vault: onboarding,
        catalog: Arc::new(ComplianceClient::new(http.clone(), settings.compliance_url.clone())),
        finding_index: index.clone(),
        cleanup: index,
        substrate: Arc::new(HttpSubstrate::with_client(http, settings.worker_url.clone())),
        results: Arc::new(results),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        config,
        collaborators,
        Arc::new(TracingMetrics),
        clock,
    ));
    let shutdown = CancellationToken::new();
    let running = orchestrator.start(shutdown.clone());

    let app = routes::router(AppState::new(orchestrator, publisher))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", settings.listen_addr);
    let listener = TcpListener::bind(settings.listen_addr).await?;
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    running.wait_for_shutdown().await;
    Ok(())
}
