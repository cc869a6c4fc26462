//! Job store for the nimbus orchestrator.
//!
//! Provides the [`JobStore`] trait with a PostgreSQL implementation and an
//! in-memory implementation for single-process runs and tests.

pub mod error;
pub mod filter;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{DbError, DbResult};
pub use filter::JobFilter;
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::JobStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
