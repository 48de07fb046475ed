use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Sizing of the connection pool. The API serves many short requests; a
/// worker needs roughly one connection per executor plus the reaper.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Connect to the job and submission database
pub async fn init_pool(database_url: &str, pool: &PoolConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(pool.max_connections)
        .min_connections(pool.min_connections)
        .acquire_timeout(pool.acquire_timeout)
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Apply the scoring schema from `migrations/`
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

pub mod queries;
pub mod submission_queries;

pub use queries::PgJobStore;
pub use submission_queries::PgSubmissionStore;
