//! # kiln-db
//!
//! PostgreSQL storage layer for the kiln job worker.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable job queue ([`PgJobStore`]) with atomic `SKIP LOCKED` claims
//! - Read/insert access to the host application's records ([`PgHostRecordStore`])
//! - In-memory stores with identical semantics ([`memory`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use kiln_db::{Database, JobKind, JobStore, NewJob, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect_with_config(
//!         "postgres://localhost/archive",
//!         PoolConfig::from_env(),
//!     )
//!     .await?;
//!
//!     let job_id = db.jobs.enqueue(
//!         NewJob::new(JobKind::PdfMerge, "Minute book 1921")
//!             .with_sources(["/scans/p1.tif", "/scans/p2.tif"]),
//!     ).await?;
//!
//!     println!("Queued job: {}", job_id);
//!     Ok(())
//! }
//! ```
pub mod host;
pub mod jobs;
pub mod memory;
pub mod pool;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use kiln_core::*;

pub use host::PgHostRecordStore;
pub use jobs::PgJobStore;
pub use memory::{MemoryHostStore, MemoryJobStore};
pub use pool::{create_pool_with_config, log_pool_metrics, PoolConfig};

/// Combined database context with all stores.
///
/// Clones share the pool and the job notify handle.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job queue.
    pub jobs: PgJobStore,
    /// Host application records and digital objects.
    pub host: PgHostRecordStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobStore::new(pool.clone()),
            host: PgHostRecordStore::new(pool.clone()),
            pool,
        }
    }

    /// Connect with the given pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
