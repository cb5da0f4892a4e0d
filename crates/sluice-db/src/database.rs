use sluice_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::metrics_store::PgMetricsStore;
use crate::queue::PgQueue;

/// Postgres backing for the worker: the visibility-timeout queues and the
/// throttle snapshot store all share one pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the shared pool. Fails when the server cannot be reached within
    /// the configured acquire timeout.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or upgrade the queue and snapshot tables.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// A handle on the named queue. Call `ensure_exists` before use.
    pub fn queue(&self, name: impl Into<String>) -> PgQueue {
        PgQueue::new(self.pool.clone(), name)
    }

    /// Where the throttle controller keeps per-source health.
    pub fn metrics_store(&self) -> PgMetricsStore {
        PgMetricsStore::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

