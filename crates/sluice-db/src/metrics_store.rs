use sluice_core::error::AppError;
use sluice_core::traits::MetricsStore;
use sqlx::PgPool;

/// JSON snapshots keyed by string, one row per key.
#[derive(Clone)]
pub struct PgMetricsStore {
    pool: PgPool,
}

impl PgMetricsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MetricsStore for PgMetricsStore {
    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO health_snapshots (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::StorageError(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, AppError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as(r#"SELECT value FROM health_snapshots WHERE key = $1"#)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::StorageError(e.to_string()))?;

        Ok(row.map(|(value,)| value))
    }
}
