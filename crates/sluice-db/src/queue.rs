use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use sluice_core::error::AppError;
use sluice_core::message::{InFlightMessage, SendReceipt};
use sluice_core::traits::QueueClient;

const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// PostgreSQL-backed visibility-timeout queue.
///
/// Receiving claims rows with `SELECT FOR UPDATE SKIP LOCKED`, bumps their
/// dequeue count, pushes `next_visible_at` forward and issues a fresh ack
/// token in a single statement, so competing consumers never share a
/// delivery.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    name: String,
    message_ttl: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            message_ttl: DEFAULT_MESSAGE_TTL,
        }
    }

    /// How long a sent message lives before it is dropped unprocessed.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    /// Messages currently stored, visible or not.
    pub async fn len(&self) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM queue_messages WHERE queue_name = $1"#)
                .bind(&self.name)
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable)?;

        Ok(count)
    }

    /// Remove messages past their expiry. Returns how many were dropped.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"DELETE FROM queue_messages WHERE queue_name = $1 AND expires_at <= NOW()"#,
        )
        .bind(&self.name)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() > 0 {
            tracing::info!(
                queue = %self.name,
                dropped = result.rows_affected(),
                "Dropped expired messages"
            );
        }
        Ok(result.rows_affected())
    }
}

fn unavailable(e: sqlx::Error) -> AppError {
    AppError::QueueUnavailable(e.to_string())
}

/// Ids and ack tokens are UUIDs here; anything else cannot match a row.
fn parse_ids(message_id: &str, ack_token: &str) -> Result<(Uuid, Uuid), AppError> {
    let gone = || AppError::MessageAlreadyDeleted(message_id.to_string());
    let id = Uuid::parse_str(message_id).map_err(|_| gone())?;
    let token = Uuid::parse_str(ack_token).map_err(|_| gone())?;
    Ok((id, token))
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    content: String,
    ack_token: Option<Uuid>,
    dequeue_count: i32,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    next_visible_at: DateTime<Utc>,
}

impl From<MessageRow> for InFlightMessage {
    fn from(row: MessageRow) -> Self {
        InFlightMessage {
            id: row.id.to_string(),
            ack_token: row.ack_token.map(|t| t.to_string()).unwrap_or_default(),
            raw_content: row.content,
            dequeue_count: u32::try_from(row.dequeue_count).unwrap_or_default(),
            inserted_at: row.inserted_at,
            expires_at: row.expires_at,
            next_visible_at: row.next_visible_at,
        }
    }
}

impl QueueClient for PgQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self) -> Result<(), AppError> {
        sqlx::query(r#"INSERT INTO queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING"#)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(())
    }

    async fn send_message(&self, content: &str) -> Result<SendReceipt, AppError> {
        let (id, inserted_at, expires_at): (Uuid, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO queue_messages (queue_name, content, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            RETURNING id, inserted_at, expires_at
            "#,
        )
        .bind(&self.name)
        .bind(content)
        .bind(self.message_ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(SendReceipt {
            message_id: id.to_string(),
            inserted_at,
            expires_at,
        })
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<InFlightMessage>, AppError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        self.purge_expired().await?;

        let mut rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE queue_messages
            SET dequeue_count = dequeue_count + 1,
                ack_token = gen_random_uuid(),
                next_visible_at = NOW() + make_interval(secs => $3)
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue_name = $1
                  AND next_visible_at <= NOW()
                  AND expires_at > NOW()
                ORDER BY inserted_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING id, content, ack_token, dequeue_count, inserted_at, expires_at, next_visible_at
            "#,
        )
        .bind(&self.name)
        .bind(i64::try_from(max_messages).unwrap_or(i64::MAX))
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        // RETURNING order is unspecified.
        rows.sort_by_key(|row| row.inserted_at);
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_message(&self, message_id: &str, ack_token: &str) -> Result<(), AppError> {
        let (id, token) = parse_ids(message_id, ack_token)?;
        let result = sqlx::query(
            r#"DELETE FROM queue_messages WHERE id = $1 AND queue_name = $2 AND ack_token = $3"#,
        )
        .bind(id)
        .bind(&self.name)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(AppError::MessageAlreadyDeleted(message_id.to_string()));
        }
        Ok(())
    }

    async fn update_visibility(
        &self,
        message_id: &str,
        ack_token: &str,
        visibility_timeout: Duration,
    ) -> Result<String, AppError> {
        let (id, token) = parse_ids(message_id, ack_token)?;
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET next_visible_at = NOW() + make_interval(secs => $4),
                ack_token = gen_random_uuid()
            WHERE id = $1 AND queue_name = $2 AND ack_token = $3
            RETURNING ack_token
            "#,
        )
        .bind(id)
        .bind(&self.name)
        .bind(token)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|(token,)| token.to_string())
            .ok_or_else(|| AppError::MessageAlreadyDeleted(message_id.to_string()))
    }
}
