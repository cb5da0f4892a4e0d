//! In-process implementations of the queue and metrics-store traits.
//!
//! Useful for local runs and tests. `MemoryQueue` follows the same delivery
//! rules as a durable queue: visibility timeouts, dequeue counting, ack tokens
//! that rotate on every delivery, and message expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::message::{InFlightMessage, SendReceipt, timestamp_after};
use crate::traits::{MetricsStore, QueueClient};

const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    content: String,
    ack_token: Option<String>,
    dequeue_count: u32,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    next_visible_at: DateTime<Utc>,
    visible_from: Instant,
    expires_from: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    deleted: u64,
}

/// Queue held in memory, shared between clones.
#[derive(Clone)]
pub struct MemoryQueue {
    name: String,
    message_ttl: Duration,
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_ttl: DEFAULT_MESSAGE_TTL,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Messages still in the queue, visible or not.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock_state()
            .messages
            .iter()
            .filter(|m| m.expires_from > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of every message still in the queue, oldest first.
    pub fn contents(&self) -> Vec<String> {
        let now = Instant::now();
        self.lock_state()
            .messages
            .iter()
            .filter(|m| m.expires_from > now)
            .map(|m| m.content.clone())
            .collect()
    }

    /// Current dequeue count of a message, if it is still queued.
    pub fn dequeue_count(&self, message_id: &str) -> Option<u32> {
        self.lock_state()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.dequeue_count)
    }

    pub fn deleted_count(&self) -> u64 {
        self.lock_state().deleted
    }
}

impl QueueClient for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn send_message(&self, content: &str) -> Result<SendReceipt, AppError> {
        let now = Instant::now();
        let inserted_at = Utc::now();
        let expires_at = timestamp_after(inserted_at, self.message_ttl);
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            ack_token: None,
            dequeue_count: 0,
            inserted_at,
            expires_at,
            next_visible_at: inserted_at,
            visible_from: now,
            expires_from: now + self.message_ttl,
        };
        let receipt = SendReceipt {
            message_id: message.id.clone(),
            inserted_at,
            expires_at,
        };
        self.lock_state().messages.push(message);
        Ok(receipt)
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<InFlightMessage>, AppError> {
        let now = Instant::now();
        let next_visible_at = timestamp_after(Utc::now(), visibility_timeout);
        let mut state = self.lock_state();
        state.messages.retain(|m| m.expires_from > now);

        let mut received = Vec::new();
        for message in state.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if message.visible_from > now {
                continue;
            }
            message.dequeue_count += 1;
            message.ack_token = Some(Uuid::new_v4().to_string());
            message.visible_from = now + visibility_timeout;
            message.next_visible_at = next_visible_at;

            received.push(InFlightMessage {
                id: message.id.clone(),
                ack_token: message.ack_token.clone().unwrap_or_default(),
                raw_content: message.content.clone(),
                dequeue_count: message.dequeue_count,
                inserted_at: message.inserted_at,
                expires_at: message.expires_at,
                next_visible_at: message.next_visible_at,
            });
        }
        Ok(received)
    }

    async fn delete_message(&self, message_id: &str, ack_token: &str) -> Result<(), AppError> {
        let mut state = self.lock_state();
        let position = state
            .messages
            .iter()
            .position(|m| m.id == message_id && m.ack_token.as_deref() == Some(ack_token));
        match position {
            Some(index) => {
                state.messages.remove(index);
                state.deleted += 1;
                Ok(())
            }
            None => Err(AppError::MessageAlreadyDeleted(message_id.to_string())),
        }
    }

    async fn update_visibility(
        &self,
        message_id: &str,
        ack_token: &str,
        visibility_timeout: Duration,
    ) -> Result<String, AppError> {
        let now = Instant::now();
        let mut state = self.lock_state();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.ack_token.as_deref() == Some(ack_token))
            .ok_or_else(|| AppError::MessageAlreadyDeleted(message_id.to_string()))?;

        let token = Uuid::new_v4().to_string();
        message.ack_token = Some(token.clone());
        message.visible_from = now + visibility_timeout;
        message.next_visible_at = timestamp_after(Utc::now(), visibility_timeout);
        Ok(token)
    }
}

/// Metrics store held in memory, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryMetricsStore {
    entries: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, serde_json::Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lock_entries().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_entries().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl MetricsStore for MemoryMetricsStore {
    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), AppError> {
        self.lock_entries().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, AppError> {
        Ok(self.get(key))
    }
}
