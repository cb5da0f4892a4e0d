//! Lifecycle of received queue messages.
//!
//! ```text
//! received ──► processing ──┬─► deleted                        (handler Ok)
//!                           ├─► untouched, redelivered later   (Err, count < max)
//!                           └─► poison queue, then deleted     (Err, count ≥ max)
//! ```
//!
//! The handler never deletes a message it failed to archive: if the poison
//! write fails the message stays on the main queue and will be delivered
//! again. A message that was archived but could not be deleted is not
//! archived a second time when it comes back; only the delete is repeated.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::message::{Envelope, InFlightMessage, PoisonEnvelope, SendReceipt, timestamp_after};
use crate::retry::{RetryPolicy, with_retry};
use crate::traits::QueueClient;

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How long a received message stays hidden. Must cover the slowest
    /// expected processing time, including model calls and retries.
    pub visibility_timeout: Duration,
    /// Deliveries after which a failing message is quarantined.
    pub max_dequeue_count: u32,
    /// Upper bound on messages processed at once by `process_batch`.
    pub concurrency: usize,
    /// When set, a deferred message becomes visible again after
    /// `retry_backoff × dequeue_count` instead of the full visibility timeout.
    pub retry_backoff: Option<Duration>,
    /// Schedule for deleting a message that is already in the poison queue.
    pub delete_retry: RetryPolicy<AppError>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_dequeue_count: 5,
            concurrency: 4,
            retry_backoff: None,
            delete_retry: RetryPolicy::default()
                .with_backoff(Duration::from_millis(200), Duration::from_secs(2)),
        }
    }
}

impl HandlerConfig {
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_dequeue_count(mut self, max: u32) -> Self {
        self.max_dequeue_count = max;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn with_delete_retry(mut self, policy: RetryPolicy<AppError>) -> Self {
        self.delete_retry = policy;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.visibility_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "Visibility timeout must be greater than zero".into(),
            ));
        }
        if self.max_dequeue_count == 0 {
            return Err(AppError::ConfigError(
                "Max dequeue count must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(AppError::ConfigError(
                "Concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Why processing a message did not end in a clean delete.
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    /// Processing failed; the message will be delivered again.
    #[error("Message {message_id} failed on delivery {dequeue_count}, deferred: {source}")]
    Deferred {
        message_id: String,
        dequeue_count: u32,
        source: AppError,
    },

    /// Processing failed on the last allowed delivery; the message now lives
    /// in the poison queue.
    #[error("Message {message_id} quarantined after {dequeue_count} deliveries: {source}")]
    Quarantined {
        message_id: String,
        dequeue_count: u32,
        source: AppError,
    },

    /// Processing failed and the message could not be quarantined. It stays
    /// on the main queue.
    #[error("Message {message_id} failed and could not be quarantined ({cause}): {source}")]
    Unresolved {
        message_id: String,
        source: AppError,
        cause: AppError,
    },

    /// The message is in the poison queue but the original could not be
    /// deleted. Its next delivery only retries the delete.
    #[error(
        "Message {message_id} quarantined after {dequeue_count} deliveries but not deleted ({cause}): {source}"
    )]
    QuarantinedNotDeleted {
        message_id: String,
        dequeue_count: u32,
        source: AppError,
        cause: AppError,
    },

    /// Processing succeeded but the message could not be deleted, so it
    /// will be delivered again.
    #[error("Message {message_id} processed but not deleted: {source}")]
    DeleteFailed {
        message_id: String,
        source: AppError,
    },
}

impl ProcessError {
    pub fn message_id(&self) -> &str {
        match self {
            ProcessError::Deferred { message_id, .. }
            | ProcessError::Quarantined { message_id, .. }
            | ProcessError::Unresolved { message_id, .. }
            | ProcessError::QuarantinedNotDeleted { message_id, .. }
            | ProcessError::DeleteFailed { message_id, .. } => message_id,
        }
    }

    /// The error returned by the processing function, if processing failed.
    pub fn handler_error(&self) -> Option<&AppError> {
        match self {
            ProcessError::Deferred { source, .. }
            | ProcessError::Quarantined { source, .. }
            | ProcessError::Unresolved { source, .. }
            | ProcessError::QuarantinedNotDeleted { source, .. } => Some(source),
            ProcessError::DeleteFailed { .. } => None,
        }
    }

    /// True once the message is in the poison queue, whether or not the
    /// original is gone.
    pub fn is_quarantined(&self) -> bool {
        matches!(
            self,
            ProcessError::Quarantined { .. } | ProcessError::QuarantinedNotDeleted { .. }
        )
    }
}

/// Aggregate outcome of [`QueueMessageHandler::process_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub processed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub quarantined: usize,
}

impl BatchSummary {
    pub fn merge(&mut self, other: &BatchSummary) {
        self.received += other.received;
        self.processed += other.processed;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.quarantined += other.quarantined;
    }

    fn record<T>(&mut self, outcome: &Result<T, ProcessError>) {
        match outcome {
            Ok(_) => self.processed += 1,
            Err(ProcessError::DeleteFailed { .. }) => {
                // The work itself succeeded.
                self.processed += 1;
            }
            Err(ProcessError::Deferred { .. }) => {
                self.failed += 1;
                self.deferred += 1;
            }
            Err(ProcessError::Quarantined { .. }) => {
                self.failed += 1;
                self.quarantined += 1;
            }
            // Counted as quarantined when the delete finally goes through.
            Err(ProcessError::Unresolved { .. } | ProcessError::QuarantinedNotDeleted { .. }) => {
                self.failed += 1
            }
        }
    }
}

/// Receives messages and disposes of them according to the processing
/// outcome.
///
/// Built with [`QueueMessageHandler::connect`], which verifies both the main
/// and the poison queue before any message can be received.
#[derive(Clone)]
pub struct QueueMessageHandler<Q: QueueClient> {
    main: Q,
    poison: Q,
    config: HandlerConfig,
    /// Ids already written to the poison queue whose original is still on
    /// the main queue.
    archived: Arc<Mutex<HashSet<String>>>,
}

impl<Q: QueueClient> QueueMessageHandler<Q> {
    pub async fn connect(main: Q, poison: Q, config: HandlerConfig) -> Result<Self, AppError> {
        config.validate()?;
        if main.name() == poison.name() {
            return Err(AppError::ConfigError(format!(
                "Poison queue must differ from the main queue '{}'",
                main.name()
            )));
        }

        main.ensure_exists().await?;
        poison.ensure_exists().await.map_err(|e| {
            AppError::ConfigError(format!(
                "Poison queue '{}' could not be provisioned: {e}",
                poison.name()
            ))
        })?;

        info!(
            queue = %main.name(),
            poison_queue = %poison.name(),
            visibility_timeout_secs = config.visibility_timeout.as_secs(),
            max_dequeue_count = config.max_dequeue_count,
            "Queue handler ready"
        );

        Ok(Self {
            main,
            poison,
            config,
            archived: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn main_queue(&self) -> &Q {
        &self.main
    }

    pub fn poison_queue(&self) -> &Q {
        &self.poison
    }

    /// Receive up to `max_messages`, hidden for the configured visibility
    /// timeout.
    pub async fn receive(&self, max_messages: usize) -> Result<Vec<InFlightMessage>, AppError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let messages = self
            .main
            .receive_messages(max_messages, self.config.visibility_timeout)
            .await?;
        debug!(queue = %self.main.name(), count = messages.len(), "Received messages");
        Ok(messages)
    }

    /// Enqueue a work item on the main queue.
    pub async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, AppError> {
        let body = envelope.to_json()?;
        self.main.send_message(&body).await
    }

    /// Keep a slow message hidden for another `timeout`. Updates the
    /// message's ack token in place.
    pub async fn extend_visibility(
        &self,
        message: &mut InFlightMessage,
        timeout: Duration,
    ) -> Result<(), AppError> {
        let token = self
            .main
            .update_visibility(&message.id, &message.ack_token, timeout)
            .await?;
        message.ack_token = token;
        message.next_visible_at = timestamp_after(Utc::now(), timeout);
        debug!(message_id = %message.id, timeout_secs = timeout.as_secs(), "Extended visibility");
        Ok(())
    }

    /// Run `f` on the message and dispose of it according to the result.
    ///
    /// `f` receives its own copy of the message; the handler keeps the ack
    /// token it needs for the delete.
    pub async fn process_scoped<T, F, Fut>(
        &self,
        message: InFlightMessage,
        f: F,
    ) -> Result<T, ProcessError>
    where
        F: FnOnce(InFlightMessage) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        match f(message.clone()).await {
            Ok(value) => {
                self.lock_archived().remove(&message.id);
                self.delete(&message)
                    .await
                    .map_err(|source| {
                        error!(
                            message_id = %message.id,
                            error = %source,
                            "Processed message could not be deleted; it will be redelivered"
                        );
                        ProcessError::DeleteFailed {
                            message_id: message.id.clone(),
                            source,
                        }
                    })?;
                Ok(value)
            }
            Err(err) => Err(self.dispose_failure(&message, err).await),
        }
    }

    /// Like [`process_scoped`](Self::process_scoped), but parses the body into
    /// an [`Envelope`] first. Bodies that do not parse count as failures.
    pub async fn process_envelope<T, F, Fut>(
        &self,
        message: InFlightMessage,
        f: F,
    ) -> Result<T, ProcessError>
    where
        F: FnOnce(Envelope) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.process_scoped(message, move |msg| async move {
            let envelope = msg.envelope()?;
            f(envelope).await
        })
        .await
    }

    /// Process a batch, sequentially or with up to `config.concurrency`
    /// messages in flight. One failure never stops the others.
    pub async fn process_batch<T, F, Fut>(
        &self,
        messages: Vec<InFlightMessage>,
        f: F,
        concurrent: bool,
    ) -> BatchSummary
    where
        F: Fn(InFlightMessage) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut summary = BatchSummary {
            received: messages.len(),
            ..Default::default()
        };

        if concurrent {
            let outcomes: Vec<Result<T, ProcessError>> = stream::iter(messages)
                .map(|message| self.process_scoped(message, &f))
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;
            for outcome in &outcomes {
                summary.record(outcome);
            }
        } else {
            for message in messages {
                let outcome = self.process_scoped(message, &f).await;
                summary.record(&outcome);
            }
        }

        debug!(
            received = summary.received,
            processed = summary.processed,
            failed = summary.failed,
            "Batch complete"
        );
        summary
    }

    /// Delete on the main queue, treating an already-deleted message as done.
    async fn delete(&self, message: &InFlightMessage) -> Result<(), AppError> {
        match self
            .main
            .delete_message(&message.id, &message.ack_token)
            .await
        {
            Ok(()) => Ok(()),
            Err(AppError::MessageAlreadyDeleted(_)) => {
                debug!(message_id = %message.id, "Message already deleted by another consumer");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn dispose_failure(&self, message: &InFlightMessage, err: AppError) -> ProcessError {
        if message.dequeue_count < self.config.max_dequeue_count {
            warn!(
                message_id = %message.id,
                dequeue_count = message.dequeue_count,
                max_dequeue_count = self.config.max_dequeue_count,
                error = %err,
                "Processing failed, message will be redelivered"
            );
            if let Some(backoff) = self.config.retry_backoff {
                self.shorten_visibility(message, backoff).await;
            }
            return ProcessError::Deferred {
                message_id: message.id.clone(),
                dequeue_count: message.dequeue_count,
                source: err,
            };
        }

        match self.quarantine(message, &err).await {
            Ok(()) => {
                self.lock_archived().remove(&message.id);
                info!(
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    poison_queue = %self.poison.name(),
                    error = %err,
                    "Message moved to poison queue"
                );
                ProcessError::Quarantined {
                    message_id: message.id.clone(),
                    dequeue_count: message.dequeue_count,
                    source: err,
                }
            }
            Err(cause @ AppError::PoisonQueueWriteFailed { .. }) => {
                error!(
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    error = %err,
                    cause = %cause,
                    "Could not quarantine message; leaving it on the queue"
                );
                ProcessError::Unresolved {
                    message_id: message.id.clone(),
                    source: err,
                    cause,
                }
            }
            Err(cause) => {
                error!(
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    poison_queue = %self.poison.name(),
                    error = %err,
                    cause = %cause,
                    "Message archived but not deleted; next delivery retries the delete"
                );
                ProcessError::QuarantinedNotDeleted {
                    message_id: message.id.clone(),
                    dequeue_count: message.dequeue_count,
                    source: err,
                    cause,
                }
            }
        }
    }

    fn lock_archived(&self) -> MutexGuard<'_, HashSet<String>> {
        self.archived.lock().unwrap_or_else(|poisoned| {
            warn!("Recovered from poisoned archive set mutex");
            poisoned.into_inner()
        })
    }

    /// Write the poison envelope unless an earlier delivery already did, then
    /// delete the original under `config.delete_retry`. The original is only
    /// deleted once the envelope is stored.
    async fn quarantine(&self, message: &InFlightMessage, err: &AppError) -> Result<(), AppError> {
        if self.lock_archived().contains(&message.id) {
            debug!(message_id = %message.id, "Already in poison queue, retrying delete only");
        } else {
            self.archive(message, err).await?;
            self.lock_archived().insert(message.id.clone());
        }

        with_retry(&self.config.delete_retry, |_| self.delete(message))
            .await
            .map_err(|e| e.into_inner())
    }

    async fn archive(&self, message: &InFlightMessage, err: &AppError) -> Result<(), AppError> {
        let envelope = PoisonEnvelope::new(message, self.main.name(), &err.to_string());
        let body = serde_json::to_string(&envelope).map_err(|e| {
            AppError::PoisonQueueWriteFailed {
                message_id: message.id.clone(),
                reason: e.to_string(),
            }
        })?;

        self.poison
            .send_message(&body)
            .await
            .map_err(|e| AppError::PoisonQueueWriteFailed {
                message_id: message.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn shorten_visibility(&self, message: &InFlightMessage, backoff: Duration) {
        let delay = backoff
            .saturating_mul(message.dequeue_count.max(1))
            .min(self.config.visibility_timeout);
        if let Err(e) = self
            .main
            .update_visibility(&message.id, &message.ack_token, delay)
            .await
        {
            warn!(
                message_id = %message.id,
                error = %e,
                "Could not shorten visibility; message reappears after the full timeout"
            );
        }
    }
}
