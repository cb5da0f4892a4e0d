use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::message::{Envelope, InFlightMessage, SendReceipt};
use crate::models::{CallRequest, CallResponse, RegionEndpoint, UpstreamReply};

/// Durable queue with visibility timeouts and per-message dequeue counts.
///
/// Implementations must hide a received message from other consumers for the
/// requested visibility timeout, increment its dequeue count on every
/// delivery and rotate the ack token so stale receipts cannot delete it.
pub trait QueueClient: Send + Sync + Clone {
    /// Queue name, recorded in poison envelopes.
    fn name(&self) -> &str;

    /// Create the queue if needed and verify it is reachable.
    fn ensure_exists(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn send_message(
        &self,
        content: &str,
    ) -> impl Future<Output = Result<SendReceipt, AppError>> + Send;

    fn receive_messages(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> impl Future<Output = Result<Vec<InFlightMessage>, AppError>> + Send;

    /// Delete a message. Returns [`AppError::MessageAlreadyDeleted`] when the
    /// message is gone or the ack token is no longer current.
    fn delete_message(
        &self,
        message_id: &str,
        ack_token: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Change when the message becomes visible again. Returns the new ack token.
    fn update_visibility(
        &self,
        message_id: &str,
        ack_token: &str,
        visibility_timeout: Duration,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Key/value store for JSON snapshots (source health records).
pub trait MetricsStore: Send + Sync + Clone {
    fn save(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn load(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, AppError>> + Send;
}

/// Sends one attempt of a model call to one region.
///
/// Non-success statuses must be mapped with [`AppError::from_status`] so the
/// gateway can tell transient, rate-limited and fatal failures apart. A 2xx
/// body without the expected fields is [`AppError::MalformedResponse`].
pub trait UpstreamTransport: Send + Sync + Clone {
    fn send(
        &self,
        region: &RegionEndpoint,
        request: &CallRequest,
    ) -> impl Future<Output = Result<UpstreamReply, AppError>> + Send;
}

/// Receives the result of a processed work item.
pub trait OutputSink: Send + Sync + Clone {
    fn deliver(
        &self,
        envelope: &Envelope,
        response: &CallResponse,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// An [`OutputSink`] that discards results.
#[derive(Debug, Clone)]
pub struct NullSink;

impl OutputSink for NullSink {
    async fn deliver(&self, _envelope: &Envelope, _response: &CallResponse) -> Result<(), AppError> {
        Ok(())
    }
}
