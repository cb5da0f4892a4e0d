use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ModelTier;

/// `from + duration`, saturating at the largest representable timestamp.
pub(crate) fn timestamp_after(from: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A message received from the queue and not yet deleted.
///
/// Owned by whoever is processing it; consumed by exactly one of delete or
/// promotion to the poison queue. Dropping it without either leaves the
/// message to reappear after its visibility timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightMessage {
    pub id: String,
    /// Receipt proving this consumer holds the current delivery.
    pub ack_token: String,
    pub raw_content: String,
    /// Deliveries so far, including this one.
    pub dequeue_count: u32,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub next_visible_at: DateTime<Utc>,
}

impl InFlightMessage {
    pub fn envelope(&self) -> Result<Envelope, AppError> {
        Envelope::parse(&self.raw_content)
    }
}

/// Returned by the queue transport after a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Archived form of a message that exceeded its delivery budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoisonEnvelope {
    pub message_id: String,
    pub source_queue: String,
    pub original_message: String,
    pub dequeue_count: u32,
    pub failure_reason: String,
    pub inserted_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
}

impl PoisonEnvelope {
    pub fn new(message: &InFlightMessage, source_queue: &str, failure_reason: &str) -> Self {
        Self {
            message_id: message.id.clone(),
            source_queue: source_queue.to_string(),
            original_message: message.raw_content.clone(),
            dequeue_count: message.dequeue_count,
            failure_reason: failure_reason.to_string(),
            inserted_at: message.inserted_at,
            moved_at: Utc::now(),
        }
    }
}

/// Payload of a `summarize` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizePayload {
    pub source: String,
    pub item_id: String,
    pub content: String,
    #[serde(default)]
    pub model_tier: ModelTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Payload of an `extract` operation (structured JSON output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPayload {
    pub source: String,
    pub item_id: String,
    pub content: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub model_tier: ModelTier,
}

/// Work item carried in a queue message.
///
/// On the wire this is `{"operation": "...", "payload": {...}}`. Operations
/// this pipeline does not know parse into [`Envelope::Unknown`] so they can be
/// failed (and eventually poisoned) deterministically.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Summarize(SummarizePayload),
    Extract(ExtractPayload),
    Unknown { operation: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    operation: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    operation: &'a str,
    payload: serde_json::Value,
}

impl Envelope {
    pub const SUMMARIZE: &'static str = "summarize";
    pub const EXTRACT: &'static str = "extract";

    /// Parse a raw message body.
    ///
    /// Fails with [`AppError::InvalidMessage`] when the body is not an
    /// envelope or a known operation carries a payload of the wrong shape.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let raw: RawEnvelope = serde_json::from_str(raw)
            .map_err(|e| AppError::InvalidMessage(format!("Not a message envelope: {e}")))?;

        match raw.operation.as_str() {
            Self::SUMMARIZE => serde_json::from_value(raw.payload)
                .map(Envelope::Summarize)
                .map_err(|e| AppError::InvalidMessage(format!("Bad summarize payload: {e}"))),
            Self::EXTRACT => serde_json::from_value(raw.payload)
                .map(Envelope::Extract)
                .map_err(|e| AppError::InvalidMessage(format!("Bad extract payload: {e}"))),
            _ => Ok(Envelope::Unknown {
                operation: raw.operation,
            }),
        }
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        let payload = match self {
            Envelope::Summarize(p) => serde_json::to_value(p)?,
            Envelope::Extract(p) => serde_json::to_value(p)?,
            Envelope::Unknown { .. } => serde_json::Value::Object(Default::default()),
        };
        Ok(serde_json::to_string(&WireEnvelope {
            operation: self.operation(),
            payload,
        })?)
    }

    pub fn operation(&self) -> &str {
        match self {
            Envelope::Summarize(_) => Self::SUMMARIZE,
            Envelope::Extract(_) => Self::EXTRACT,
            Envelope::Unknown { operation } => operation,
        }
    }

    /// Upstream source this item belongs to, used for per-source pacing.
    pub fn source(&self) -> Option<&str> {
        match self {
            Envelope::Summarize(p) => Some(&p.source),
            Envelope::Extract(p) => Some(&p.source),
            Envelope::Unknown { .. } => None,
        }
    }
}
