//! Test utilities: scripted and fault-injecting implementations of the core
//! traits.
//!
//! All mocks share state through `Arc<Mutex<_>>` so tests can assert on
//! recorded calls after handing a clone to the code under test.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::consumer::{ConsumerEvent, ConsumerReporter};
use crate::error::AppError;
use crate::memory::MemoryQueue;
use crate::message::{Envelope, InFlightMessage, SendReceipt};
use crate::models::{CallRequest, CallResponse, RegionEndpoint, UpstreamReply};
use crate::traits::{MetricsStore, OutputSink, QueueClient, UpstreamTransport};

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// What a scripted region does on one attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(&'static str),
    Transient,
    RateLimited(Option<Duration>),
    Fatal(u16),
    Malformed,
}

impl Step {
    fn run(&self, region: &str, request: &CallRequest) -> Result<UpstreamReply, AppError> {
        match self {
            Step::Reply(content) => Ok(UpstreamReply {
                content: content.to_string(),
                model: request.model.clone().unwrap_or_else(|| "stub-model".into()),
                tokens_in: 100,
                tokens_out: 50,
            }),
            Step::Transient => Err(AppError::from_status(503, format!("{region} unavailable"))),
            Step::RateLimited(retry_after) => Err(AppError::RateLimitExceeded {
                retry_after: *retry_after,
            }),
            Step::Fatal(status) => Err(AppError::from_status(*status, "rejected")),
            Step::Malformed => Err(AppError::MalformedResponse("missing choices".into())),
        }
    }
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Step>>,
    fallback: HashMap<String, Step>,
    calls: Vec<(String, CallRequest)>,
}

/// Upstream transport whose behaviour is scripted per region.
///
/// Each attempt pops the next queued step for the region; when none are
/// left the region's fallback step is used (a plain reply by default).
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every attempt against `region` behaves like `step`.
    pub fn always(self, region: &str, step: Step) -> Self {
        self.script
            .lock()
            .unwrap()
            .fallback
            .insert(region.to_string(), step);
        self
    }

    /// Queue steps for the next attempts against `region`.
    pub fn then(self, region: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script
            .lock()
            .unwrap()
            .queued
            .entry(region.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Region names in the order they were attempted.
    pub fn attempts(&self) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(region, _)| region.clone())
            .collect()
    }

    pub fn attempts_on(&self, region: &str) -> usize {
        self.attempts().iter().filter(|r| *r == region).count()
    }

    pub fn requests(&self) -> Vec<CallRequest> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }
}

impl UpstreamTransport for ScriptedTransport {
    async fn send(
        &self,
        region: &RegionEndpoint,
        request: &CallRequest,
    ) -> Result<UpstreamReply, AppError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.calls.push((region.name.clone(), request.clone()));
            let queued = script
                .queued
                .get_mut(&region.name)
                .and_then(|steps| steps.pop_front());
            queued
                .or_else(|| script.fallback.get(&region.name).cloned())
                .unwrap_or(Step::Reply("ok"))
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        step.run(&region.name, request)
    }
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Metrics store whose writes (and optionally reads) always fail.
#[derive(Clone, Default)]
pub struct FailingStore {
    fail_loads: bool,
    save_attempts: Arc<Mutex<u32>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_loads(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    pub fn save_attempts(&self) -> u32 {
        *self.save_attempts.lock().unwrap()
    }
}

impl MetricsStore for FailingStore {
    async fn save(&self, _key: &str, _value: &serde_json::Value) -> Result<(), AppError> {
        *self.save_attempts.lock().unwrap() += 1;
        Err(AppError::StorageError("disk full".into()))
    }

    async fn load(&self, _key: &str) -> Result<Option<serde_json::Value>, AppError> {
        if self.fail_loads {
            Err(AppError::StorageError("store offline".into()))
        } else {
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// FlakyQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Faults {
    fail_ensure: bool,
    fail_send: bool,
    fail_receive: bool,
    fail_delete: bool,
    fail_update: bool,
    visibility_requests: Vec<Duration>,
    delete_calls: u32,
}

/// A [`MemoryQueue`] with switchable failures and call recording.
#[derive(Clone)]
pub struct FlakyQueue {
    inner: MemoryQueue,
    faults: Arc<Mutex<Faults>>,
}

impl FlakyQueue {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryQueue::new(name),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn inner(&self) -> &MemoryQueue {
        &self.inner
    }

    pub fn fail_ensure(&self) {
        self.faults.lock().unwrap().fail_ensure = true;
    }

    pub fn fail_send(&self, fail: bool) {
        self.faults.lock().unwrap().fail_send = fail;
    }

    pub fn fail_receive(&self, fail: bool) {
        self.faults.lock().unwrap().fail_receive = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.faults.lock().unwrap().fail_delete = fail;
    }

    pub fn fail_update(&self, fail: bool) {
        self.faults.lock().unwrap().fail_update = fail;
    }

    /// Visibility timeouts passed to `receive_messages` and
    /// `update_visibility`, in call order.
    pub fn visibility_requests(&self) -> Vec<Duration> {
        self.faults.lock().unwrap().visibility_requests.clone()
    }

    pub fn delete_calls(&self) -> u32 {
        self.faults.lock().unwrap().delete_calls
    }

    fn unavailable(&self, op: &str) -> AppError {
        AppError::QueueUnavailable(format!("{} {op} failed", self.inner.name()))
    }
}

impl QueueClient for FlakyQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ensure_exists(&self) -> Result<(), AppError> {
        if self.faults.lock().unwrap().fail_ensure {
            return Err(self.unavailable("create"));
        }
        self.inner.ensure_exists().await
    }

    async fn send_message(&self, content: &str) -> Result<SendReceipt, AppError> {
        if self.faults.lock().unwrap().fail_send {
            return Err(self.unavailable("send"));
        }
        self.inner.send_message(content).await
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<InFlightMessage>, AppError> {
        {
            let mut faults = self.faults.lock().unwrap();
            faults.visibility_requests.push(visibility_timeout);
            if faults.fail_receive {
                drop(faults);
                return Err(self.unavailable("receive"));
            }
        }
        self.inner
            .receive_messages(max_messages, visibility_timeout)
            .await
    }

    async fn delete_message(&self, message_id: &str, ack_token: &str) -> Result<(), AppError> {
        {
            let mut faults = self.faults.lock().unwrap();
            faults.delete_calls += 1;
            if faults.fail_delete {
                drop(faults);
                return Err(self.unavailable("delete"));
            }
        }
        self.inner.delete_message(message_id, ack_token).await
    }

    async fn update_visibility(
        &self,
        message_id: &str,
        ack_token: &str,
        visibility_timeout: Duration,
    ) -> Result<String, AppError> {
        {
            let mut faults = self.faults.lock().unwrap();
            faults.visibility_requests.push(visibility_timeout);
            if faults.fail_update {
                drop(faults);
                return Err(self.unavailable("update"));
            }
        }
        self.inner
            .update_visibility(message_id, ack_token, visibility_timeout)
            .await
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Output sink that records every delivery.
#[derive(Clone, Default)]
pub struct RecordingSink {
    delivered: Arc<Mutex<Vec<(Envelope, CallResponse)>>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<(Envelope, CallResponse)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl OutputSink for RecordingSink {
    async fn deliver(&self, envelope: &Envelope, response: &CallResponse) -> Result<(), AppError> {
        self.delivered
            .lock()
            .unwrap()
            .push((envelope.clone(), response.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Consumer reporter that records the kind of every event.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ConsumerReporter for RecordingReporter {
    fn report(&self, event: ConsumerEvent<'_>) {
        self.events.lock().unwrap().push(event.kind().to_string());
    }
}
