use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::gateway::ExternalCallGateway;
use crate::handler::{BatchSummary, QueueMessageHandler};
use crate::message::{Envelope, InFlightMessage};
use crate::models::{CallRequest, CallResponse};
use crate::throttle::AdaptiveThrottleController;
use crate::traits::{MetricsStore, NullSink, OutputSink, QueueClient, UpstreamTransport};

const SUMMARIZE_PROMPT: &str = "Summarize the following content in a few sentences. \
Keep names, figures and dates accurate.";

const EXTRACT_PROMPT: &str = "Extract structured data from the following content. \
Respond with a single JSON object that matches the provided schema and nothing else.";

/// Events emitted by the consumer loop for monitoring/logging.
#[derive(Debug, Clone)]
pub enum ConsumerEvent<'a> {
    Started {
        queue: &'a str,
    },
    Polling,
    BatchReceived {
        count: usize,
    },
    BatchCompleted {
        summary: &'a BatchSummary,
    },
    ReceiveFailed {
        error: &'a str,
    },
    ShuttingDown {
        queue: &'a str,
        totals: &'a BatchSummary,
    },
    Stopped {
        queue: &'a str,
    },
}

impl ConsumerEvent<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerEvent::Started { .. } => "started",
            ConsumerEvent::Polling => "polling",
            ConsumerEvent::BatchReceived { .. } => "batch_received",
            ConsumerEvent::BatchCompleted { .. } => "batch_completed",
            ConsumerEvent::ReceiveFailed { .. } => "receive_failed",
            ConsumerEvent::ShuttingDown { .. } => "shutting_down",
            ConsumerEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Trait for receiving consumer events (decoupled logging).
pub trait ConsumerReporter: Send + Sync {
    fn report(&self, event: ConsumerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsumerReporter;

impl ConsumerReporter for TracingConsumerReporter {
    fn report(&self, event: ConsumerEvent<'_>) {
        match event {
            ConsumerEvent::Started { queue } => {
                tracing::info!(%queue, "Consumer started");
            }
            ConsumerEvent::Polling => {
                tracing::debug!("Polling for messages");
            }
            ConsumerEvent::BatchReceived { count } => {
                tracing::debug!(count, "Batch received");
            }
            ConsumerEvent::BatchCompleted { summary } => {
                tracing::info!(
                    received = summary.received,
                    processed = summary.processed,
                    deferred = summary.deferred,
                    quarantined = summary.quarantined,
                    "Batch completed"
                );
            }
            ConsumerEvent::ReceiveFailed { error } => {
                tracing::error!(%error, "Failed to receive messages");
            }
            ConsumerEvent::ShuttingDown { queue, totals } => {
                tracing::info!(
                    %queue,
                    processed = totals.processed,
                    failed = totals.failed,
                    "Consumer shutting down"
                );
            }
            ConsumerEvent::Stopped { queue } => {
                tracing::info!(%queue, "Consumer stopped");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages requested per receive.
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty. Doubled after a
    /// receive error.
    pub poll_interval: Duration,
    /// Process a batch with bounded concurrency instead of one at a time.
    pub concurrent: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            poll_interval: Duration::from_secs(1),
            concurrent: true,
        }
    }
}

impl ConsumerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::ConfigError("Batch size must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(AppError::ConfigError(
                "Poll interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Does the work for one received message.
pub trait MessageProcessor: Send + Sync + Clone {
    fn process(
        &self,
        message: InFlightMessage,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Processes envelopes by calling the model gateway, pacing each source by
/// the throttle's recommendation and handing results to a sink.
#[derive(Clone)]
pub struct EnvelopeProcessor<T, S, O = NullSink>
where
    T: UpstreamTransport,
    S: MetricsStore,
    O: OutputSink,
{
    gateway: ExternalCallGateway<T>,
    throttle: AdaptiveThrottleController<S>,
    sink: O,
    /// Earliest start of the next request per source.
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<T, S> EnvelopeProcessor<T, S, NullSink>
where
    T: UpstreamTransport,
    S: MetricsStore,
{
    pub fn new(gateway: ExternalCallGateway<T>, throttle: AdaptiveThrottleController<S>) -> Self {
        Self {
            gateway,
            throttle,
            sink: NullSink,
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T, S, O> EnvelopeProcessor<T, S, O>
where
    T: UpstreamTransport,
    S: MetricsStore,
    O: OutputSink,
{
    pub fn with_sink<O2: OutputSink>(self, sink: O2) -> EnvelopeProcessor<T, S, O2> {
        EnvelopeProcessor {
            gateway: self.gateway,
            throttle: self.throttle,
            sink,
            next_slot: self.next_slot,
        }
    }

    pub fn gateway(&self) -> &ExternalCallGateway<T> {
        &self.gateway
    }

    pub fn throttle(&self) -> &AdaptiveThrottleController<S> {
        &self.throttle
    }

    /// Build the model call for an envelope.
    pub fn request_for(envelope: &Envelope) -> Result<CallRequest, AppError> {
        match envelope {
            Envelope::Summarize(p) => {
                let request = CallRequest::new(p.model_tier, p.content.clone())
                    .with_system_prompt(SUMMARIZE_PROMPT);
                Ok(match p.max_tokens {
                    Some(max) => request.with_max_tokens(max),
                    None => request,
                })
            }
            Envelope::Extract(p) => Ok(CallRequest::new(p.model_tier, p.content.clone())
                .with_system_prompt(EXTRACT_PROMPT)
                .with_response_schema(p.schema.clone())),
            Envelope::Unknown { operation } => Err(AppError::UnknownOperation(operation.clone())),
        }
    }

    /// Run one envelope end to end and return the model's response.
    pub async fn handle(&self, envelope: Envelope) -> Result<CallResponse, AppError> {
        let request = Self::request_for(&envelope)?;
        let source = envelope.source().unwrap_or("unknown").to_string();

        self.wait_for_source(&source).await;

        let started = Instant::now();
        let result = self.gateway.call(&request).await;
        match &result {
            // Rate limited along the way: the source still needs to back off.
            Ok(response) if response.rate_limited_attempts > 0 => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.throttle
                    .after_request(&source, true, elapsed_ms, Some(429))
                    .await;
            }
            _ => {
                self.throttle
                    .record_outcome(&source, &result, started.elapsed())
                    .await;
            }
        }
        let response = result?;

        if matches!(envelope, Envelope::Extract(_)) {
            serde_json::from_str::<serde_json::Value>(&response.content).map_err(|e| {
                AppError::MalformedResponse(format!("Extraction is not valid JSON: {e}"))
            })?;
        }

        self.sink.deliver(&envelope, &response).await?;
        Ok(response)
    }

    /// Reserve the next request slot for `source` and sleep until it starts.
    async fn wait_for_source(&self, source: &str) {
        let delay = self.throttle.recommended_delay(source).await;
        let start = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let start = slots.get(source).map_or(now, |next| (*next).max(now));
            slots.insert(source.to_string(), start + delay);
            start
        };

        let wait = start.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            tracing::debug!(
                source = %source,
                sleep_ms = %wait.as_millis(),
                "Pacing request to source"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

impl<T, S, O> MessageProcessor for EnvelopeProcessor<T, S, O>
where
    T: UpstreamTransport,
    S: MetricsStore,
    O: OutputSink,
{
    async fn process(&self, message: InFlightMessage) -> Result<(), AppError> {
        let envelope = message.envelope()?;
        self.handle(envelope).await.map(|_| ())
    }
}

/// Polls the queue and processes batches until cancelled.
pub struct QueueConsumer<Q, P>
where
    Q: QueueClient,
    P: MessageProcessor,
{
    handler: QueueMessageHandler<Q>,
    processor: P,
    config: ConsumerConfig,
}

impl<Q, P> QueueConsumer<Q, P>
where
    Q: QueueClient,
    P: MessageProcessor,
{
    pub fn new(
        handler: QueueMessageHandler<Q>,
        processor: P,
        config: ConsumerConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            handler,
            processor,
            config,
        })
    }

    pub fn handler(&self) -> &QueueMessageHandler<Q> {
        &self.handler
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Receive and process one batch.
    pub async fn run_once(&self) -> Result<BatchSummary, AppError> {
        let messages = self.handler.receive(self.config.batch_size).await?;
        if messages.is_empty() {
            return Ok(BatchSummary::default());
        }
        let processor = &self.processor;
        Ok(self
            .handler
            .process_batch(messages, |m| processor.process(m), self.config.concurrent)
            .await)
    }

    /// Run the consumer loop until cancellation. Returns totals over every
    /// batch processed.
    pub async fn run<R: ConsumerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &R,
    ) -> Result<BatchSummary, AppError> {
        let queue = self.handler.main_queue().name();
        let mut totals = BatchSummary::default();
        reporter.report(ConsumerEvent::Started { queue });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(ConsumerEvent::Polling);

            match self.handler.receive(self.config.batch_size).await {
                Ok(messages) if !messages.is_empty() => {
                    reporter.report(ConsumerEvent::BatchReceived {
                        count: messages.len(),
                    });
                    let processor = &self.processor;
                    let summary = self
                        .handler
                        .process_batch(messages, |m| processor.process(m), self.config.concurrent)
                        .await;
                    totals.merge(&summary);
                    reporter.report(ConsumerEvent::BatchCompleted { summary: &summary });
                }
                Ok(_) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    reporter.report(ConsumerEvent::ReceiveFailed { error: &error });
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        reporter.report(ConsumerEvent::ShuttingDown {
            queue,
            totals: &totals,
        });
        reporter.report(ConsumerEvent::Stopped { queue });
        Ok(totals)
    }
}
