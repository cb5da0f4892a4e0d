pub mod consumer;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod memory;
pub mod message;
pub mod models;
pub mod rate_limit;
pub mod retry;
pub mod throttle;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use consumer::{
    ConsumerConfig, ConsumerEvent, ConsumerReporter, EnvelopeProcessor, MessageProcessor,
    QueueConsumer, TracingConsumerReporter,
};
pub use error::{AppError, FailureKind};
pub use gateway::{ExternalCallGateway, GatewayConfig, GatewayStats};
pub use handler::{BatchSummary, HandlerConfig, ProcessError, QueueMessageHandler};
pub use memory::{MemoryMetricsStore, MemoryQueue};
pub use message::{Envelope, InFlightMessage, PoisonEnvelope};
pub use models::{CallRequest, CallResponse, ModelTier, RegionEndpoint};
pub use rate_limit::{LimiterConfig, MultiRegionLimiterPool, TokenBucketLimiter};
pub use retry::{RetryPolicy, with_retry};
pub use throttle::{AdaptiveThrottleController, HealthStatus, SourceHealthRecord, ThrottleConfig};
pub use traits::{MetricsStore, NullSink, OutputSink, QueueClient, UpstreamTransport};
