//! Outbound model calls with pacing, bounded retry and region failover.
//!
//! For each call the gateway walks a trial order (the tier's preferred
//! region, then every other region in declaration order). Within a region
//! each attempt first takes a token from that region's limiter, then sends.
//! Transient failures and soft rate limits are retried under the configured
//! [`RetryPolicy`]; a hard rate limit or a malformed reply moves straight to
//! the next region. Fatal errors end the call without failover.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppError, FailureKind};
use crate::models::{CallRequest, CallResponse, ModelTier, RegionEndpoint, UpstreamReply, UsageRecord};
use crate::rate_limit::MultiRegionLimiterPool;
use crate::retry::{RetryError, RetryPolicy, with_retry};
use crate::traits::UpstreamTransport;

/// Limiter tokens taken per upstream attempt.
const TOKENS_PER_ATTEMPT: u32 = 1;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retry schedule applied within one region.
    pub retry: RetryPolicy<AppError>,
    /// Region tried first for each tier.
    pub preferred_regions: HashMap<ModelTier, String>,
    /// Model used for each tier when the request names none.
    pub model_tiers: HashMap<ModelTier, String>,
    /// Model used when neither the request nor `model_tiers` names one.
    pub default_model: String,
    /// Usage records kept for [`GatewayStats::recent`].
    pub max_history: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            preferred_regions: HashMap::new(),
            model_tiers: HashMap::new(),
            default_model: "gpt-4o-mini".to_string(),
            max_history: 1000,
        }
    }
}

impl GatewayConfig {
    pub fn with_retry(mut self, retry: RetryPolicy<AppError>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_preferred_region(mut self, tier: ModelTier, region: impl Into<String>) -> Self {
        self.preferred_regions.insert(tier, region.into());
        self
    }

    pub fn with_model(mut self, tier: ModelTier, model: impl Into<String>) -> Self {
        self.model_tiers.insert(tier, model.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }
}

/// Usage totals for one region or model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.calls += 1;
        self.tokens_in += u64::from(record.tokens_in);
        self.tokens_out += u64::from(record.tokens_out);
        self.cost += record.estimated_cost;
    }
}

/// Snapshot of the gateway's usage counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GatewayStats {
    /// Calls that returned a response.
    pub total_calls: u64,
    /// Calls that returned an error.
    pub failed_calls: u64,
    pub total_cost: f64,
    pub by_region: BTreeMap<String, UsageTotals>,
    pub by_model: BTreeMap<String, UsageTotals>,
    /// Most recent usage records, oldest first.
    pub recent: Vec<UsageRecord>,
}

#[derive(Default)]
struct UsageLedger {
    total_calls: u64,
    failed_calls: u64,
    total_cost: f64,
    by_region: BTreeMap<String, UsageTotals>,
    by_model: BTreeMap<String, UsageTotals>,
    recent: VecDeque<UsageRecord>,
    attempts: BTreeMap<String, u64>,
}

/// How one failed attempt affects the rest of the call.
#[derive(thiserror::Error, Debug)]
enum AttemptFailure {
    /// Try this region again after backoff.
    #[error("{0}")]
    Retry(AppError),
    /// Give up on this region and try the next one.
    #[error("{0}")]
    FailOver(AppError),
    /// Give up on the call.
    #[error("{0}")]
    Fatal(AppError),
}

impl AttemptFailure {
    fn is_retry(&self) -> bool {
        matches!(self, AttemptFailure::Retry(_))
    }

    fn delay_hint(&self) -> Option<Duration> {
        match self {
            AttemptFailure::Retry(e) => e.retry_after(),
            _ => None,
        }
    }

    fn into_inner(self) -> AppError {
        match self {
            AttemptFailure::Retry(e) | AttemptFailure::FailOver(e) | AttemptFailure::Fatal(e) => e,
        }
    }
}

/// Executes [`CallRequest`]s against a set of regions.
#[derive(Clone)]
pub struct ExternalCallGateway<T: UpstreamTransport> {
    transport: T,
    regions: Arc<[RegionEndpoint]>,
    pool: MultiRegionLimiterPool,
    config: Arc<GatewayConfig>,
    ledger: Arc<Mutex<UsageLedger>>,
}

impl<T: UpstreamTransport> ExternalCallGateway<T> {
    /// Every region needs a limiter in `pool`, and every preferred region
    /// must be one of `regions`.
    pub fn new(
        transport: T,
        regions: Vec<RegionEndpoint>,
        pool: MultiRegionLimiterPool,
        config: GatewayConfig,
    ) -> Result<Self, AppError> {
        if regions.is_empty() {
            return Err(AppError::ConfigError("At least one region is required".into()));
        }
        let mut names = HashSet::new();
        for region in &regions {
            region.validate()?;
            if !names.insert(region.name.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "Duplicate region '{}'",
                    region.name
                )));
            }
            if pool.limiter(&region.name).is_none() {
                return Err(AppError::ConfigError(format!(
                    "Region '{}' has no rate limiter",
                    region.name
                )));
            }
        }
        for (tier, region) in &config.preferred_regions {
            if !names.contains(region.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "Preferred region '{region}' for tier {tier} is not configured"
                )));
            }
        }

        Ok(Self {
            transport,
            regions: regions.into(),
            pool,
            config: Arc::new(config),
            ledger: Arc::new(Mutex::new(UsageLedger::default())),
        })
    }

    pub fn regions(&self) -> &[RegionEndpoint] {
        &self.regions
    }

    pub fn pool(&self) -> &MultiRegionLimiterPool {
        &self.pool
    }

    fn lock_ledger(&self) -> MutexGuard<'_, UsageLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| {
            warn!("Recovered from poisoned gateway ledger mutex");
            poisoned.into_inner()
        })
    }

    /// Regions in the order a call for `tier` tries them.
    pub fn trial_order(&self, tier: ModelTier) -> Vec<&RegionEndpoint> {
        let preferred = self.config.preferred_regions.get(&tier);
        let mut order: Vec<&RegionEndpoint> = Vec::with_capacity(self.regions.len());
        if let Some(first) = preferred.and_then(|name| self.regions.iter().find(|r| &r.name == name)) {
            order.push(first);
        }
        order.extend(
            self.regions
                .iter()
                .filter(|r| preferred.is_none_or(|name| &r.name != name)),
        );
        order
    }

    /// Model a request will be sent with.
    pub fn resolve_model(&self, request: &CallRequest) -> String {
        request
            .model
            .clone()
            .or_else(|| self.config.model_tiers.get(&request.model_tier).cloned())
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    /// Perform one logical call.
    ///
    /// Fails with [`AppError::AllRegionsExhausted`] once every region has
    /// been tried, or with the original error when it is fatal. Usage is
    /// recorded only when the returned future completes.
    ///
    /// Rate-limit rejections seen along the way are reported either through
    /// [`CallResponse::rate_limited_attempts`] or the exhausted error.
    pub async fn call(&self, request: &CallRequest) -> Result<CallResponse, AppError> {
        let model = self.resolve_model(request);
        let policy = self.attempt_policy();
        let rate_limited = AtomicU32::new(0);
        let mut attempted = Vec::new();
        let mut last_error: Option<AppError> = None;

        for region in self.trial_order(request.model_tier) {
            attempted.push(region.name.clone());
            let region_request = Self::region_request(request, region, &model);

            let result = with_retry(&policy, |attempt| {
                self.attempt(region, &region_request, attempt, &rate_limited)
            })
            .await;

            match result {
                Ok((reply, latency)) => {
                    if attempted.len() > 1 {
                        info!(region = %region.name, attempted = ?attempted, "Call succeeded after failover");
                    }
                    let mut response = self.complete(region, reply, latency);
                    response.rate_limited_attempts = rate_limited.load(Ordering::Relaxed);
                    return Ok(response);
                }
                Err(RetryError { error, attempts }) => match error {
                    AttemptFailure::Fatal(e) => {
                        warn!(region = %region.name, error = %e, "Fatal upstream error, not failing over");
                        self.lock_ledger().failed_calls += 1;
                        return Err(e);
                    }
                    other => {
                        let e = other.into_inner();
                        warn!(
                            region = %region.name,
                            attempts,
                            error = %e,
                            "Region exhausted, failing over"
                        );
                        last_error = Some(e);
                    }
                },
            }
        }

        self.lock_ledger().failed_calls += 1;
        Err(AppError::AllRegionsExhausted {
            attempted,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
            rate_limited: rate_limited.load(Ordering::Relaxed) > 0,
        })
    }

    /// Snapshot of usage counters.
    pub fn stats(&self) -> GatewayStats {
        let ledger = self.lock_ledger();
        GatewayStats {
            total_calls: ledger.total_calls,
            failed_calls: ledger.failed_calls,
            total_cost: ledger.total_cost,
            by_region: ledger.by_region.clone(),
            by_model: ledger.by_model.clone(),
            recent: ledger.recent.iter().cloned().collect(),
        }
    }

    /// Upstream attempts made per region, including failed ones.
    pub fn attempt_counts(&self) -> BTreeMap<String, u64> {
        self.lock_ledger().attempts.clone()
    }

    fn attempt_policy(&self) -> RetryPolicy<AttemptFailure> {
        let retry = &self.config.retry;
        RetryPolicy {
            max_attempts: retry.max_attempts,
            backoff_base: retry.backoff_base,
            backoff_max: retry.backoff_max,
            jitter: retry.jitter,
            retryable: AttemptFailure::is_retry,
            delay_hint: AttemptFailure::delay_hint,
        }
    }

    fn region_request(request: &CallRequest, region: &RegionEndpoint, model: &str) -> CallRequest {
        let cap = region.max_tokens_per_request;
        let mut region_request = request.clone();
        region_request.model = Some(model.to_string());
        region_request.max_tokens = Some(request.max_tokens.map_or(cap, |max| max.min(cap)));
        region_request
    }

    async fn attempt(
        &self,
        region: &RegionEndpoint,
        request: &CallRequest,
        attempt: u32,
        rate_limited: &AtomicU32,
    ) -> Result<(UpstreamReply, Duration), AttemptFailure> {
        if let Some(waited) = self.pool.acquire_region(&region.name, TOKENS_PER_ATTEMPT).await
            && !waited.is_zero()
        {
            debug!(region = %region.name, waited_ms = %waited.as_millis(), "Throttled by region limiter");
        }
        *self.lock_ledger().attempts.entry(region.name.clone()).or_default() += 1;

        let started = Instant::now();
        let reply = self
            .transport
            .send(region, request)
            .await
            .and_then(validate_reply)
            .map_err(|e| {
                if e.is_rate_limit() {
                    rate_limited.fetch_add(1, Ordering::Relaxed);
                }
                self.classify(e)
            })?;
        debug!(region = %region.name, attempt, "Upstream attempt succeeded");
        Ok((reply, started.elapsed()))
    }

    fn classify(&self, error: AppError) -> AttemptFailure {
        let backoff_max = self.config.retry.backoff_max;
        match error {
            AppError::RateLimitExceeded {
                retry_after: Some(wait),
            } if wait > backoff_max => AttemptFailure::FailOver(error),
            AppError::MalformedResponse(_) => AttemptFailure::FailOver(error),
            e if self.config.retry.should_retry(&e) => AttemptFailure::Retry(e),
            e if e.failure_kind() == FailureKind::Fatal => AttemptFailure::Fatal(e),
            e => AttemptFailure::FailOver(e),
        }
    }

    fn complete(&self, region: &RegionEndpoint, reply: UpstreamReply, latency: Duration) -> CallResponse {
        let estimated_cost = region.estimate_cost(reply.tokens_in, reply.tokens_out);
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let record = UsageRecord {
            region: region.name.clone(),
            model: reply.model.clone(),
            tokens_in: reply.tokens_in,
            tokens_out: reply.tokens_out,
            latency_ms,
            estimated_cost,
            recorded_at: Utc::now(),
        };

        {
            let mut ledger = self.lock_ledger();
            ledger.total_calls += 1;
            ledger.total_cost += estimated_cost;
            ledger.by_region.entry(record.region.clone()).or_default().add(&record);
            ledger.by_model.entry(record.model.clone()).or_default().add(&record);
            if self.config.max_history > 0 {
                if ledger.recent.len() >= self.config.max_history {
                    ledger.recent.pop_front();
                }
                ledger.recent.push_back(record);
            }
        }

        CallResponse {
            region: region.name.clone(),
            model: reply.model,
            content: reply.content,
            tokens_in: reply.tokens_in,
            tokens_out: reply.tokens_out,
            latency_ms,
            estimated_cost,
            rate_limited_attempts: 0,
        }
    }
}

fn validate_reply(reply: UpstreamReply) -> Result<UpstreamReply, AppError> {
    if reply.content.trim().is_empty() {
        return Err(AppError::MalformedResponse("Reply has no content".into()));
    }
    if reply.model.is_empty() {
        return Err(AppError::MalformedResponse("Reply names no model".into()));
    }
    Ok(reply)
}
