//! Adaptive per-source pacing.
//!
//! Every upstream source has a [`SourceHealthRecord`] that is updated after
//! each request and persisted through a [`MetricsStore`], so accumulated
//! backoff survives a restart. The controller only does bookkeeping: callers
//! read [`AdaptiveThrottleController::recommended_delay`] and wait themselves.
//!
//! ```text
//! Healthy  ──(degrade_after errors | rate limit)──►  Degraded
//! Degraded ──(fail_after errors)──────────────────►  Failing
//! Degraded ──(rate limit)─────────────────────────►  RateLimited
//! Failing | RateLimited ──(recover_after successes)──►  Degraded
//! Degraded ──(recover_after successes)────────────►  Healthy
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::traits::MetricsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    RateLimited,
    Failing,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::RateLimited => write!(f, "rate_limited"),
            HealthStatus::Failing => write!(f, "failing"),
        }
    }
}

/// Tuning for the per-source state machine and delay curve.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Smallest recommended delay. New sources start here.
    pub floor: Duration,
    /// Largest recommended delay.
    pub ceiling: Duration,
    /// Delay multiplier after an error.
    pub backoff_factor: f64,
    /// Delay multiplier after a rate-limit signal.
    pub rate_limit_factor: f64,
    /// Delay multiplier applied on sustained success. Below 1.
    pub decay_factor: f64,
    /// Consecutive successes before the delay starts to decay.
    pub decay_after: u32,
    /// Consecutive errors that move a healthy source to degraded.
    pub degrade_after: u32,
    /// Consecutive errors that move a degraded source to failing.
    pub fail_after: u32,
    /// Consecutive successes needed for each recovery step.
    pub recover_after: u32,
    /// Outcomes kept for the rolling success rate.
    pub window_size: usize,
    /// Store keys are `<key_prefix>/<source>`.
    pub key_prefix: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(300),
            backoff_factor: 2.0,
            rate_limit_factor: 3.0,
            decay_factor: 0.8,
            decay_after: 5,
            degrade_after: 3,
            fail_after: 5,
            recover_after: 5,
            window_size: 20,
            key_prefix: "throttle".to_string(),
        }
    }
}

impl ThrottleConfig {
    pub fn with_delay_bounds(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.floor = floor;
        self.ceiling = ceiling;
        self
    }

    pub fn with_factors(mut self, backoff: f64, rate_limit: f64, decay: f64) -> Self {
        self.backoff_factor = backoff;
        self.rate_limit_factor = rate_limit;
        self.decay_factor = decay;
        self
    }

    pub fn with_thresholds(mut self, degrade_after: u32, fail_after: u32, recover_after: u32) -> Self {
        self.degrade_after = degrade_after;
        self.fail_after = fail_after;
        self.recover_after = recover_after;
        self
    }

    pub fn with_decay_after(mut self, successes: u32) -> Self {
        self.decay_after = successes;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.floor.is_zero() || self.floor > self.ceiling {
            return Err(AppError::ConfigError(format!(
                "Throttle delay bounds invalid: floor {:?}, ceiling {:?}",
                self.floor, self.ceiling
            )));
        }
        if !(self.backoff_factor >= 1.0 && self.rate_limit_factor >= 1.0) {
            return Err(AppError::ConfigError(
                "Throttle backoff factors must be at least 1".into(),
            ));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(AppError::ConfigError(
                "Throttle decay factor must be in (0, 1]".into(),
            ));
        }
        if self.degrade_after == 0 || self.fail_after == 0 || self.recover_after == 0 {
            return Err(AppError::ConfigError(
                "Throttle thresholds must be at least 1".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(AppError::ConfigError(
                "Throttle window size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn floor_secs(&self) -> f64 {
        self.floor.as_secs_f64()
    }

    fn ceiling_secs(&self) -> f64 {
        self.ceiling.as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Error,
    RateLimited,
}

impl Outcome {
    fn classify(success: bool, status_code: Option<u16>) -> Self {
        match (success, status_code) {
            (_, Some(429)) => Outcome::RateLimited,
            (true, _) => Outcome::Success,
            (false, _) => Outcome::Error,
        }
    }
}

/// Health and pacing state of one upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealthRecord {
    pub source_name: String,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub rate_limit_count: u64,
    pub avg_response_time_ms: f64,
    pub current_delay_seconds: f64,
    pub health_status: HealthStatus,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Successes since the status last changed; drives recovery steps.
    #[serde(default)]
    pub successes_in_status: u32,
    /// Rolling window of outcomes, `true` for success, newest last.
    #[serde(default)]
    pub recent_outcomes: VecDeque<bool>,
}

impl SourceHealthRecord {
    pub fn new(source_name: impl Into<String>, config: &ThrottleConfig) -> Self {
        Self {
            source_name: source_name.into(),
            request_count: 0,
            success_count: 0,
            error_count: 0,
            rate_limit_count: 0,
            avg_response_time_ms: 0.0,
            current_delay_seconds: config.floor_secs(),
            health_status: HealthStatus::Healthy,
            last_updated: Utc::now(),
            consecutive_successes: 0,
            consecutive_failures: 0,
            successes_in_status: 0,
            recent_outcomes: VecDeque::new(),
        }
    }

    /// Share of successes in the rolling window. 1.0 when nothing has been
    /// recorded yet.
    pub fn success_rate(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.recent_outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / self.recent_outcomes.len() as f64
    }

    pub fn recommended_delay(&self) -> Duration {
        Duration::from_secs_f64(self.current_delay_seconds.max(0.0))
    }

    fn apply(&mut self, outcome: Outcome, response_time_ms: f64, config: &ThrottleConfig) {
        self.request_count += 1;
        if response_time_ms.is_finite() && response_time_ms >= 0.0 {
            self.avg_response_time_ms +=
                (response_time_ms - self.avg_response_time_ms) / self.request_count as f64;
        }
        self.recent_outcomes.push_back(outcome == Outcome::Success);
        while self.recent_outcomes.len() > config.window_size {
            self.recent_outcomes.pop_front();
        }

        match outcome {
            Outcome::Success => self.on_success(config),
            Outcome::Error => {
                self.error_count += 1;
                self.on_failure(config.backoff_factor, config);
                self.health_status = match self.health_status {
                    HealthStatus::Healthy if self.consecutive_failures >= config.degrade_after => {
                        HealthStatus::Degraded
                    }
                    HealthStatus::Degraded | HealthStatus::RateLimited
                        if self.consecutive_failures >= config.fail_after =>
                    {
                        HealthStatus::Failing
                    }
                    status => status,
                };
            }
            Outcome::RateLimited => {
                self.rate_limit_count += 1;
                self.on_failure(config.rate_limit_factor, config);
                self.health_status = match self.health_status {
                    HealthStatus::Healthy => HealthStatus::Degraded,
                    HealthStatus::Degraded => HealthStatus::RateLimited,
                    status => status,
                };
            }
        }
        self.last_updated = Utc::now();
    }

    fn on_failure(&mut self, factor: f64, config: &ThrottleConfig) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.successes_in_status = 0;
        self.current_delay_seconds = (self.current_delay_seconds.max(config.floor_secs())
            * factor)
            .min(config.ceiling_secs());
    }

    fn on_success(&mut self, config: &ThrottleConfig) {
        self.success_count += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.successes_in_status += 1;

        if self.consecutive_successes >= config.decay_after {
            self.current_delay_seconds =
                (self.current_delay_seconds * config.decay_factor).max(config.floor_secs());
        }

        if self.successes_in_status >= config.recover_after {
            let recovered = match self.health_status {
                HealthStatus::Failing | HealthStatus::RateLimited => Some(HealthStatus::Degraded),
                HealthStatus::Degraded => Some(HealthStatus::Healthy),
                HealthStatus::Healthy => None,
            };
            if let Some(status) = recovered {
                self.health_status = status;
                self.successes_in_status = 0;
            }
        }
    }
}

type SourceSlot = Arc<OnceCell<Mutex<SourceHealthRecord>>>;

/// Tracks the health of every upstream source and recommends pacing.
///
/// Each source's record has its own lock; updates to different sources
/// never wait on each other. Clones share state.
#[derive(Clone)]
pub struct AdaptiveThrottleController<S: MetricsStore> {
    store: S,
    config: Arc<ThrottleConfig>,
    sources: Arc<RwLock<HashMap<String, SourceSlot>>>,
    persist_failures: Arc<AtomicU64>,
}

impl<S: MetricsStore> AdaptiveThrottleController<S> {
    pub fn new(store: S, config: ThrottleConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
            sources: Arc::new(RwLock::new(HashMap::new())),
            persist_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn key(&self, source: &str) -> String {
        format!("{}/{}", self.config.key_prefix, source)
    }

    /// Load persisted state for `sources` ahead of first use.
    pub async fn restore<I>(&self, sources: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for source in sources {
            let source = source.as_ref();
            let slot = self.slot(source).await;
            self.loaded(&slot, source).await;
        }
    }

    /// Update a source after a request and persist the new state.
    ///
    /// A `429` status counts as a rate-limit signal whatever `success` says.
    pub async fn after_request(
        &self,
        source: &str,
        success: bool,
        response_time_ms: f64,
        status_code: Option<u16>,
    ) -> SourceHealthRecord {
        let outcome = Outcome::classify(success, status_code);
        let slot = self.slot(source).await;
        let mut record = self.loaded(&slot, source).await.lock().await;

        let previous = record.health_status;
        record.apply(outcome, response_time_ms, &self.config);
        if record.health_status != previous {
            info!(
                source = %source,
                from = %previous,
                to = %record.health_status,
                delay_secs = record.current_delay_seconds,
                success_rate = record.success_rate(),
                "Source health changed"
            );
        } else {
            debug!(
                source = %source,
                outcome = ?outcome,
                delay_secs = record.current_delay_seconds,
                "Source health updated"
            );
        }

        let snapshot = record.clone();
        // Persist under the source lock so snapshots land in update order.
        self.persist(&snapshot).await;
        snapshot
    }

    /// Update a source from the result of a call.
    pub async fn record_outcome<T>(
        &self,
        source: &str,
        result: &Result<T, AppError>,
        elapsed: Duration,
    ) -> SourceHealthRecord {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        match result {
            Ok(_) => self.after_request(source, true, elapsed_ms, None).await,
            Err(e) => {
                let status = if e.is_rate_limit() {
                    Some(429)
                } else {
                    e.status_code()
                };
                self.after_request(source, false, elapsed_ms, status).await
            }
        }
    }

    /// How long to wait before the next request to `source`.
    pub async fn recommended_delay(&self, source: &str) -> Duration {
        self.with_record(source, |r| r.recommended_delay()).await
    }

    pub async fn health(&self, source: &str) -> HealthStatus {
        self.with_record(source, |r| r.health_status).await
    }

    /// Current records of every source seen so far, sorted by name.
    pub async fn snapshot(&self) -> Vec<SourceHealthRecord> {
        let slots: Vec<SourceSlot> = self.sources.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = slot.get() {
                records.push(record.lock().await.clone());
            }
        }
        records.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        records
    }

    /// Snapshots that could not be written so far.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    async fn with_record<R>(&self, source: &str, f: impl FnOnce(&SourceHealthRecord) -> R) -> R {
        let slot = self.slot(source).await;
        let record = self.loaded(&slot, source).await.lock().await;
        f(&record)
    }

    async fn slot(&self, source: &str) -> SourceSlot {
        let existing = self.sources.read().await.get(source).cloned();
        match existing {
            Some(slot) => slot,
            None => self
                .sources
                .write()
                .await
                .entry(source.to_string())
                .or_default()
                .clone(),
        }
    }

    /// The record behind `slot`, loading persisted state on first use. Only
    /// callers for the same source wait on the load.
    async fn loaded<'a>(&self, slot: &'a SourceSlot, source: &str) -> &'a Mutex<SourceHealthRecord> {
        slot.get_or_init(|| async { Mutex::new(self.load(source).await) })
            .await
    }

    async fn load(&self, source: &str) -> SourceHealthRecord {
        let key = self.key(source);
        match self.store.load(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<SourceHealthRecord>(value) {
                Ok(mut record) => {
                    record.source_name = source.to_string();
                    record.current_delay_seconds = record
                        .current_delay_seconds
                        .clamp(self.config.floor_secs(), self.config.ceiling_secs());
                    while record.recent_outcomes.len() > self.config.window_size {
                        record.recent_outcomes.pop_front();
                    }
                    info!(
                        source = %source,
                        status = %record.health_status,
                        delay_secs = record.current_delay_seconds,
                        "Restored source health"
                    );
                    record
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Discarding unreadable health snapshot");
                    SourceHealthRecord::new(source, &self.config)
                }
            },
            Ok(None) => SourceHealthRecord::new(source, &self.config),
            Err(e) => {
                warn!(source = %source, error = %e, "Could not load health snapshot, starting fresh");
                SourceHealthRecord::new(source, &self.config)
            }
        }
    }

    async fn persist(&self, record: &SourceHealthRecord) {
        let key = self.key(&record.source_name);
        let result = match serde_json::to_value(record) {
            Ok(value) => self.store.save(&key, &value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            let failures = self.persist_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                source = %record.source_name,
                key = %key,
                error = %e,
                failures,
                "Could not persist source health"
            );
        }
    }
}
