//! Token-bucket rate limiting for outbound model calls.
//!
//! [`TokenBucketLimiter`] guards a single quota. [`MultiRegionLimiterPool`]
//! holds one limiter per configured region and steers callers to whichever
//! region has the most budget left.
//!
//! ```text
//! acquire(n) ──lock──> refill ──enough?──yes──> debit ──unlock──> return
//!                                    │
//!                                    no ──> compute wait ──unlock──> sleep ──┐
//!                                    ▲                                       │
//!                                    └───────────────lock────────────────────┘
//! ```
//!
//! The lock is only held for refill + check + debit, never across a sleep, so
//! a waiting caller does not block unrelated callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::models::RegionEndpoint;

/// Float slack when comparing refilled tokens against a request.
const TOKEN_EPSILON: f64 = 1e-9;

/// Lower bound on a single wait so rounding never produces a busy loop.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Budget configuration for one limiter: `rate` tokens every `period`,
/// at most `capacity` banked.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    pub rate: f64,
    pub period: Duration,
    pub capacity: u32,
}

impl LimiterConfig {
    pub fn new(rate: f64, period: Duration, capacity: u32) -> Self {
        Self {
            rate,
            period,
            capacity,
        }
    }

    /// Tokens added per second.
    pub fn refill_per_second(&self) -> f64 {
        self.rate / self.period.as_secs_f64()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(AppError::ConfigError(
                "Limiter rate must be a positive number".into(),
            ));
        }
        if self.period.is_zero() {
            return Err(AppError::ConfigError(
                "Limiter period must be greater than zero".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(AppError::ConfigError(
                "Limiter capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for LimiterConfig {
    /// 60 requests per minute with a burst of 10.
    fn default() -> Self {
        Self {
            rate: 60.0,
            period: Duration::from_secs(60),
            capacity: 10,
        }
    }
}

/// Mutable bucket state. Only touched while holding the limiter's lock.
#[derive(Debug)]
struct RateBudget {
    capacity: f64,
    refill_per_second: f64,
    current_tokens: f64,
    /// May lie in the future while an oversized request's excess is reserved.
    last_refill: Instant,
}

impl RateBudget {
    fn refill(&mut self, now: Instant) {
        if now > self.last_refill {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.current_tokens =
                (self.current_tokens + elapsed * self.refill_per_second).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Time until `tokens` can be debited, assuming nobody else takes any.
    fn wait_for(&self, tokens: f64, now: Instant) -> Duration {
        let reserved = self.last_refill.saturating_duration_since(now);
        let deficit = (tokens - self.current_tokens).max(0.0);
        reserved + Duration::from_secs_f64(deficit / self.refill_per_second)
    }
}

#[derive(Debug, Default)]
struct LimiterCounters {
    requests: AtomicU64,
    tokens_acquired: AtomicU64,
    throttled_requests: AtomicU64,
    total_wait_micros: AtomicU64,
}

/// Read-only limiter statistics. Never used for admission decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterStats {
    pub name: String,
    pub requests: u64,
    pub tokens_acquired: u64,
    pub throttled_requests: u64,
    pub total_wait: Duration,
    pub available_tokens: f64,
}

enum Step {
    Admitted { reserve: Duration },
    Wait(Duration),
}

/// Token-bucket limiter with async-suspending acquisition.
///
/// Cloning is cheap and clones share the same budget. Acquisition can only be
/// delayed, never refused.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    name: String,
    config: LimiterConfig,
    budget: Arc<Mutex<RateBudget>>,
    counters: Arc<LimiterCounters>,
}

impl TokenBucketLimiter {
    /// Create a limiter that starts with a full bucket.
    pub fn new(name: impl Into<String>, config: LimiterConfig) -> Result<Self, AppError> {
        config.validate()?;
        let capacity = f64::from(config.capacity);
        let budget = RateBudget {
            capacity,
            refill_per_second: config.refill_per_second(),
            current_tokens: capacity,
            last_refill: Instant::now(),
        };
        Ok(Self {
            name: name.into(),
            config,
            budget: Arc::new(Mutex::new(budget)),
            counters: Arc::new(LimiterCounters::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    fn lock_budget(&self) -> MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(limiter = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Wait until `tokens` can be debited, debit them, and return how long
    /// the caller was suspended.
    ///
    /// Requests above `capacity` wait for a full bucket, drain it and reserve
    /// the excess against future refill, sleeping until that refill is due.
    pub async fn acquire(&self, tokens: u32) -> Duration {
        if tokens == 0 {
            return Duration::ZERO;
        }
        let started = Instant::now();
        let wanted = f64::from(tokens);
        let admit = wanted.min(f64::from(self.config.capacity));

        loop {
            let step = {
                let mut budget = self.lock_budget();
                let now = Instant::now();
                budget.refill(now);
                if now >= budget.last_refill && budget.current_tokens + TOKEN_EPSILON >= admit {
                    budget.current_tokens = (budget.current_tokens - admit).max(0.0);
                    let excess = wanted - admit;
                    let reserve = if excess > 0.0 {
                        let reserve = Duration::from_secs_f64(excess / budget.refill_per_second);
                        budget.last_refill = now + reserve;
                        reserve
                    } else {
                        Duration::ZERO
                    };
                    Step::Admitted { reserve }
                } else {
                    Step::Wait(budget.wait_for(admit, now).max(MIN_WAIT))
                }
            };

            match step {
                Step::Admitted { reserve } => {
                    if !reserve.is_zero() {
                        tokio::time::sleep(reserve).await;
                    }
                    break;
                }
                Step::Wait(wait) => {
                    tracing::debug!(
                        limiter = %self.name,
                        tokens,
                        wait_ms = %wait.as_millis(),
                        "Rate limited, waiting for refill"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let waited = started.elapsed();
        self.record(tokens, waited);
        waited
    }

    /// Debit `tokens` only if they are available right now.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        if tokens > self.config.capacity {
            return false;
        }
        let admitted = {
            let mut budget = self.lock_budget();
            let now = Instant::now();
            budget.refill(now);
            let wanted = f64::from(tokens);
            if now >= budget.last_refill && budget.current_tokens + TOKEN_EPSILON >= wanted {
                budget.current_tokens = (budget.current_tokens - wanted).max(0.0);
                true
            } else {
                false
            }
        };
        if admitted {
            self.record(tokens, Duration::ZERO);
        }
        admitted
    }

    /// Tokens available right now, after applying refill.
    pub fn available_tokens(&self) -> f64 {
        let mut budget = self.lock_budget();
        let now = Instant::now();
        budget.refill(now);
        if now < budget.last_refill {
            0.0
        } else {
            budget.current_tokens
        }
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            name: self.name.clone(),
            requests: self.counters.requests.load(Ordering::Relaxed),
            tokens_acquired: self.counters.tokens_acquired.load(Ordering::Relaxed),
            throttled_requests: self.counters.throttled_requests.load(Ordering::Relaxed),
            total_wait: Duration::from_micros(
                self.counters.total_wait_micros.load(Ordering::Relaxed),
            ),
            available_tokens: self.available_tokens(),
        }
    }

    fn record(&self, tokens: u32, waited: Duration) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.counters
            .tokens_acquired
            .fetch_add(u64::from(tokens), Ordering::Relaxed);
        if !waited.is_zero() {
            self.counters
                .throttled_requests
                .fetch_add(1, Ordering::Relaxed);
            self.counters
                .total_wait_micros
                .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        }
    }
}

/// Result of a scoped acquisition: the budget is already debited.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionPermit {
    pub region: String,
    pub waited: Duration,
}

/// One limiter per region, in declaration order.
#[derive(Clone)]
pub struct MultiRegionLimiterPool {
    limiters: Vec<TokenBucketLimiter>,
}

impl MultiRegionLimiterPool {
    /// Build a pool giving every region the same budget.
    pub fn new(regions: &[RegionEndpoint], config: &LimiterConfig) -> Result<Self, AppError> {
        Self::with_limiters(
            regions
                .iter()
                .map(|r| (r.name.clone(), config.clone()))
                .collect(),
        )
    }

    /// Build a pool with a budget per region.
    pub fn with_limiters(limiters: Vec<(String, LimiterConfig)>) -> Result<Self, AppError> {
        if limiters.is_empty() {
            return Err(AppError::ConfigError(
                "At least one region must be configured".into(),
            ));
        }
        let mut built: Vec<TokenBucketLimiter> = Vec::with_capacity(limiters.len());
        for (name, config) in limiters {
            if built.iter().any(|l| l.name() == name) {
                return Err(AppError::ConfigError(format!(
                    "Region '{name}' configured twice"
                )));
            }
            built.push(TokenBucketLimiter::new(name, config)?);
        }
        Ok(Self { limiters: built })
    }

    /// Region with the most tokens left; ties go to the earlier region.
    ///
    /// When every region is saturated the first region is returned and the
    /// subsequent acquire blocks there.
    pub fn select_region(&self) -> &str {
        let mut best: Option<(&TokenBucketLimiter, f64)> = None;
        for limiter in &self.limiters {
            let available = limiter.available_tokens();
            if available + TOKEN_EPSILON < 1.0 {
                continue;
            }
            if best.is_none_or(|(_, most)| available > most) {
                best = Some((limiter, available));
            }
        }
        best.map(|(l, _)| l)
            .unwrap_or(&self.limiters[0])
            .name()
    }

    /// Pick a region, debit its limiter and return the region name.
    pub async fn acquire(&self, tokens: u32) -> RegionPermit {
        let region = self.select_region().to_string();
        let waited = match self.limiter(&region) {
            Some(limiter) => limiter.acquire(tokens).await,
            None => Duration::ZERO,
        };
        RegionPermit { region, waited }
    }

    /// Debit a specific region. Returns `None` for an unknown region.
    pub async fn acquire_region(&self, region: &str, tokens: u32) -> Option<Duration> {
        match self.limiter(region) {
            Some(limiter) => Some(limiter.acquire(tokens).await),
            None => None,
        }
    }

    pub fn limiter(&self, region: &str) -> Option<&TokenBucketLimiter> {
        self.limiters.iter().find(|l| l.name() == region)
    }

    pub fn region_names(&self) -> Vec<&str> {
        self.limiters.iter().map(|l| l.name()).collect()
    }

    pub fn stats(&self) -> Vec<LimiterStats> {
        self.limiters.iter().map(|l| l.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(rate: f64, period_secs: u64, capacity: u32) -> TokenBucketLimiter {
        TokenBucketLimiter::new(
            "test",
            LimiterConfig::new(rate, Duration::from_secs(period_secs), capacity),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(LimiterConfig::default().validate().is_ok());
        assert!(LimiterConfig::new(0.0, Duration::from_secs(1), 1).validate().is_err());
        assert!(LimiterConfig::new(1.0, Duration::ZERO, 1).validate().is_err());
        assert!(LimiterConfig::new(1.0, Duration::from_secs(1), 0).validate().is_err());
        assert!(
            LimiterConfig::new(f64::NAN, Duration::from_secs(1), 1)
                .validate()
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_admits_immediately() {
        let limiter = bucket(2.0, 1, 2);
        assert_eq!(limiter.acquire(1).await, Duration::ZERO);
        assert_eq!(limiter.acquire(1).await, Duration::ZERO);
        assert!(limiter.available_tokens() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_waits_per_excess_token() {
        // rate=2 per 1s: each excess token costs 0.5s.
        let limiter = bucket(2.0, 1, 2);
        let waited = limiter.acquire(3).await;
        assert!(
            waited >= Duration::from_millis(495) && waited <= Duration::from_millis(550),
            "waited {waited:?}"
        );

        let limiter = bucket(4.0, 2, 4);
        // 4 per 2s = 2 tokens/s; two excess tokens cost 1s.
        let waited = limiter.acquire(6).await;
        assert!(
            waited >= Duration::from_millis(995) && waited <= Duration::from_millis(1050),
            "waited {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_delays_later_callers() {
        let limiter = bucket(2.0, 1, 2);
        limiter.acquire(3).await;
        // Reservation consumed, bucket empty: next token is 0.5s away.
        let waited = limiter.acquire(1).await;
        assert!(
            waited >= Duration::from_millis(495) && waited <= Duration::from_millis(550),
            "waited {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_concurrent_acquires_complete_in_waves() {
        let limiter = bucket(2.0, 1, 2);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(1).await;
                start.elapsed()
            }));
        }

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }
        finished.sort();

        assert!(finished[0] < Duration::from_millis(10));
        assert!(finished[1] < Duration::from_millis(10));
        assert!(finished[2] >= Duration::from_millis(495), "{finished:?}");
        assert!(finished[2] <= Duration::from_millis(1050), "{finished:?}");
        assert!(finished[4] <= Duration::from_millis(1600), "{finished:?}");

        let stats = limiter.stats();
        assert_eq!(stats.requests, 5);
        assert_eq!(stats.throttled_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_period_refills_up_to_capacity() {
        let limiter = bucket(2.0, 1, 2);
        limiter.acquire(2).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let available = limiter.available_tokens();
        assert!((available - 2.0).abs() < 1e-6, "available {available}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_admits_more_than_capacity_at_once() {
        let limiter = bucket(1.0, 60, 3);
        let admitted = (0..5).filter(|_| limiter.try_acquire(1)).count();
        assert_eq!(admitted, 3);
        assert!(!limiter.try_acquire(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_leaves_budget_untouched() {
        let limiter = bucket(2.0, 1, 2);
        limiter.acquire(2).await;

        let result =
            tokio::time::timeout(Duration::from_millis(100), limiter.acquire(1)).await;
        assert!(result.is_err(), "acquire should still be waiting");

        // 100ms of refill at 2 tokens/s, nothing debited by the cancelled call.
        let available = limiter.available_tokens();
        assert!((available - 0.2).abs() < 1e-3, "available {available}");
        assert_eq!(limiter.stats().requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_wait_time() {
        let limiter = bucket(10.0, 1, 1);
        limiter.acquire(1).await;
        limiter.acquire(1).await;
        let stats = limiter.stats();
        assert_eq!(stats.tokens_acquired, 2);
        assert_eq!(stats.throttled_requests, 1);
        assert!(stats.total_wait >= Duration::from_millis(95));
    }

    fn pool() -> MultiRegionLimiterPool {
        MultiRegionLimiterPool::with_limiters(vec![
            ("eastus".into(), LimiterConfig::new(1.0, Duration::from_secs(60), 2)),
            ("westeurope".into(), LimiterConfig::new(1.0, Duration::from_secs(60), 3)),
            ("japaneast".into(), LimiterConfig::new(1.0, Duration::from_secs(60), 3)),
        ])
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_region_prefers_most_remaining() {
        let pool = pool();
        // westeurope and japaneast tie at 3; declaration order wins.
        assert_eq!(pool.select_region(), "westeurope");

        pool.acquire_region("westeurope", 2).await.unwrap();
        assert_eq!(pool.select_region(), "japaneast");
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_region_falls_back_to_first_when_saturated() {
        let pool = pool();
        pool.acquire_region("eastus", 2).await.unwrap();
        pool.acquire_region("westeurope", 3).await.unwrap();
        pool.acquire_region("japaneast", 3).await.unwrap();
        assert_eq!(pool.select_region(), "eastus");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_acquire_debits_selected_region() {
        let pool = pool();
        let permit = pool.acquire(1).await;
        assert_eq!(permit.region, "westeurope");
        assert_eq!(permit.waited, Duration::ZERO);

        let west = pool.limiter("westeurope").unwrap();
        assert!((west.available_tokens() - 2.0).abs() < 1e-3);
        assert_eq!(pool.acquire_region("nowhere", 1).await, None);
    }

    #[test]
    fn test_pool_rejects_bad_configuration() {
        assert!(MultiRegionLimiterPool::with_limiters(vec![]).is_err());
        assert!(
            MultiRegionLimiterPool::with_limiters(vec![
                ("a".into(), LimiterConfig::default()),
                ("a".into(), LimiterConfig::default()),
            ])
            .is_err()
        );
    }
}
