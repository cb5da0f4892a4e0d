use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use sluice_core::{
    AppError, ConsumerConfig, GatewayConfig, HandlerConfig, LimiterConfig, ModelTier,
    RegionEndpoint,
};

/// Everything the worker process reads from its environment.
///
/// Database settings are read separately by `DatabaseConfig::from_env`.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: String,
    pub poison_queue: String,
    pub handler: HandlerConfig,
    pub consumer: ConsumerConfig,
    pub regions: Vec<RegionEndpoint>,
    pub limiter: LimiterConfig,
    pub gateway: GatewayConfig,
    /// Sources whose throttle state is loaded before the first poll.
    pub known_sources: Vec<String>,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let env = Env(lookup);

        let queue = env
            .get("SLUICE_QUEUE")
            .ok_or_else(|| AppError::ConfigError("SLUICE_QUEUE not set".into()))?;
        let poison_queue = env
            .get("SLUICE_POISON_QUEUE")
            .unwrap_or_else(|| format!("{queue}-poison"));

        let mut handler = HandlerConfig::default();
        if let Some(secs) = env.parse::<u64>("SLUICE_VISIBILITY_TIMEOUT_SECS")? {
            handler = handler.with_visibility_timeout(Duration::from_secs(secs));
        }
        if let Some(max) = env.parse::<u32>("SLUICE_MAX_DEQUEUE_COUNT")? {
            handler = handler.with_max_dequeue_count(max);
        }
        if let Some(concurrency) = env.parse::<usize>("SLUICE_CONCURRENCY")? {
            handler = handler.with_concurrency(concurrency);
        }
        if let Some(secs) = env.parse::<u64>("SLUICE_RETRY_BACKOFF_SECS")? {
            handler = handler.with_retry_backoff(Duration::from_secs(secs));
        }
        handler.validate()?;

        let mut consumer = ConsumerConfig::default();
        if let Some(size) = env.parse::<usize>("SLUICE_BATCH_SIZE")? {
            consumer = consumer.with_batch_size(size);
        }
        if let Some(ms) = env.parse::<u64>("SLUICE_POLL_INTERVAL_MS")? {
            consumer = consumer.with_poll_interval(Duration::from_millis(ms));
        }
        consumer.validate()?;

        let raw_regions = env
            .get("SLUICE_REGIONS")
            .ok_or_else(|| AppError::ConfigError("SLUICE_REGIONS not set".into()))?;
        let regions: Vec<RegionEndpoint> = serde_json::from_str(&raw_regions).map_err(|e| {
            AppError::ConfigError(format!("SLUICE_REGIONS must be a JSON array of regions: {e}"))
        })?;
        if regions.is_empty() {
            return Err(AppError::ConfigError(
                "SLUICE_REGIONS must name at least one region".into(),
            ));
        }

        let limiter = LimiterConfig::new(
            env.parse::<f64>("SLUICE_LIMITER_RATE")?.unwrap_or(60.0),
            Duration::from_secs(env.parse::<u64>("SLUICE_LIMITER_PERIOD_SECS")?.unwrap_or(60)),
            env.parse::<u32>("SLUICE_LIMITER_CAPACITY")?.unwrap_or(10),
        );
        limiter.validate()?;

        let mut gateway = GatewayConfig::default();
        if let Some(model) = env.get("SLUICE_MODEL") {
            gateway = gateway.with_default_model(model);
        }
        if let Some(raw) = env.get("SLUICE_MODEL_TIERS") {
            for (tier, model) in model_tiers(&raw)? {
                gateway = gateway.with_model(tier, model);
            }
        }

        let known_sources = env
            .get("SLUICE_SOURCES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            queue,
            poison_queue,
            handler,
            consumer,
            regions,
            limiter,
            gateway,
            known_sources,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, AppError> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                AppError::ConfigError(format!("Invalid {name} '{raw}'"))
            }),
        }
    }
}

/// Parse `{"fast": "model-a", ...}`.
fn model_tiers(raw: &str) -> Result<Vec<(ModelTier, String)>, AppError> {
    let map: HashMap<String, String> = serde_json::from_str(raw).map_err(|e| {
        AppError::ConfigError(format!("SLUICE_MODEL_TIERS must be a JSON object: {e}"))
    })?;
    map.into_iter()
        .map(|(tier, model)| {
            let tier = ModelTier::from_str(&tier)
                .map_err(|e| AppError::ConfigError(format!("SLUICE_MODEL_TIERS: {e}")))?;
            Ok((tier, model))
        })
        .collect()
}
