use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;

/// An independently-quota'd upstream endpoint.
///
/// Immutable once built; shared by the gateway, the limiter pool and the
/// transport behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionEndpoint {
    pub name: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key for this region.
    pub credential_ref: String,
    /// Estimated USD cost per 1000 tokens (input + output).
    #[serde(default)]
    pub cost_per_k_token: f64,
    pub max_tokens_per_request: u32,
}

impl RegionEndpoint {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        credential_ref: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            credential_ref: credential_ref.into(),
            cost_per_k_token: 0.0,
            max_tokens_per_request: 4096,
        }
    }

    pub fn with_cost_per_k_token(mut self, cost: f64) -> Self {
        self.cost_per_k_token = cost;
        self
    }

    pub fn with_max_tokens_per_request(mut self, max: u32) -> Self {
        self.max_tokens_per_request = max;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ConfigError("Region name must not be empty".into()));
        }
        let url = Url::parse(&self.base_url).map_err(|e| {
            AppError::ConfigError(format!(
                "Region '{}' has invalid base_url '{}': {e}",
                self.name, self.base_url
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!(
                "Region '{}' base_url must be http(s), got '{}'",
                self.name,
                url.scheme()
            )));
        }
        if self.max_tokens_per_request == 0 {
            return Err(AppError::ConfigError(format!(
                "Region '{}' max_tokens_per_request must be at least 1",
                self.name
            )));
        }
        if !(self.cost_per_k_token.is_finite() && self.cost_per_k_token >= 0.0) {
            return Err(AppError::ConfigError(format!(
                "Region '{}' cost_per_k_token must be a non-negative number",
                self.name
            )));
        }
        Ok(())
    }

    /// Estimated cost of a call that consumed the given token counts.
    pub fn estimate_cost(&self, tokens_in: u32, tokens_out: u32) -> f64 {
        let tokens = u64::from(tokens_in) + u64::from(tokens_out);
        tokens as f64 / 1000.0 * self.cost_per_k_token
    }
}

/// Model quality/price tier requested by a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    #[default]
    Standard,
    Premium,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Standard => "standard",
            ModelTier::Premium => "premium",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(ModelTier::Fast),
            "standard" => Ok(ModelTier::Standard),
            "premium" => Ok(ModelTier::Premium),
            _ => Err(format!("Unknown model tier: {}", s)),
        }
    }
}

/// One outbound model call, independent of region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRequest {
    pub model_tier: ModelTier,
    /// Explicit model; when `None` the gateway resolves one from the tier.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    /// JSON schema for structured output, if the caller wants JSON back.
    pub response_schema: Option<serde_json::Value>,
}

impl CallRequest {
    pub fn new(model_tier: ModelTier, prompt: impl Into<String>) -> Self {
        Self {
            model_tier,
            model: None,
            system_prompt: None,
            prompt: prompt.into(),
            max_tokens: None,
            response_schema: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// What an upstream transport returns for a single successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamReply {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Completed call as seen by the gateway's caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallResponse {
    pub region: String,
    pub model: String,
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub latency_ms: u64,
    pub estimated_cost: f64,
    /// Attempts rejected with a rate-limit signal before this response.
    pub rate_limited_attempts: u32,
}

/// Usage of one completed call, kept in the gateway's rolling counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub region: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub latency_ms: u64,
    pub estimated_cost: f64,
    pub recorded_at: DateTime<Utc>,
}
