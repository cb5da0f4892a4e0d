use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use sluice_core::error::AppError;
use sluice_core::models::{CallRequest, RegionEndpoint, UpstreamReply};
use sluice_core::traits::UpstreamTransport;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Longest server wait hint we take at face value.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// OpenAI-compatible chat completions transport.
///
/// One client is shared by every region; each request goes to
/// `{region.base_url}/chat/completions` with the bearer key named by the
/// region's `credential_ref`. Keys are resolved once when the transport is
/// built, so a missing key fails startup rather than the first call.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    credentials: HashMap<String, String>,
    timeout_secs: u64,
}

impl HttpTransport {
    /// Resolve every region's credential from the environment.
    pub fn from_env(regions: &[RegionEndpoint]) -> Result<Self, AppError> {
        let mut credentials = HashMap::new();
        for region in regions {
            let key = std::env::var(&region.credential_ref).map_err(|_| {
                AppError::ConfigError(format!(
                    "Region '{}' needs the {} environment variable",
                    region.name, region.credential_ref
                ))
            })?;
            credentials.insert(region.credential_ref.clone(), key);
        }
        Self::with_credentials(credentials)
    }

    /// Build with credentials keyed by `credential_ref`.
    pub fn with_credentials(credentials: HashMap<String, String>) -> Result<Self, AppError> {
        Self::build(credentials, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(self.credentials, timeout)
    }

    fn build(credentials: HashMap<String, String>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            credentials,
            timeout_secs: timeout.as_secs(),
        })
    }

    fn credential(&self, region: &RegionEndpoint) -> Result<&str, AppError> {
        self.credentials
            .get(&region.credential_ref)
            .map(String::as_str)
            .ok_or_else(|| {
                AppError::ConfigError(format!(
                    "No credential loaded for region '{}' ({})",
                    region.name, region.credential_ref
                ))
            })
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::NetworkError(e.to_string())
        }
    }
}

// ---- Chat completions wire types ----

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaWrapper<'a>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper<'a> {
    name: &'static str,
    strict: bool,
    schema: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn chat_request(request: &CallRequest) -> ChatRequest<'_> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system_prompt {
        messages.push(Message {
            role: "system",
            content: system,
        });
    }
    messages.push(Message {
        role: "user",
        content: &request.prompt,
    });

    ChatRequest {
        model: request.model.as_deref().unwrap_or_default(),
        messages,
        max_tokens: request.max_tokens,
        response_format: request.response_schema.as_ref().map(|schema| ResponseFormat {
            format_type: "json_schema",
            json_schema: JsonSchemaWrapper {
                name: "extraction",
                strict: true,
                schema,
            },
        }),
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP-date.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let wait = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
            (date.with_timezone(&chrono::Utc) - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        }
    };
    Some(wait.min(MAX_RETRY_AFTER))
}

fn parse_reply(body: &str, request: &CallRequest) -> Result<UpstreamReply, AppError> {
    let chat: ChatResponse = serde_json::from_str(body)
        .map_err(|e| AppError::MalformedResponse(format!("Invalid response body: {e}")))?;

    let content = chat
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AppError::MalformedResponse("Response has no choices[0].message.content".into()))?;
    let usage = chat
        .usage
        .ok_or_else(|| AppError::MalformedResponse("Response has no usage".into()))?;
    let model = chat
        .model
        .or_else(|| request.model.clone())
        .unwrap_or_default();

    Ok(UpstreamReply {
        content,
        model,
        tokens_in: usage.prompt_tokens,
        tokens_out: usage.completion_tokens,
    })
}

impl UpstreamTransport for HttpTransport {
    async fn send(
        &self,
        region: &RegionEndpoint,
        request: &CallRequest,
    ) -> Result<UpstreamReply, AppError> {
        let url = format!("{}/chat/completions", region.base_url.trim_end_matches('/'));
        let api_key = self.credential(region)?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&chat_request(request))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = retry_after(response.headers());
            tracing::debug!(region = %region.name, ?retry_after, "Upstream rate limited");
            return Err(AppError::RateLimitExceeded { retry_after });
        }
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(AppError::from_status(status_code, message));
        }

        let body = response.text().await.map_err(|e| self.map_send_error(e))?;
        parse_reply(&body, request)
    }
}
