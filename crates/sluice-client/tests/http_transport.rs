//! HttpTransport against a mock OpenAI-compatible server.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use sluice_client::HttpTransport;
use sluice_core::{AppError, CallRequest, FailureKind, ModelTier, RegionEndpoint, UpstreamTransport};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport() -> HttpTransport {
    HttpTransport::with_credentials(HashMap::from([(
        "TEST_REGION_KEY".to_string(),
        "sk-test".to_string(),
    )]))
    .unwrap()
}

fn region(server: &MockServer) -> RegionEndpoint {
    RegionEndpoint::new("test", format!("{}/v1/", server.uri()), "TEST_REGION_KEY")
}

fn request() -> CallRequest {
    CallRequest::new(ModelTier::Fast, "Summarize this").with_model("gpt-4o-mini")
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "gpt-4o-mini-2024-07-18",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
    })
}

#[tokio::test]
async fn test_successful_completion() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("A short summary.")))
        .expect(1)
        .mount(&server)
        .await;

    let reply = transport().send(&region(&server), &request()).await?;

    assert_eq!(reply.content, "A short summary.");
    assert_eq!(reply.model, "gpt-4o-mini-2024-07-18");
    assert_eq!(reply.tokens_in, 12);
    assert_eq!(reply.tokens_out, 5);
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
        )
        .mount(&server)
        .await;

    let err = transport()
        .send(&region(&server), &request())
        .await
        .unwrap_err();

    assert!(err.is_rate_limit());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_json(json!({"error": {"message": "The engine is currently overloaded"}})),
        )
        .mount(&server)
        .await;

    let err = transport()
        .send(&region(&server), &request())
        .await
        .unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::Transient);
    assert!(err.to_string().contains("overloaded"));
}

#[tokio::test]
async fn test_client_error_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = transport()
        .send(&region(&server), &request())
        .await
        .unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::Fatal);
    assert_eq!(err.status_code(), Some(401));
    assert!(err.to_string().contains("invalid api key"));
}

#[tokio::test]
async fn test_missing_choices_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [],
            "usage": {"prompt_tokens": 1, "completion_tokens": 0}
        })))
        .mount(&server)
        .await;

    let err = transport()
        .send(&region(&server), &request())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_non_json_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = transport()
        .send(&region(&server), &request())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let transport = transport().with_timeout(Duration::from_secs(1)).unwrap();
    let err = transport
        .send(&region(&server), &request())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(1)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    let server = MockServer::start().await;
    let region = region(&server);
    drop(server);

    let err = transport().send(&region, &request()).await.unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::Transient);
}

#[test]
fn test_from_env_requires_every_credential() {
    let regions = vec![RegionEndpoint::new(
        "missing",
        "https://missing.example.com/v1",
        "SLUICE_TEST_KEY_THAT_IS_NEVER_SET",
    )];
    let err = HttpTransport::from_env(&regions).err().unwrap();
    assert!(matches!(err, AppError::ConfigError(_)));
    assert!(err.to_string().contains("SLUICE_TEST_KEY_THAT_IS_NEVER_SET"));
}
