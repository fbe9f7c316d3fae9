//! Reasoning backends against a mock HTTP server

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sencha::agent::context::{ContextWindow, Observation};
use sencha::backend::{
    BackendError, Decision, DecisionError, DecisionSource, HostedBackend, LocalBackend, ReasoningAdapter,
};
use sencha::protocol::Screenshot;
use sencha::retry::RetryPolicy;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

fn inputs() -> (ContextWindow, Observation) {
    let window = ContextWindow::new("open the settings page", 4, 1000);
    let observation = Observation::new(
        Screenshot {
            image_base64: "iVBORw0KGgo=".to_string(),
            width: 1280,
            height: 800,
            format: "png".to_string(),
        },
        None,
    );
    (window, observation)
}

fn local(server: &MockServer, retry: RetryPolicy) -> ReasoningAdapter {
    let backend = LocalBackend::new(server.uri(), "qwen2.5vl", 0.1, Duration::from_secs(5)).unwrap();
    ReasoningAdapter::new(Arc::new(backend), None, retry)
}

fn hosted(server: &MockServer, retry: RetryPolicy) -> ReasoningAdapter {
    let backend = HostedBackend::new(
        format!("{}/v1", server.uri()),
        Some("sk-test".to_string()),
        "gpt-4o",
        0.1,
        4096,
        Duration::from_secs(5),
    )
    .unwrap();
    ReasoningAdapter::new(Arc::new(backend), None, retry)
}

fn local_reply(message: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"message": message, "done": true}))
}

#[tokio::test]
async fn test_local_native_tool_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"model": "qwen2.5vl", "stream": false})))
        .respond_with(local_reply(json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": "click", "arguments": {"x": 10, "y": 20}}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let decision = local(&server, fast_retry(3)).decide(&window, &observation).await.unwrap();
    assert_eq!(
        decision,
        Decision::ToolCall {
            name: "click".to_string(),
            arguments: json!({"x": 10, "y": 20}),
        }
    );
}

#[tokio::test]
async fn test_local_recovers_tool_call_from_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(local_reply(json!({
            "role": "assistant",
            "content": "I'll open it.\n```json\n{\"name\": \"browser_navigate\", \"arguments\": {\"url\": \"https://example.com\"}}\n```"
        })))
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let decision = local(&server, fast_retry(3)).decide(&window, &observation).await.unwrap();
    assert_eq!(
        decision,
        Decision::ToolCall {
            name: "browser_navigate".to_string(),
            arguments: json!({"url": "https://example.com"}),
        }
    );
}

#[tokio::test]
async fn test_local_text_only_reply_is_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(local_reply(json!({"role": "assistant", "content": "The settings page is open."})))
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let decision = local(&server, fast_retry(3)).decide(&window, &observation).await.unwrap();
    assert!(matches!(decision, Decision::Completion { success: true, .. }));
}

#[tokio::test]
async fn test_server_error_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(local_reply(json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": "wait", "arguments": {"seconds": 2}}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let decision = local(&server, fast_retry(3)).decide(&window, &observation).await.unwrap();
    assert!(matches!(decision, Decision::ToolCall { ref name, .. } if name == "wait"));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(400).set_body_string("model does not support tools"))
        .expect(1)
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let err = local(&server, fast_retry(3)).decide(&window, &observation).await.unwrap_err();
    assert!(matches!(err, DecisionError::Fatal(BackendError::Status { status: 400, .. })));
}

#[tokio::test]
async fn test_malformed_reply_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"not\": \"a chat response\"}"))
        .expect(3)
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let err = local(&server, fast_retry(3)).decide(&window, &observation).await.unwrap_err();
    match err {
        DecisionError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last, BackendError::Malformed(_)));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
}

#[tokio::test]
async fn test_local_model_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "qwen2.5vl:latest"}, {"name": "llama3.2:3b"}]
        })))
        .mount(&server)
        .await;

    let present = LocalBackend::new(server.uri(), "qwen2.5vl", 0.1, Duration::from_secs(5)).unwrap();
    assert!(present.ensure_model().await.unwrap());

    let absent = LocalBackend::new(server.uri(), "llava", 0.1, Duration::from_secs(5)).unwrap();
    assert!(!absent.ensure_model().await.unwrap());
}

#[tokio::test]
async fn test_hosted_finish_task_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4o", "tool_choice": "auto"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "finish_task",
                            "arguments": "{\"success\": false, \"reason\": \"login required\"}"
                        }
                    }]
                }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let decision = hosted(&server, fast_retry(3)).decide(&window, &observation).await.unwrap();
    assert_eq!(
        decision,
        Decision::Completion {
            success: false,
            reason: "login required".to_string(),
        }
    );
}

#[tokio::test]
async fn test_hosted_empty_choices_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .expect(2)
        .mount(&server)
        .await;

    let (window, observation) = inputs();
    let err = hosted(&server, fast_retry(2)).decide(&window, &observation).await.unwrap_err();
    assert!(matches!(
        err,
        DecisionError::Exhausted {
            attempts: 2,
            last: BackendError::Malformed(_)
        }
    ));
}
