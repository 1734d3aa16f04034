use super::*;
use crate::auth::credentials::{FileStore, SystemClock};
use crate::auth::{OAuthClient, TokenManager};
use crate::upstream::circuit_breaker::CircuitBreakerConfig;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FAR_FUTURE_MS: i64 = 4_102_444_800_000; // 2100-01-01

fn valid_creds() -> crate::auth::Credentials {
    crate::auth::Credentials {
        access_token: "atk-valid".into(),
        token_type: "Bearer".into(),
        refresh_token: "rtk-valid".into(),
        expiry_date: FAR_FUTURE_MS,
        resource_url: None,
    }
}

/// Assemble a ProxyService against mock upstream + OAuth servers with
/// seeded credentials. The TempDir keeps the credential file alive.
fn proxy_with(
    upstream: &MockServer,
    oauth: &MockServer,
    creds: crate::auth::Credentials,
    breaker_cfg: CircuitBreakerConfig,
) -> (ProxyService, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path());
    use crate::auth::credentials::CredentialStore as _;
    store.save(&creds).unwrap();

    let mut config = Config::default();
    config.upstream.api_base_url = upstream.uri();
    config.upstream.default_model = "qwen-plus".into();
    config.upstream.models = vec!["qwen-plus".into()];
    config.oauth.base_url = oauth.uri();
    config.oauth.client_id = "client-123".into();
    config.oauth.device_auth_url = format!("{}/oauth2/device/code", oauth.uri());
    let config = Arc::new(config);

    let tokens = Arc::new(
        TokenManager::new(
            Arc::new(store),
            OAuthClient::new(&config.oauth).unwrap(),
            config.oauth.token_refresh_buffer,
            Arc::new(SystemClock),
        )
        .with_browser_launch(false),
    );
    let upstream_client = UpstreamClient::new(&config.upstream).unwrap();
    let breaker = Arc::new(CircuitBreaker::new(breaker_cfg));
    let proxy = ProxyService::new(config, tokens, upstream_client, breaker);
    (proxy, dir)
}

fn chat_request(json_body: serde_json::Value) -> ChatCompletionRequest {
    serde_json::from_value(json_body).unwrap()
}

fn chat_response_body() -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "qwen-plus",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello!"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

#[tokio::test]
async fn chat_forwards_request_and_returns_upstream_json() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer atk-valid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response_body()))
        .expect(1)
        .mount(&upstream)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({
        "messages": [{"role": "user", "content": "hi"}],
        "seed": 42
    }));
    let resp = proxy.chat(req).await.unwrap();
    assert_eq!(resp["choices"][0]["message"]["content"], "Hello!");

    // default model substituted and unknown fields preserved on the wire
    let sent = &upstream.received_requests().await.unwrap()[0];
    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["model"], "qwen-plus");
    assert_eq!(body["seed"], 42);
}

#[tokio::test]
async fn validation_failure_skips_the_network() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );

    let req = chat_request(json!({"messages": []}));
    let err = proxy.chat(req).await.unwrap_err();
    assert!(matches!(err, ProxyError::Validation(_)));

    let req = chat_request(json!({
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 3.0
    }));
    assert!(matches!(
        proxy.chat(req).await.unwrap_err(),
        ProxyError::Validation(_)
    ));

    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn upstream_5xx_maps_to_unavailable() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&upstream)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({"messages": [{"role": "user", "content": "hi"}]}));
    let err = proxy.chat(req).await.unwrap_err();
    assert!(matches!(err, ProxyError::Unavailable(_)));
}

#[tokio::test]
async fn breaker_opens_after_repeated_upstream_failures() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let breaker_cfg = CircuitBreakerConfig {
        max_failures: 3,
        reset_timeout: Duration::from_secs(60),
        half_open_max_tries: 1,
    };
    let (proxy, _dir) = proxy_with(&upstream, &oauth, valid_creds(), breaker_cfg);

    for _ in 0..3 {
        let req = chat_request(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert!(proxy.chat(req).await.is_err());
    }
    // circuit now open: rejected with no further upstream traffic
    let req = chat_request(json!({"messages": [{"role": "user", "content": "hi"}]}));
    let err = proxy.chat(req).await.unwrap_err();
    assert!(matches!(err, ProxyError::Unavailable(_)));
    assert_eq!(upstream.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn upstream_401_triggers_refresh_and_single_retry() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer atk-valid"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer atk-refreshed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response_body()))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "atk-refreshed",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&oauth)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({"messages": [{"role": "user", "content": "hi"}]}));
    let resp = proxy.chat(req).await.unwrap();
    assert_eq!(resp["choices"][0]["message"]["content"], "Hello!");
}

#[tokio::test]
async fn resource_url_overrides_configured_upstream() {
    let configured = MockServer::start().await;
    let portal = MockServer::start().await;
    let oauth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response_body()))
        .expect(1)
        .mount(&portal)
        .await;

    let mut creds = valid_creds();
    creds.resource_url = Some(portal.uri());
    let (proxy, _dir) = proxy_with(
        &configured,
        &oauth,
        creds,
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({"messages": [{"role": "user", "content": "hi"}]}));
    proxy.chat(req).await.unwrap();
    assert!(configured.received_requests().await.unwrap().is_empty());
}

fn sse_body(frames: &[&str]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }
    body
}

fn content_frame(content: &str) -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "qwen-plus",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
    .to_string()
}

async fn collect_stream(mut rx: tokio::sync::mpsc::Receiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

fn stream_contents(frames: &[String]) -> String {
    frames
        .iter()
        .filter_map(|f| {
            let payload = f.strip_prefix("data: ")?.trim_end();
            let v: Value = serde_json::from_str(payload).ok()?;
            v["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}

#[tokio::test]
async fn chat_stream_collapses_stutter() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    let chunks: Vec<String> = ["He", "Hel", "Hell", "Hello", "Hello, world!"]
        .iter()
        .map(|c| content_frame(c))
        .collect();
    let mut frames: Vec<&str> = chunks.iter().map(String::as_str).collect();
    frames.push("[DONE]");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_raw(sse_body(&frames), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true
    }));
    let rx = proxy.chat_stream(req).await.unwrap();
    let emitted = collect_stream(rx).await;

    assert_eq!(stream_contents(&emitted), "Hello, world!");
    assert_eq!(emitted.last().map(String::as_str), Some("data: [DONE]\n\n"));
}

#[tokio::test]
async fn chat_stream_passes_clean_deltas_through() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    let chunks: Vec<String> = ["A", " B", " C"].iter().map(|c| content_frame(c)).collect();
    let mut frames: Vec<&str> = chunks.iter().map(String::as_str).collect();
    frames.push("[DONE]");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&frames), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true
    }));
    let rx = proxy.chat_stream(req).await.unwrap();
    let emitted = collect_stream(rx).await;

    assert_eq!(stream_contents(&emitted), "A B C");
    assert_eq!(emitted.last().map(String::as_str), Some("data: [DONE]\n\n"));
}

#[tokio::test]
async fn chat_stream_always_ends_with_done_even_without_upstream_done() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    let chunks: Vec<String> = ["Hi", "Hi there"].iter().map(|c| content_frame(c)).collect();
    let frames: Vec<&str> = chunks.iter().map(String::as_str).collect();
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&frames), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true
    }));
    let rx = proxy.chat_stream(req).await.unwrap();
    let emitted = collect_stream(rx).await;

    assert_eq!(stream_contents(&emitted), "Hi there");
    assert_eq!(emitted.last().map(String::as_str), Some("data: [DONE]\n\n"));
}

#[tokio::test]
async fn dropping_the_receiver_cancels_the_pump() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    // more frames than the channel holds, so the pump must block on send
    let chunks: Vec<String> = (0..100).map(|i| content_frame(&format!("c{} ", i))).collect();
    let frames: Vec<&str> = chunks.iter().map(String::as_str).collect();
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&frames), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req = chat_request(json!({
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true
    }));
    let mut rx = proxy.chat_stream(req).await.unwrap();
    let _first = rx.recv().await;
    drop(rx);
    // the pump notices the closed channel and exits without panicking
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn legacy_completion_adapts_and_reshapes() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response_body()))
        .expect(1)
        .mount(&upstream)
        .await;

    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let req: CompletionRequest =
        serde_json::from_value(json!({"prompt": "Hello", "stream": false})).unwrap();
    let resp = proxy.completion(req).await.unwrap();

    assert_eq!(resp["object"], "text_completion");
    assert_eq!(resp["choices"][0]["text"], "Hello!");
    assert_eq!(resp["choices"][0]["logprobs"], Value::Null);

    // internally adapted to a one-message chat request
    let sent = &upstream.received_requests().await.unwrap()[0];
    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "Hello");
}

#[tokio::test]
async fn models_come_from_configuration() {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    let (proxy, _dir) = proxy_with(
        &upstream,
        &oauth,
        valid_creds(),
        CircuitBreakerConfig::default(),
    );
    let models = proxy.models();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "qwen-plus");
}
