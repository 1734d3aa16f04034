// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use qwengate::auth::Credentials;
use qwengate::auth::credentials::{CREDENTIALS_FILE, FileStore};
use qwengate::config::Config;
use qwengate::server::{build_router, build_state};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::MockServer;

pub const FAR_FUTURE_MS: i64 = 4_102_444_800_000; // 2100-01-01

/// A full proxy wired against mock upstream and OAuth servers, with its
/// credential store in a temp dir.
pub struct Harness {
    pub router: Router,
    pub upstream: MockServer,
    pub oauth: MockServer,
    pub dir: TempDir,
}

pub async fn harness() -> Harness {
    let upstream = MockServer::start().await;
    let oauth = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let mut config = Config::default();
    config.oauth.base_url = oauth.uri();
    config.oauth.client_id = "client-123".into();
    config.oauth.device_auth_url = format!("{}/oauth2/device/code", oauth.uri());
    config.oauth.qwen_dir = dir.path().to_string_lossy().into_owned();
    config.oauth.launch_browser = false;
    config.upstream.api_base_url = upstream.uri();
    config.upstream.default_model = "qwen-plus".into();
    config.upstream.models = vec!["qwen-plus".into()];
    // keep the client rate limiter out of the way of concurrency tests
    config.rate_limit.rps = 1000;
    config.rate_limit.burst = 1000;
    config.validate().unwrap();

    let state = build_state(config).unwrap();
    Harness {
        router: build_router(state),
        upstream,
        oauth,
        dir,
    }
}

impl Harness {
    /// Seed the credential file. `expiry_ms` in UNIX ms; refresh_token kept.
    pub fn seed_credentials(&self, access_token: &str, expiry_ms: i64) {
        seed_credentials_file(&self.dir, access_token, expiry_ms);
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let resp = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.post_raw(uri, body).await;
        let status = resp.status();
        let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    pub async fn post_raw(&self, uri: &str, body: Value) -> axum::http::Response<Body> {
        self.router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    /// POST and collect the whole SSE body as text.
    pub async fn post_sse(&self, uri: &str, body: Value) -> (StatusCode, String) {
        let resp = self.post_raw(uri, body).await;
        let status = resp.status();
        let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }
}

pub fn seed_credentials_file(dir: &TempDir, access_token: &str, expiry_ms: i64) {
    use qwengate::auth::credentials::CredentialStore as _;
    let store = FileStore::new(dir.path());
    store
        .save(&Credentials {
            access_token: access_token.into(),
            token_type: "Bearer".into(),
            refresh_token: "rtk-seed".into(),
            expiry_date: expiry_ms,
            resource_url: None,
        })
        .unwrap();
}

pub fn chat_body(content: &str) -> Value {
    json!({"messages": [{"role": "user", "content": content}]})
}

pub fn chat_response(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "qwen-plus",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

pub fn content_chunk(content: &str) -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "qwen-plus",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
    .to_string()
}

/// Assemble an SSE body out of raw frame payloads.
pub fn sse_body(frames: &[&str]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }
    body
}

/// Pull the delta contents back out of a sanitized SSE body.
pub fn sse_contents(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| {
            let payload = frame.strip_prefix("data: ")?;
            let v: Value = serde_json::from_str(payload).ok()?;
            v["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}
