//! HTTP surface: the axum router, cross-cutting middleware (request ids,
//! security headers, rate limiting), and the serve loop with graceful
//! drain and optional TLS.

use crate::api::{ChatCompletionRequest, CompletionRequest};
use crate::auth::credentials::{FileStore, SystemClock};
use crate::auth::{OAuthClient, TokenManager};
use crate::config::Config;
use crate::errors::ProxyError;
use crate::proxy::ProxyService;
use crate::upstream::UpstreamClient;
use crate::upstream::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::utils;
use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use governor::{Quota, RateLimiter};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

type DirectRateLimiter = governor::DefaultDirectRateLimiter;

/// Shared state between HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub proxy: Arc<ProxyService>,
    limiter: Arc<DirectRateLimiter>,
    started_at: Instant,
}

/// Per-request correlation id, set by middleware and echoed in the
/// `X-Request-ID` response header.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Wire the credential store, token manager, upstream client, breaker, and
/// rate limiter together.
pub fn build_state(config: Config) -> Result<AppState> {
    let config = Arc::new(config);

    let qwen_dir = utils::resolve_home_dir(&config.oauth.qwen_dir)?;
    utils::ensure_dir(&qwen_dir)?;
    let store = Arc::new(FileStore::new(&qwen_dir));
    let tokens = Arc::new(
        TokenManager::new(
            store,
            OAuthClient::new(&config.oauth)?,
            config.oauth.token_refresh_buffer,
            Arc::new(SystemClock),
        )
        .with_browser_launch(config.oauth.launch_browser),
    );
    let upstream = UpstreamClient::new(&config.upstream)?;
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let proxy = Arc::new(ProxyService::new(
        config.clone(),
        tokens,
        upstream,
        breaker,
    ));

    let rps = NonZeroU32::new(config.rate_limit.rps).context("rate_limit.rps must be positive")?;
    let burst =
        NonZeroU32::new(config.rate_limit.burst).context("rate_limit.burst must be positive")?;
    let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps).allow_burst(burst)));

    Ok(AppState {
        config,
        proxy,
        limiter,
        started_at: Instant::now(),
    })
}

/// Build the HTTP API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/health/detailed", get(health_detailed_handler))
        .route("/auth", get(auth_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/completions", post(completions_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            deadline_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Serve until a shutdown signal arrives, then drain in-flight requests for
/// up to `shutdown_timeout` before forcing the close.
pub async fn run(config: Config) -> Result<()> {
    let state = build_state(config)?;
    let app = build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address {}:{}",
                state.config.server.host, state.config.server.port
            )
        })?;

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_watcher(
        handle.clone(),
        state.config.server.shutdown_timeout,
    ));

    if state.config.server.enable_tls {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &state.config.server.tls_cert_file,
            &state.config.server.tls_key_file,
        )
        .await
        .context("failed to load TLS certificate or key")?;
        info!("qwengate listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("server failed to bind or serve")?;
    } else {
        info!("qwengate listening on http://{}", addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("server failed to bind or serve")?;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_watcher(handle: axum_server::Handle, grace: Duration) {
    wait_for_signal().await;
    info!(
        "shutdown signal received, draining in-flight requests for up to {:?}",
        grace
    );
    handle.graceful_shutdown(Some(grace));
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Attach a request id, log the request, and stamp the common response
/// headers (correlation id + security headers).
async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let started = Instant::now();
    let mut resp = next.run(req).await;
    info!(
        "{} {} -> {} ({}ms) request_id={}",
        method,
        path,
        resp.status().as_u16(),
        started.elapsed().as_millis(),
        request_id
    );

    let headers = resp.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("X-Request-ID", value);
    }
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "X-XSS-Protection",
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=31536000"),
    );
    resp
}

/// Token-bucket rate limit on the API routes. Health and auth endpoints
/// stay reachable for monitoring.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if req.uri().path().starts_with("/v1") {
        if let Err(not_until) = state.limiter.check() {
            let wait = not_until.wait_time_from(governor::clock::Clock::now(
                &governor::clock::DefaultClock::default(),
            ));
            return ProxyError::RateLimit {
                retry_after: Some(wait.as_secs().max(1)),
            }
            .into_response();
        }
    }
    next.run(req).await
}

/// Bound request handling by the configured read+write timeouts. The
/// completion endpoints are exempt: streams run under `streaming.timeout`
/// and non-streaming proxying under `upstream.request_timeout`.
async fn deadline_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/v1/chat/completions" || path == "/v1/completions" {
        return next.run(req).await;
    }
    let deadline = state.config.server.read_timeout + state.config.server.write_timeout;
    match tokio::time::timeout(deadline, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => {
            ProxyError::Timeout("request exceeded the server timeout".into()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root_handler() -> Json<Value> {
    Json(json!({"message": "qwengate proxy is running"}))
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn health_detailed_handler(
    State(state): State<AppState>,
    req: Request,
) -> Json<Value> {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let authenticated = state.proxy.is_authenticated().await;
    let auth_info = state
        .proxy
        .authenticated()
        .await
        .ok()
        .map(|creds| creds.sanitized());

    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs(),
        "request_id": request_id,
        "config": {
            "server_host": state.config.server.host,
            "server_port": state.config.server.port,
            "api_base_url": state.config.upstream.api_base_url,
            "default_model": state.config.upstream.default_model,
            "rate_limit_rps": state.config.rate_limit.rps,
            "streaming_max_errors": state.config.streaming.max_errors,
        },
        "auth_status": if authenticated { "authenticated" } else { "not_authenticated" },
        "auth_info": auth_info,
        "circuit_breaker": state.proxy.breaker().phase_name().await,
    }))
}

/// Report credential status, or kick off a device flow when none exist.
/// The flow runs in the background; the operator completes it in a browser
/// while this endpoint returns immediately.
async fn auth_handler(State(state): State<AppState>) -> Response {
    match state.proxy.authenticated().await {
        Ok(creds) => Json(json!({
            "authenticated": true,
            "message": "credentials are present",
            "resource_url": creds.resource_url,
        }))
        .into_response(),
        Err(ProxyError::NotAuthenticated) => {
            let proxy = state.proxy.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.authenticate_interactive().await {
                    error!("background device flow failed: {}", e);
                }
            });
            Json(json!({
                "authenticated": false,
                "message": "device authorization started, complete it in the browser",
                "status": "authentication_initiated",
            }))
            .into_response()
        }
        Err(e) => {
            warn!("credential inspection failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "authenticated": false,
                    "error": e.body()["error"],
                })),
            )
                .into_response()
        }
    }
}

async fn models_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": state.proxy.models(),
    }))
}

async fn chat_completions_handler(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Response, ProxyError> {
    let req: ChatCompletionRequest = serde_json::from_value(raw)
        .map_err(|e| ProxyError::Validation(format!("malformed chat request: {}", e)))?;

    if req.is_stream() {
        let rx = state.proxy.chat_stream(req).await?;
        Ok(sse_response(rx))
    } else {
        let resp = state.proxy.chat(req).await?;
        Ok(Json(resp).into_response())
    }
}

async fn completions_handler(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Response, ProxyError> {
    let req: CompletionRequest = serde_json::from_value(raw)
        .map_err(|e| ProxyError::Validation(format!("malformed completion request: {}", e)))?;

    if req.stream.unwrap_or(false) {
        let rx = state.proxy.completion_stream(req).await?;
        Ok(sse_response(rx))
    } else {
        let resp = state.proxy.completion(req).await?;
        Ok(Json(resp).into_response())
    }
}

/// Wrap the sanitizer's frame channel as an SSE response body. Each channel
/// item is one complete `data: ...\n\n` frame, so every send reaches the
/// client as its own flushed chunk.
fn sse_response(rx: tokio::sync::mpsc::Receiver<String>) -> Response {
    let stream =
        ReceiverStream::new(rx).map(|frame| Ok::<_, std::convert::Infallible>(Bytes::from(frame)));
    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    resp
}
