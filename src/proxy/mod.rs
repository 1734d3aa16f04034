//! The request path: validation, credential acquisition, circuit-breaker
//! gating, upstream dispatch, and (for streams) the sanitizer pump.

use crate::api::{self, ChatCompletionRequest, CompletionRequest, ModelInfo};
use crate::auth::{Credentials, TokenManager};
use crate::config::{Config, StreamingConfig};
use crate::errors::{ProxyError, ProxyResult};
use crate::streaming::scanner::encode_frame;
use crate::streaming::{SseScanner, StreamSanitizer};
use crate::upstream::circuit_breaker::CircuitBreaker;
use crate::upstream::{UpstreamClient, check_status};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Frames buffered between the sanitizer pump and the HTTP response body.
/// A slow client fills the channel and throttles upstream reads.
const STREAM_CHANNEL_CAPACITY: usize = 16;

pub struct ProxyService {
    config: Arc<Config>,
    tokens: Arc<TokenManager>,
    upstream: UpstreamClient,
    breaker: Arc<CircuitBreaker>,
}

impl ProxyService {
    pub fn new(
        config: Arc<Config>,
        tokens: Arc<TokenManager>,
        upstream: UpstreamClient,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            config,
            tokens,
            upstream,
            breaker,
        }
    }

    /// Static model listing from configuration; may be empty, never nil.
    pub fn models(&self) -> Vec<ModelInfo> {
        api::model_list(
            &self.config.upstream.models,
            chrono::Utc::now().timestamp(),
        )
    }

    /// Cached credentials without network activity.
    pub async fn authenticated(&self) -> ProxyResult<Credentials> {
        self.tokens.peek().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated().await
    }

    /// Force an interactive device authorization.
    pub async fn authenticate_interactive(&self) -> ProxyResult<Credentials> {
        self.tokens.begin_device_flow().await
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Non-streaming chat completion: fully materialized response.
    pub async fn chat(&self, mut req: ChatCompletionRequest) -> ProxyResult<Value> {
        self.prepare(&mut req)?;
        let payload = serde_json::to_value(&req)
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("request marshal: {}", e)))?;

        let resp = self
            .send_with_retry(&payload, self.config.upstream.request_timeout)
            .await?;
        resp.json()
            .await
            .map_err(|e| ProxyError::External(format!("unparseable upstream response: {}", e)))
    }

    /// Streaming chat completion. Returns a channel of encoded SSE frames;
    /// dropping the receiver (client disconnect) cancels the upstream
    /// request.
    pub async fn chat_stream(
        &self,
        mut req: ChatCompletionRequest,
    ) -> ProxyResult<mpsc::Receiver<String>> {
        self.prepare(&mut req)?;
        let payload = serde_json::to_value(&req)
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("request marshal: {}", e)))?;

        // Errors up to the upstream response arrive before any SSE bytes are
        // written, so they surface as plain HTTP error responses.
        let resp = self
            .send_with_retry(&payload, self.config.streaming.timeout)
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cfg = self.config.streaming.clone();
        tokio::spawn(pump_stream(resp, cfg, tx));
        Ok(rx)
    }

    /// Legacy text completion, adapted through the chat path.
    pub async fn completion(&self, req: CompletionRequest) -> ProxyResult<Value> {
        let chat_req = api::completion_to_chat(req)?;
        let chat_resp = self.chat(chat_req).await?;
        Ok(api::chat_response_to_completion(&chat_resp))
    }

    /// Legacy streaming completion: mirrors the chat stream after the
    /// adapter.
    pub async fn completion_stream(
        &self,
        req: CompletionRequest,
    ) -> ProxyResult<mpsc::Receiver<String>> {
        let chat_req = api::completion_to_chat(req)?;
        self.chat_stream(chat_req).await
    }

    /// Default-model substitution + request validation.
    fn prepare(&self, req: &mut ChatCompletionRequest) -> ProxyResult<()> {
        if req.model.as_deref().is_none_or(str::is_empty) {
            req.model = Some(self.config.upstream.default_model.clone());
        }
        api::validate_chat_request(req)
    }

    /// Acquire credentials, gate on the breaker, dispatch, and retry once
    /// after a forced refresh when the upstream rejects the bearer.
    async fn send_with_retry(
        &self,
        payload: &Value,
        timeout: Duration,
    ) -> ProxyResult<reqwest::Response> {
        let creds = self.tokens.ensure_valid().await?;
        self.breaker.try_acquire().await?;

        let resp = self.dispatch(&creds, payload, timeout).await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED && !creds.refresh_token.is_empty() {
            info!("upstream returned 401, refreshing token and retrying once");
            self.tokens.invalidate().await;
            let creds = self.tokens.ensure_valid().await?;
            let resp = self.dispatch(&creds, payload, timeout).await?;
            return self.settle(resp).await;
        }
        self.settle(resp).await
    }

    async fn dispatch(
        &self,
        creds: &Credentials,
        payload: &Value,
        timeout: Duration,
    ) -> ProxyResult<reqwest::Response> {
        let base = self.upstream.resolve_base_url(creds.resource_url.as_deref());
        match self
            .upstream
            .chat_completions(&base, &creds.access_token, payload, timeout)
            .await
        {
            Ok(resp) => Ok(resp),
            Err(e) => {
                // transport failures count against the circuit
                self.breaker.record_failure().await;
                Err(e)
            }
        }
    }

    /// Map the response status and report the outcome to the breaker: 2xx
    /// succeeds, 5xx fails, client errors are the caller's problem and leave
    /// the circuit alone.
    async fn settle(&self, resp: reqwest::Response) -> ProxyResult<reqwest::Response> {
        match check_status(resp) {
            Ok(resp) => {
                self.breaker.record_success().await;
                Ok(resp)
            }
            Err(e) => {
                if matches!(e, ProxyError::Unavailable(_)) {
                    self.breaker.record_failure().await;
                }
                Err(e)
            }
        }
    }
}

/// Read the upstream SSE body, run it through the sanitizer, and forward
/// encoded frames into the response channel. Send failures mean the client
/// went away: the loop returns, dropping (and thereby aborting) the
/// upstream request.
async fn pump_stream(
    resp: reqwest::Response,
    cfg: StreamingConfig,
    tx: mpsc::Sender<String>,
) {
    let mut scanner = SseScanner::with_capacity(cfg.buffer_size);
    let mut sanitizer = StreamSanitizer::new(&cfg);
    let mut body = resp.bytes_stream();
    let deadline = Instant::now() + cfg.timeout;

    loop {
        let read = tokio::select! {
            biased;
            () = tx.closed() => {
                info!("client disconnected, cancelling upstream stream");
                return;
            }
            read = tokio::time::timeout_at(deadline, body.next()) => read,
        };

        match read {
            Err(_) => {
                warn!("upstream stream exceeded {:?} deadline", cfg.timeout);
                drain(&mut scanner, &mut sanitizer, &tx).await;
                return;
            }
            Ok(None) => {
                debug!("upstream stream closed");
                drain(&mut scanner, &mut sanitizer, &tx).await;
                return;
            }
            Ok(Some(Err(e))) => {
                warn!("upstream stream read failed: {}", e);
                drain(&mut scanner, &mut sanitizer, &tx).await;
                return;
            }
            Ok(Some(Ok(bytes))) => {
                for frame in scanner.feed(&bytes) {
                    for out in sanitizer.push(&frame, std::time::Instant::now()) {
                        if tx.send(encode_frame(&out)).await.is_err() {
                            info!("client disconnected, cancelling upstream stream");
                            return;
                        }
                    }
                }
                if sanitizer.is_terminated() {
                    return;
                }
            }
        }
    }
}

/// Flush any partial frame and the sanitizer's terminal frames so the
/// client always sees a well-formed stream end.
async fn drain(scanner: &mut SseScanner, sanitizer: &mut StreamSanitizer, tx: &mpsc::Sender<String>) {
    let mut outs = Vec::new();
    if let Some(frame) = scanner.finish() {
        outs.extend(sanitizer.push(&frame, std::time::Instant::now()));
    }
    outs.extend(sanitizer.finish());
    for out in outs {
        if tx.send(encode_frame(&out)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests;
