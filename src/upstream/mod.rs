//! HTTP client for the upstream chat backend: pooled connections, bearer
//! injection, and base-URL normalization (credentials may carry a
//! per-account `resource_url` that overrides the configured default).

pub mod circuit_breaker;

use crate::config::UpstreamConfig;
use crate::errors::{ProxyError, ProxyResult};
use serde_json::Value;
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Ensure a scheme (default `https://`) and a `/v1` suffix.
pub fn normalize_base_url(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if !base.contains("://") {
        base = format!("https://{}", base);
    }
    if !base.ends_with("/v1") {
        base.push_str("/v1");
    }
    base
}

pub struct UpstreamClient {
    http: reqwest::Client,
    api_base_url: String,
}

impl UpstreamClient {
    /// No overall client timeout, since streams run long. Callers pass a
    /// per-request deadline instead.
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        if !cfg.api_base_url.is_empty() {
            let normalized = normalize_base_url(&cfg.api_base_url);
            url::Url::parse(&normalized)
                .map_err(|e| anyhow::anyhow!("invalid api_base_url {:?}: {}", cfg.api_base_url, e))?;
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build upstream HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_base_url: cfg.api_base_url.clone(),
        })
    }

    /// Credentials' `resource_url` wins over the configured default.
    pub fn resolve_base_url(&self, resource_url: Option<&str>) -> String {
        let raw = match resource_url {
            Some(url) if !url.is_empty() => url,
            _ => self.api_base_url.as_str(),
        };
        normalize_base_url(raw)
    }

    /// `POST {base}/chat/completions` with a bearer token. Transport errors
    /// map to *Network*; HTTP status handling is the caller's job so the
    /// streaming path can keep the response body.
    pub async fn chat_completions(
        &self,
        base_url: &str,
        access_token: &str,
        payload: &Value,
        timeout: Duration,
    ) -> ProxyResult<reqwest::Response> {
        let url = format!("{}/chat/completions", base_url);
        self.http
            .post(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::Timeout(format!("upstream request timed out: {}", e))
                } else {
                    ProxyError::Network(format!("upstream unreachable: {}", e))
                }
            })
    }
}

/// Map a non-success upstream status to the proxy error taxonomy. The
/// response body is logged by callers, never surfaced to clients.
pub fn check_status(resp: reqwest::Response) -> ProxyResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    Err(match status.as_u16() {
        401 | 403 => ProxyError::Authorization(format!("upstream returned HTTP {}", status)),
        429 => {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            ProxyError::RateLimit { retry_after }
        }
        code if code >= 500 => {
            ProxyError::Unavailable(format!("upstream returned HTTP {}", status))
        }
        _ => ProxyError::External(format!("upstream returned HTTP {}", status)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_scheme_and_suffix() {
        assert_eq!(
            normalize_base_url("portal.qwen.ai"),
            "https://portal.qwen.ai/v1"
        );
    }

    #[test]
    fn normalize_keeps_existing_scheme() {
        assert_eq!(
            normalize_base_url("http://localhost:8000"),
            "http://localhost:8000/v1"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        assert_eq!(
            normalize_base_url("https://portal.qwen.ai/v1"),
            "https://portal.qwen.ai/v1"
        );
    }

    #[test]
    fn normalize_strips_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://portal.qwen.ai/"),
            "https://portal.qwen.ai/v1"
        );
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let cfg = UpstreamConfig {
            api_base_url: "http://[bad".into(),
            ..UpstreamConfig::default()
        };
        assert!(UpstreamClient::new(&cfg).is_err());
    }

    #[test]
    fn resource_url_overrides_configured_base() {
        let cfg = UpstreamConfig {
            api_base_url: "https://default.example.com".into(),
            ..UpstreamConfig::default()
        };
        let client = UpstreamClient::new(&cfg).unwrap();
        assert_eq!(
            client.resolve_base_url(Some("portal.qwen.ai")),
            "https://portal.qwen.ai/v1"
        );
        assert_eq!(
            client.resolve_base_url(None),
            "https://default.example.com/v1"
        );
        // empty resource_url falls back too
        assert_eq!(
            client.resolve_base_url(Some("")),
            "https://default.example.com/v1"
        );
    }

    #[tokio::test]
    async fn check_status_maps_upstream_codes() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let resp = reqwest::get(server.uri()).await.unwrap();
        match check_status(resp).unwrap_err() {
            ProxyError::RateLimit { retry_after } => assert_eq!(retry_after, Some(7)),
            other => panic!("expected RateLimit, got {:?}", other),
        }

        let resp = reqwest::get(server.uri()).await.unwrap();
        assert!(matches!(
            check_status(resp).unwrap_err(),
            ProxyError::Unavailable(_)
        ));

        let resp = reqwest::get(server.uri()).await.unwrap();
        assert!(matches!(
            check_status(resp).unwrap_err(),
            ProxyError::Authorization(_)
        ));
    }
}
