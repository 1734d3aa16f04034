use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Typed error hierarchy for the proxy.
///
/// Use at module boundaries (token manager, upstream dispatch, request
/// validation, streaming). Internal/leaf functions can continue using
/// `anyhow::Result`; the `Internal` variant allows seamless conversion via
/// the `?` operator. The HTTP boundary maps each kind to a status code and a
/// public message; cause chains are logged, never sent to clients.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Upstream rejected credentials: {0}")]
    Authorization(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Streaming error: {0}")]
    Streaming(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unexpected upstream response: {0}")]
    External(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using ProxyError.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotAuthenticated | Self::Authorization(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Network(_) | Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Auth(_) | Self::Config(_) | Self::Streaming(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// OpenAI-style error type string for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::NotAuthenticated | Self::Auth(_) | Self::Authorization(_) => {
                "authentication_error"
            }
            Self::RateLimit { .. } => "rate_limit_error",
            Self::Unavailable(_) | Self::Network(_) | Self::External(_) | Self::Timeout(_) => {
                "service_unavailable_error"
            }
            Self::Config(_) | Self::Streaming(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to surface to clients. Never contains tokens, PKCE
    /// secrets, or raw upstream bodies; those stay in the log cause chain.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::NotAuthenticated => "not authenticated; complete the device flow first".into(),
            Self::Auth(_) => "authentication with the upstream service failed".into(),
            Self::Authorization(_) => "upstream rejected the proxy credentials".into(),
            Self::RateLimit { .. } => "rate limit exceeded".into(),
            Self::Unavailable(msg) => msg.clone(),
            Self::Timeout(_) => "the upstream request timed out".into(),
            Self::Network(_) | Self::External(_) => "upstream request failed".into(),
            Self::Config(_) | Self::Streaming(_) | Self::Internal(_) => {
                "internal server error".into()
            }
        }
    }

    /// Whether the operation may succeed if retried (used for log context,
    /// never for automatic upstream retries, which the circuit breaker owns).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::Unavailable(_) | Self::Network(_) | Self::Timeout(_)
        )
    }

    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.public_message(),
                "code": self.status_code().as_u16(),
            }
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            // "{:#}" propagates through the transparent Internal variant and
            // prints anyhow's full cause chain.
            tracing::error!("request failed: {:#}", self);
        } else {
            tracing::debug!("request rejected: {}", self);
        }
        let mut resp = (status, Json(self.body())).into_response();
        if let Self::RateLimit {
            retry_after: Some(secs),
        } = self
            && let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string())
        {
            resp.headers_mut().insert("Retry-After", value);
        }
        resp
    }
}
