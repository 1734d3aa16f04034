use crate::config::OAuthConfig;
use crate::errors::{ProxyError, ProxyResult};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Overall deadline for one device-authorization attempt.
const DEVICE_FLOW_DEADLINE_SECS: u64 = 600;

/// RFC 8628 device grant type.
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Seconds added to the poll interval on `slow_down`.
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Generate a PKCE verifier/challenge pair (RFC 7636, S256).
///
/// The verifier lives only for the duration of one device-flow attempt and
/// is never persisted or logged.
pub(crate) fn pkce_pair() -> (String, String) {
    let mut bytes = [0u8; 32];
    let mut rng = fastrand::Rng::new();
    rng.fill(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(digest);
    (verifier, challenge)
}

/// Response from the device-authorization endpoint (RFC 8628 §3.2).
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

impl DeviceAuthorization {
    /// Best URL to show the operator (pre-filled with the user code when the
    /// server provides one).
    pub fn display_uri(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

/// A successful token-endpoint response, before expiry arithmetic.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub resource_url: Option<String>,
}

/// Raw token-endpoint wire shape: success and error fields share one body.
#[derive(Debug, Deserialize)]
struct TokenWire {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    resource_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenWire {
    fn into_grant(self) -> ProxyResult<TokenGrant> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProxyError::External("token response missing access_token".into()))?;
        let expires_in = self
            .expires_in
            .ok_or_else(|| ProxyError::External("token response missing expires_in".into()))?;
        Ok(TokenGrant {
            access_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: self.refresh_token,
            expires_in,
            resource_url: self.resource_url,
        })
    }
}

/// HTTP client for the OAuth server: refresh grant and device-authorization
/// grant. Stateless apart from endpoint configuration; the token manager
/// owns sequencing and persistence.
pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
    device_auth_url: String,
    client_id: String,
    scope: String,
}

impl OAuthClient {
    pub fn new(cfg: &OAuthConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build OAuth HTTP client: {}", e))?;
        Ok(Self {
            http,
            token_url: format!("{}/oauth2/token", cfg.base_url.trim_end_matches('/')),
            device_auth_url: cfg.device_auth_url.clone(),
            client_id: cfg.client_id.clone(),
            scope: cfg.scope.clone(),
        })
    }

    /// `grant_type=refresh_token` exchange. Any non-200 status or `error`
    /// body field fails with an auth error; the caller decides whether to
    /// fall back to the device flow.
    pub async fn refresh(&self, refresh_token: &str) -> ProxyResult<TokenGrant> {
        debug!("refreshing OAuth access token");
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
            ])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProxyError::Network(format!("token endpoint unreachable: {}", e)))?;

        let status = resp.status();
        let wire: TokenWire = resp
            .json()
            .await
            .map_err(|e| ProxyError::Auth(format!("unparseable refresh response: {}", e)))?;

        if let Some(error) = wire.error {
            return Err(ProxyError::Auth(format!(
                "refresh rejected: {}: {}",
                error,
                wire.error_description.unwrap_or_default()
            )));
        }
        if status != reqwest::StatusCode::OK {
            return Err(ProxyError::Auth(format!(
                "refresh failed with HTTP {}",
                status
            )));
        }
        wire.into_grant()
    }

    /// Start a device-authorization flow (RFC 8628 §3.1).
    pub async fn request_device_authorization(
        &self,
        code_challenge: &str,
    ) -> ProxyResult<DeviceAuthorization> {
        let resp = self
            .http
            .post(&self.device_auth_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", self.scope.as_str()),
                ("code_challenge", code_challenge),
                ("code_challenge_method", "S256"),
            ])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProxyError::Network(format!("device-auth endpoint unreachable: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProxyError::Auth(format!(
                "device authorization request failed with HTTP {}",
                status
            )));
        }
        let auth: DeviceAuthorization = resp
            .json()
            .await
            .map_err(|e| ProxyError::External(format!("bad device-auth response: {}", e)))?;
        Ok(auth)
    }

    /// Poll the token endpoint until the user approves, a terminal protocol
    /// error arrives, or the deadline passes. Cancel-safe: dropping the
    /// future between polls aborts the flow cleanly.
    pub async fn poll_device_token(
        &self,
        auth: &DeviceAuthorization,
        code_verifier: &str,
    ) -> ProxyResult<TokenGrant> {
        let budget = auth.expires_in.min(DEVICE_FLOW_DEADLINE_SECS);
        let deadline = Instant::now() + Duration::from_secs(budget);
        let mut interval = auth.interval;

        loop {
            if Instant::now() >= deadline {
                return Err(ProxyError::Timeout(
                    "device authorization was not completed in time".into(),
                ));
            }

            let resp = self
                .http
                .post(&self.token_url)
                .form(&[
                    ("grant_type", DEVICE_GRANT_TYPE),
                    ("device_code", auth.device_code.as_str()),
                    ("client_id", self.client_id.as_str()),
                    ("code_verifier", code_verifier),
                ])
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| ProxyError::Network(format!("token endpoint unreachable: {}", e)))?;

            // RFC 8628 delivers poll outcomes as error codes on HTTP 400, so
            // the body is decoded regardless of status.
            let wire: TokenWire = resp
                .json()
                .await
                .map_err(|e| ProxyError::External(format!("bad token response: {}", e)))?;

            match wire.error.as_deref() {
                None => return wire.into_grant(),
                Some("authorization_pending") => {
                    debug!("device authorization pending, polling again in {}s", interval);
                }
                Some("slow_down") => {
                    interval += SLOW_DOWN_STEP_SECS;
                    warn!("OAuth server asked to slow down, interval now {}s", interval);
                }
                Some("expired_token") => {
                    return Err(ProxyError::Auth("device code expired".into()));
                }
                Some("access_denied") => {
                    return Err(ProxyError::Auth(
                        "authorization was denied by the user".into(),
                    ));
                }
                Some(other) => {
                    return Err(ProxyError::Auth(format!(
                        "device authorization failed: {}: {}",
                        other,
                        wire.error_description.unwrap_or_default()
                    )));
                }
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }
}

/// Show the verification URL and user code to the operator and try to open a
/// browser. Browser failures are never fatal.
pub(crate) fn announce_device_authorization(auth: &DeviceAuthorization) {
    info!(
        "complete authentication at {} (code: {})",
        auth.display_uri(),
        auth.user_code
    );
    if let Err(e) = open::that(auth.display_uri()) {
        debug!("could not open browser automatically: {}", e);
    }
}
