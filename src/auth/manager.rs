use crate::auth::credentials::{Clock, CredentialStore, Credentials};
use crate::auth::oauth::{OAuthClient, TokenGrant, announce_device_authorization, pkce_pair};
use crate::errors::{ProxyError, ProxyResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Owns the single process-wide credential record.
///
/// Two locks with distinct jobs: the `cache` reader/writer lock guards the
/// small in-memory copy (and the store I/O behind it), while the `refresh`
/// mutex serializes the expensive token-endpoint work so that any number of
/// concurrent expired callers produce exactly one network refresh
/// (single-flight). Collapsing them would serialize every read.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    oauth: OAuthClient,
    cache: RwLock<Option<Credentials>>,
    refresh: Mutex<()>,
    refresh_buffer_ms: i64,
    clock: Arc<dyn Clock>,
    launch_browser: bool,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        oauth: OAuthClient,
        refresh_buffer: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            oauth,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
            refresh_buffer_ms: refresh_buffer.as_millis() as i64,
            clock,
            launch_browser: true,
        }
    }

    /// Disable the browser launch during device flows (headless hosts,
    /// tests).
    pub fn with_browser_launch(mut self, enabled: bool) -> Self {
        self.launch_browser = enabled;
        self
    }

    /// Return credentials that are valid beyond the refresh buffer,
    /// refreshing or running the device flow as needed. Safe to call from
    /// any number of request handlers concurrently.
    pub async fn ensure_valid(&self) -> ProxyResult<Credentials> {
        match self.current().await {
            Ok(creds) if self.usable(&creds) => return Ok(creds),
            Ok(_) | Err(ProxyError::NotAuthenticated) => {}
            Err(e) => return Err(e),
        }

        // Single-flight: one caller does the network work, the rest queue
        // here and pick up the fresh record on re-check.
        let _flight = self.refresh.lock().await;
        let stale = match self.current().await {
            Ok(creds) if self.usable(&creds) => return Ok(creds),
            Ok(creds) => Some(creds),
            Err(ProxyError::NotAuthenticated) => None,
            Err(e) => return Err(e),
        };

        if let Some(prev) = stale
            && !prev.refresh_token.is_empty()
        {
            match self.oauth.refresh(&prev.refresh_token).await {
                Ok(grant) => {
                    info!("OAuth access token refreshed");
                    return self.install(grant, &prev).await;
                }
                Err(e) => {
                    warn!("token refresh failed, falling back to device flow: {}", e);
                }
            }
        }

        self.device_flow_locked().await
    }

    /// Force an interactive device authorization even when cached
    /// credentials exist (administrative operation).
    pub async fn begin_device_flow(&self) -> ProxyResult<Credentials> {
        let _flight = self.refresh.lock().await;
        self.device_flow_locked().await
    }

    /// Cached credentials without any network activity. Fails with
    /// *NotAuthenticated* when no record exists.
    pub async fn peek(&self) -> ProxyResult<Credentials> {
        self.current().await
    }

    /// Mark the cached access token stale so the next `ensure_valid` call
    /// refreshes. Used when the upstream rejects a bearer that still looked
    /// valid locally (clock skew, server-side revocation).
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        if let Some(creds) = cache.as_mut() {
            creds.expiry_date = 0;
        }
    }

    /// Whether the peeked credentials are currently usable (no network).
    pub async fn is_authenticated(&self) -> bool {
        match self.current().await {
            Ok(creds) => self.usable(&creds),
            Err(_) => false,
        }
    }

    fn usable(&self, creds: &Credentials) -> bool {
        !creds.access_token.is_empty()
            && !creds.is_expired(self.clock.now_ms(), self.refresh_buffer_ms)
    }

    /// Cache, falling back to the store. Loads populate the cache so later
    /// reads stay in memory.
    async fn current(&self) -> ProxyResult<Credentials> {
        if let Some(creds) = self.cache.read().await.clone() {
            return Ok(creds);
        }
        let mut cache = self.cache.write().await;
        if let Some(creds) = cache.clone() {
            return Ok(creds);
        }
        let store = self.store.clone();
        let creds = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("credential load task: {}", e)))??;
        *cache = Some(creds.clone());
        Ok(creds)
    }

    /// Runs the interactive flow. Caller must hold the refresh mutex.
    async fn device_flow_locked(&self) -> ProxyResult<Credentials> {
        let (verifier, challenge) = pkce_pair();
        let auth = self.oauth.request_device_authorization(&challenge).await?;
        info!(
            "device authorization started, waiting for approval (expires in {}s)",
            auth.expires_in
        );
        if self.launch_browser {
            announce_device_authorization(&auth);
        } else {
            info!(
                "complete authentication at {} (code: {})",
                auth.display_uri(),
                auth.user_code
            );
        }
        let grant = self.oauth.poll_device_token(&auth, &verifier).await?;
        info!("device authorization complete");
        let fresh = self.credentials_from(grant, None);
        self.persist(fresh).await
    }

    /// Convert a grant, persist atomically, and publish to the cache.
    async fn install(&self, grant: TokenGrant, previous: &Credentials) -> ProxyResult<Credentials> {
        let fresh = self.credentials_from(grant, Some(previous));
        self.persist(fresh).await
    }

    fn credentials_from(&self, grant: TokenGrant, previous: Option<&Credentials>) -> Credentials {
        Credentials {
            access_token: grant.access_token,
            token_type: grant.token_type,
            // The server may rotate the refresh token; keep the old one when
            // it does not.
            refresh_token: grant
                .refresh_token
                .filter(|t| !t.is_empty())
                .or_else(|| previous.map(|p| p.refresh_token.clone()))
                .unwrap_or_default(),
            expiry_date: self.clock.now_ms() + 1000 * grant.expires_in as i64,
            resource_url: grant
                .resource_url
                .or_else(|| previous.and_then(|p| p.resource_url.clone())),
        }
    }

    async fn persist(&self, creds: Credentials) -> ProxyResult<Credentials> {
        let store = self.store.clone();
        let to_save = creds.clone();
        tokio::task::spawn_blocking(move || store.save(&to_save))
            .await
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("credential save task: {}", e)))??;
        *self.cache.write().await = Some(creds.clone());
        Ok(creds)
    }
}
