use crate::errors::{ProxyError, ProxyResult};
use crate::utils::atomic_write;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the persisted credential blob inside the configured qwen dir.
pub const CREDENTIALS_FILE: &str = "oauth_creds.json";

/// Injectable time source. Expiry arithmetic never reads the wall clock
/// directly so tests can advance time without sleeping.
pub trait Clock: Send + Sync {
    /// Milliseconds since the UNIX epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64)
    }
}

/// OAuth2 credentials as persisted and cached.
///
/// `access_token` and `refresh_token` are sensitive: the Debug impl redacts
/// them and [`Credentials::sanitized`] is the only view handed to HTTP
/// responses.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Absolute UNIX-ms moment at which the upstream declares the access
    /// token invalid. Zero means unknown and is treated as expired.
    #[serde(default)]
    pub expiry_date: i64,
    /// Per-account upstream base URL; overrides the configured default when
    /// present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credentials {
    /// `true` when the token is unusable now or will be within `buffer_ms`.
    pub fn is_expired(&self, now_ms: i64, buffer_ms: i64) -> bool {
        self.expiry_date == 0 || self.expiry_date <= now_ms + buffer_ms
    }

    pub fn sanitized(&self) -> CredentialsView {
        CredentialsView {
            token_type: self.token_type.clone(),
            expiry_date: self.expiry_date,
            resource_url: self.resource_url.clone(),
            has_token: !self.access_token.is_empty(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field(
                "access_token",
                &if self.access_token.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("token_type", &self.token_type)
            .field(
                "refresh_token",
                &if self.refresh_token.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("expiry_date", &self.expiry_date)
            .field("resource_url", &self.resource_url)
            .finish()
    }
}

/// Token-free view of the credentials, safe for health endpoints and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsView {
    pub token_type: String,
    pub expiry_date: i64,
    pub resource_url: Option<String>,
    pub has_token: bool,
}

/// Storage backend for the single process-wide credential record.
///
/// The file implementation is the production one; tests swap in an in-memory
/// store. Implementations are synchronous; callers on the async runtime go
/// through `spawn_blocking`.
pub trait CredentialStore: Send + Sync {
    /// Load the record. Fails with [`ProxyError::NotAuthenticated`] when no
    /// record exists; any other failure propagates.
    fn load(&self) -> ProxyResult<Credentials>;

    /// Replace the record atomically.
    fn save(&self, creds: &Credentials) -> ProxyResult<()>;
}

/// JSON blob at `{qwen_dir}/oauth_creds.json`, written atomically with mode
/// 0600.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> ProxyResult<Credentials> {
        if !self.path.exists() {
            return Err(ProxyError::NotAuthenticated);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials from {}", self.path.display()))?;
        let creds = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse credentials file {}", self.path.display())
        })?;
        Ok(creds)
    }

    fn save(&self, creds: &Credentials) -> ProxyResult<()> {
        let json = serde_json::to_string_pretty(creds).context("Failed to serialize credentials")?;
        atomic_write(&self.path, json.as_bytes())?;
        Ok(())
    }
}
