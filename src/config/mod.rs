//! Layered configuration: JSON config file plus `QWENGATE_*` environment
//! overrides, validated at startup.
//!
//! The file lives at `~/.qwengate/config.json` by default (override with the
//! `QWENGATE_CONFIG` env var). Every section has serde defaults so a partial
//! file works; the handful of required options (OAuth root, client id,
//! device-auth endpoint, upstream base URL, default model) are checked by
//! [`Config::validate`] and missing values abort startup with a
//! configuration error.

use crate::errors::{ProxyError, ProxyResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serialize durations as humantime strings ("5m", "30s") in the config file.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout", with = "duration_str")]
    pub read_timeout: Duration,
    #[serde(default = "default_http_timeout", with = "duration_str")]
    pub write_timeout: Duration,
    /// Grace period for in-flight requests during shutdown.
    #[serde(default = "default_shutdown_timeout", with = "duration_str")]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub tls_cert_file: String,
    #[serde(default)]
    pub tls_key_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout: default_http_timeout(),
            write_timeout: default_http_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            enable_tls: false,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
        }
    }
}

fn default_scope() -> String {
    "openid profile email model.completion".to_string()
}

fn default_qwen_dir() -> String {
    ".qwen".to_string()
}

fn default_refresh_buffer() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// OAuth root; the token endpoint is `{base_url}/oauth2/token`.
    #[serde(default)]
    pub base_url: String,
    /// Public device-flow client id.
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Full device-authorization endpoint URL.
    #[serde(default)]
    pub device_auth_url: String,
    /// Credential storage directory; relative values resolve under `$HOME`.
    /// The canonical credential file is `{qwen_dir}/oauth_creds.json`.
    #[serde(default = "default_qwen_dir")]
    pub qwen_dir: String,
    /// Tokens within this window of expiry are refreshed proactively.
    #[serde(default = "default_refresh_buffer", with = "duration_str")]
    pub token_refresh_buffer: Duration,
    /// Try to open a browser when a device flow starts. Disable on headless
    /// hosts; the verification URL is always logged either way.
    #[serde(default = "default_launch_browser")]
    pub launch_browser: bool,
}

fn default_launch_browser() -> bool {
    true
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: String::new(),
            scope: default_scope(),
            device_auth_url: String::new(),
            qwen_dir: default_qwen_dir(),
            token_refresh_buffer: default_refresh_buffer(),
            launch_browser: default_launch_browser(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Default upstream base URL, used unless the credentials carry a
    /// per-account `resource_url`.
    #[serde(default)]
    pub api_base_url: String,
    /// Model substituted when a request omits one. Required; there is no
    /// built-in fallback model.
    #[serde(default)]
    pub default_model: String,
    /// Models advertised by `GET /v1/models`. May be empty.
    #[serde(default)]
    pub models: Vec<String>,
    /// Overall timeout for non-streaming upstream calls.
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            default_model: String::new(),
            models: Vec::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_rps() -> u32 {
    10
}

fn default_burst() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rps")]
    pub rps: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            burst: default_burst(),
        }
    }
}

fn default_max_errors() -> u32 {
    10
}

fn default_buffer_size() -> usize {
    4096
}

fn default_stream_timeout() -> Duration {
    Duration::from_secs(900)
}

fn default_window_size() -> usize {
    5
}

fn default_similarity_threshold() -> f64 {
    0.8
}

fn default_time_window() -> Duration {
    Duration::from_secs(2)
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_length_target() -> f64 {
    10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Per-stream budget of malformed upstream frames before the stream is
    /// terminated with an error delta.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    /// SSE read buffer hint.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Overall deadline for one upstream stream.
    #[serde(default = "default_stream_timeout", with = "duration_str")]
    pub timeout: Duration,
    /// Stutter-detection content history length.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Window for inter-arrival timing analysis; history entries older than
    /// this are dropped.
    #[serde(default = "default_time_window", with = "duration_str")]
    pub time_window: Duration,
    /// Confidence at or above which a chunk is declared a stutter repeat.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Mean chunk length (in the history window) that counts as "normal
    /// flow" for the length-progression signal.
    #[serde(default = "default_length_target")]
    pub length_target: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
            buffer_size: default_buffer_size(),
            timeout: default_stream_timeout(),
            window_size: default_window_size(),
            similarity_threshold: default_similarity_threshold(),
            time_window: default_time_window(),
            min_confidence: default_min_confidence(),
            length_target: default_length_target(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub streaming: StreamingConfig,
    pub log: LogConfig,
}

/// Map `QWENGATE_*` env vars onto string config fields, allowing settings to
/// be injected without touching the config file (containers and CI).
macro_rules! env_overrides {
    ($config:ident; $( $env:literal => $($path:ident).+ );* $(;)?) => {
        $(
            if let Ok(val) = std::env::var($env) {
                if !val.is_empty() {
                    $config.$($path).+ = val;
                }
            }
        )*
    };
}

pub fn apply_env_overrides(config: &mut Config) {
    env_overrides!(config;
        "QWENGATE_SERVER_HOST"           => server.host;
        "QWENGATE_OAUTH_BASE_URL"        => oauth.base_url;
        "QWENGATE_OAUTH_CLIENT_ID"       => oauth.client_id;
        "QWENGATE_OAUTH_SCOPE"           => oauth.scope;
        "QWENGATE_OAUTH_DEVICE_AUTH_URL" => oauth.device_auth_url;
        "QWENGATE_QWEN_DIR"              => oauth.qwen_dir;
        "QWENGATE_API_BASE_URL"          => upstream.api_base_url;
        "QWENGATE_DEFAULT_MODEL"         => upstream.default_model;
        "QWENGATE_LOG_LEVEL"             => log.level;
    );
    if let Ok(val) = std::env::var("QWENGATE_SERVER_PORT")
        && let Ok(port) = val.parse()
    {
        config.server.port = port;
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("QWENGATE_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    Ok(dirs::home_dir()
        .context("Could not determine home directory")?
        .join(".qwengate")
        .join("config.json"))
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

impl Config {
    /// Check required options and numeric ranges. Called once at startup;
    /// failures are fatal with a non-zero exit.
    pub fn validate(&self) -> ProxyResult<()> {
        let required = [
            (self.oauth.base_url.as_str(), "oauth.base_url"),
            (self.oauth.client_id.as_str(), "oauth.client_id"),
            (self.oauth.device_auth_url.as_str(), "oauth.device_auth_url"),
            (self.upstream.api_base_url.as_str(), "upstream.api_base_url"),
            (self.upstream.default_model.as_str(), "upstream.default_model"),
        ];
        for (value, name) in required {
            if value.is_empty() {
                return Err(ProxyError::Config(format!("{} is required", name)));
            }
        }
        if self.server.enable_tls
            && (self.server.tls_cert_file.is_empty() || self.server.tls_key_file.is_empty())
        {
            return Err(ProxyError::Config(
                "enable_tls requires tls_cert_file and tls_key_file".into(),
            ));
        }
        if self.rate_limit.rps == 0 || self.rate_limit.burst == 0 {
            return Err(ProxyError::Config(
                "rate_limit.rps and rate_limit.burst must be positive".into(),
            ));
        }
        if self.streaming.window_size < 2 {
            return Err(ProxyError::Config(
                "streaming.window_size must be at least 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.streaming.min_confidence) {
            return Err(ProxyError::Config(
                "streaming.min_confidence must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
