//! Configuration loading and validation.
//!
//! `config.toml` holds everything except secrets. Secrets are referenced by
//! the NAME of the variable that holds them, and resolved from the private
//! `.env` file through [`crate::credentials`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::credentials::PlatformCredentialKeys;

/// Top-level configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// HTTP API settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// SQLite location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Vendor business API settings.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Device-pairing sidecar settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Platform-owned fallback sender.
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Send routing limits.
    #[serde(default)]
    pub router: RouterConfig,

    /// Bridge reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Log level and location.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Variable names of the platform secrets, for credential resolution.
    pub fn platform_credential_keys(&self) -> PlatformCredentialKeys<'_> {
        PlatformCredentialKeys {
            fallback_access_token: &self.fallback.access_token_env,
            fallback_phone_number_id: &self.fallback.phone_number_id_env,
            webhook_verify_token: &self.cloud.verify_token_env,
            webhook_app_secret: &self.cloud.app_secret_env,
            api_token: &self.server.api_token_env,
        }
    }

    /// Check values serde cannot: upstream origins must be http(s) URLs.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        check_origin("cloud.api_base", &self.cloud.api_base)?;
        check_origin("bridge.base_url", &self.bridge.base_url)?;
        Ok(())
    }
}

fn check_origin(setting: &str, value: &str) -> anyhow::Result<()> {
    let parsed = Url::parse(value)
        .map_err(|e| anyhow::anyhow!("{setting} is not a valid URL ({value}): {e}"))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(anyhow::anyhow!("{setting} must be an http(s) URL, got {value}")),
    }
}

/// HTTP API settings.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Variable holding the bearer token for `/v1`. Unset disables auth.
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_token_env: default_api_token_env(),
        }
    }
}

/// SQLite location.
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `whatsmux.db` in [`config_dir`].
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Vendor business API settings.
#[derive(Debug, Deserialize)]
pub struct CloudConfig {
    /// API origin.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// API version path segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Variable holding the webhook verification token.
    #[serde(default = "default_verify_token_env")]
    pub verify_token_env: String,

    /// Variable holding the app secret for webhook signatures.
    #[serde(default = "default_app_secret_env")]
    pub app_secret_env: String,

    /// Template sent to contacts that never wrote first.
    #[serde(default = "default_template")]
    pub default_template: String,

    /// Template language code.
    #[serde(default = "default_template_language")]
    pub template_language: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_version: default_api_version(),
            verify_token_env: default_verify_token_env(),
            app_secret_env: default_app_secret_env(),
            default_template: default_template(),
            template_language: default_template_language(),
        }
    }
}

/// Device-pairing sidecar settings.
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    /// Sidecar origin.
    #[serde(default = "default_bridge_url")]
    pub base_url: String,

    /// Long-poll window for bridge events.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl BridgeConfig {
    /// Long-poll window as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs.max(1))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

/// Platform-owned fallback sender.
#[derive(Debug, Deserialize)]
pub struct FallbackConfig {
    /// Variable holding the platform access token.
    #[serde(default = "default_fallback_token_env")]
    pub access_token_env: String,

    /// Variable holding the platform phone number id.
    #[serde(default = "default_fallback_number_env")]
    pub phone_number_id_env: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            access_token_env: default_fallback_token_env(),
            phone_number_id_env: default_fallback_number_env(),
        }
    }
}

/// Send routing limits.
#[derive(Debug, Deserialize)]
pub struct RouterConfig {
    /// Bound on one transport call.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Event channel capacity.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl RouterConfig {
    /// Send timeout as a duration.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs.max(1))
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Bridge reconnect policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// First delay.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Delay ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Random spread applied to each delay, as a fraction.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Attempts before giving up. 0 retries forever.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_attempts: 0,
        }
    }
}

/// Log level and location.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log directory. Defaults to `logs/` in [`config_dir`].
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

// Default value functions for serde

fn default_bind() -> String {
    "127.0.0.1:8080".to_owned()
}
fn default_api_token_env() -> String {
    "WHATSMUX_API_TOKEN".to_owned()
}
fn default_api_base() -> String {
    "https://graph.facebook.com".to_owned()
}
fn default_api_version() -> String {
    "v21.0".to_owned()
}
fn default_verify_token_env() -> String {
    "WHATSMUX_WEBHOOK_VERIFY_TOKEN".to_owned()
}
fn default_app_secret_env() -> String {
    "WHATSMUX_WEBHOOK_APP_SECRET".to_owned()
}
fn default_template() -> String {
    "hello_world".to_owned()
}
fn default_template_language() -> String {
    "en_US".to_owned()
}
fn default_bridge_url() -> String {
    "http://127.0.0.1:3001".to_owned()
}
fn default_poll_timeout_secs() -> u64 {
    60
}
fn default_fallback_token_env() -> String {
    "WHATSMUX_FALLBACK_ACCESS_TOKEN".to_owned()
}
fn default_fallback_number_env() -> String {
    "WHATSMUX_FALLBACK_PHONE_NUMBER_ID".to_owned()
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_event_buffer() -> usize {
    crate::events::DEFAULT_EVENT_BUFFER
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_log_level() -> String {
    "info".to_owned()
}

/// Load the config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load the config, or defaults when the file does not exist.
///
/// # Errors
///
/// Returns an error if an existing file cannot be read or parsed.
pub fn load_config_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        Ok(Config::default())
    }
}

/// Resolve the default config directory (`~/.whatsmux/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".whatsmux"))
}
