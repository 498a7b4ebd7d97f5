//! Client Configuration
//!
//! Where the backend lives and how replies are requested.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! The file lives at `$XDG_CONFIG_HOME/review-chat/config.toml` (typically
//! `~/.config/review-chat/config.toml`).
//!
//! # Example Configuration
//!
//! ```toml
//! [api]
//! base_url = "https://review.example.com"
//! request_timeout_ms = 60000
//! connect_timeout_ms = 5000
//!
//! [stream]
//! mode = "streaming"
//! idle_timeout_ms = 120000
//! channel_capacity = 64
//! ```
//!
//! # Environment
//!
//! | variable                      | field                    |
//! |-------------------------------|--------------------------|
//! | `REVIEW_CHAT_API_URL`         | `base_url`               |
//! | `REVIEW_CHAT_STREAMING`       | `default_mode`           |
//! | `REVIEW_CHAT_IDLE_TIMEOUT_MS` | `stream_idle_timeout_ms` |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend used when nothing else is configured
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Environment variable for the backend URL
pub const ENV_API_URL: &str = "REVIEW_CHAT_API_URL";
/// Environment variable toggling streaming (`0`/`false` selects buffered)
pub const ENV_STREAMING: &str = "REVIEW_CHAT_STREAMING";
/// Environment variable for the stream idle timeout
pub const ENV_IDLE_TIMEOUT_MS: &str = "REVIEW_CHAT_IDLE_TIMEOUT_MS";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in defaults
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// How assistant replies are requested
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// `POST /chat/stream`, rendered incrementally
    #[default]
    Streaming,
    /// `POST /chat`, one complete reply
    Buffered,
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[api]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiToml {
    /// Backend base URL
    pub base_url: Option<String>,
    /// Timeout for non-streaming requests in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// `[stream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Default request mode
    pub mode: Option<StreamMode>,
    /// Longest gap between frames before a stream fails (0 disables)
    pub idle_timeout_ms: Option<u64>,
    /// Capacity of the per-request update channel
    pub channel_capacity: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// API section
    pub api: ApiToml,
    /// Streaming section
    pub stream: StreamToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Backend base URL, without trailing slash
    pub base_url: String,
    /// Timeout for non-streaming requests in milliseconds
    pub request_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Longest gap between frames before a stream fails; `None` waits forever
    pub stream_idle_timeout_ms: Option<u64>,
    /// Request mode used when the caller does not choose one
    pub default_mode: StreamMode,
    /// Capacity of the per-request update channel
    pub update_channel_capacity: usize,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
            stream_idle_timeout_ms: None,
            default_mode: StreamMode::Streaming,
            update_channel_capacity: 64,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Configuration for a given backend, other values default
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            ..Self::default()
        }
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Timeout for non-streaming requests
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connection timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Stream idle timeout, if enabled
    #[must_use]
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_ms.map(Duration::from_millis)
    }

    /// Check that the values are usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a base URL that is not
    /// http(s) or a zero channel capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            ConfigError::ValidationError(format!("base_url {:?}: {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.update_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value != "0" && value != "false" && value != "no" && value != "off"
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/review-chat/config.toml` or
/// `~/.config/review-chat/config.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("review-chat").join("config.toml"))
}

/// Load configuration from the default file and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result does not validate. A missing config file is not an error.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result does
/// not validate.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ClientConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) {
    if let Some(ref url) = toml.api.base_url {
        config.base_url = normalize_base_url(url);
    }
    if let Some(timeout) = toml.api.request_timeout_ms {
        config.request_timeout_ms = timeout;
    }
    if let Some(timeout) = toml.api.connect_timeout_ms {
        config.connect_timeout_ms = timeout;
    }

    if let Some(mode) = toml.stream.mode {
        config.default_mode = mode;
    }
    if let Some(timeout) = toml.stream.idle_timeout_ms {
        config.stream_idle_timeout_ms = (timeout > 0).then_some(timeout);
    }
    if let Some(capacity) = toml.stream.channel_capacity {
        config.update_channel_capacity = capacity;
    }
}

fn apply_env_config<F>(config: &mut ClientConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
        config.base_url = normalize_base_url(&url);
        config.source = ConfigSource::Env;
    }
    if let Some(streaming) = env(ENV_STREAMING) {
        config.default_mode = if parse_flag(&streaming) {
            StreamMode::Streaming
        } else {
            StreamMode::Buffered
        };
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env(ENV_IDLE_TIMEOUT_MS) {
        match timeout.trim().parse::<u64>() {
            Ok(ms) => {
                config.stream_idle_timeout_ms = (ms > 0).then_some(ms);
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(
                value = %timeout,
                error = %e,
                "Ignoring invalid {ENV_IDLE_TIMEOUT_MS}"
            ),
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,
    /// Request mode override
    pub mode: Option<StreamMode>,
    /// Idle timeout override (milliseconds, 0 disables)
    pub idle_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set request mode override
    #[must_use]
    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set idle timeout override
    #[must_use]
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the result is not usable.
    pub fn apply(&self, config: &mut ClientConfig) -> Result<(), ConfigError> {
        if self.base_url.is_some() || self.mode.is_some() || self.idle_timeout_ms.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.base_url {
            config.base_url = normalize_base_url(url);
        }
        if let Some(mode) = self.mode {
            config.default_mode = mode;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.stream_idle_timeout_ms = (ms > 0).then_some(ms);
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
