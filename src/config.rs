//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TURNSTILE__`-prefixed environment variables using `__` as the
//! section separator (for example `TURNSTILE__POLICIES__LOGIN__MAX=10`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{FailureMode, Policy, MAX_WINDOW};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Background sweep configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-policy overrides
    #[serde(default)]
    pub policies: PoliciesConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps of expired records
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Overrides for one named policy. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,

    /// Calls admitted per key per window
    #[serde(default)]
    pub max: Option<u64>,

    /// Message shown to rejected callers
    #[serde(default)]
    pub message: Option<String>,

    /// Fixed retry-after advertised to rejected callers
    #[serde(default)]
    pub retry_after_secs: Option<u64>,

    /// Behaviour when the backend cannot decide
    #[serde(default)]
    pub failure_mode: Option<FailureMode>,
}

impl PolicyConfig {
    /// Apply these overrides on top of a built-in policy.
    pub fn apply(&self, preset: Policy) -> Result<Policy> {
        let window = self
            .window_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| preset.window());
        let max = self.max.unwrap_or_else(|| preset.max());

        let mut policy = preset.with_limits(window, max)?;

        if let Some(message) = &self.message {
            policy = policy.with_message(message.clone());
        }
        if let Some(secs) = self.retry_after_secs {
            policy = policy.with_retry_after(Duration::from_secs(secs));
        }
        if let Some(mode) = self.failure_mode {
            policy = policy.with_failure_mode(mode);
        }

        Ok(policy)
    }
}

/// Overrides for the five named policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoliciesConfig {
    #[serde(default)]
    pub global: PolicyConfig,
    #[serde(default)]
    pub api_key: PolicyConfig,
    #[serde(default)]
    pub message_send: PolicyConfig,
    #[serde(default)]
    pub login: PolicyConfig,
    #[serde(default)]
    pub webhook: PolicyConfig,
}

/// The resolved set of named policies.
#[derive(Debug, Clone)]
pub struct NamedPolicies {
    pub global: Policy,
    pub api_key: Policy,
    pub message_send: Policy,
    pub login: Policy,
    pub webhook: Policy,
}

impl PoliciesConfig {
    /// Build every named policy with overrides applied.
    pub fn resolve(&self) -> Result<NamedPolicies> {
        Ok(NamedPolicies {
            global: self.global.apply(Policy::global())?,
            api_key: self.api_key.apply(Policy::api_key())?,
            message_send: self.message_send.apply(Policy::message_send())?,
            login: self.login.apply(Policy::login())?,
            webhook: self.webhook.apply(Policy::webhook())?,
        })
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TurnstileConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.sweeper.interval_secs == 0 {
            return Err(TurnstileError::Config(
                "sweeper.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sweeper.interval() > MAX_WINDOW {
            return Err(TurnstileError::Config(format!(
                "sweeper.interval_secs must be at most {}",
                MAX_WINDOW.as_secs()
            )));
        }

        self.policies
            .resolve()
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        Ok(())
    }
}
