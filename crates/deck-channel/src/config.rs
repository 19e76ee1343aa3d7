use deck_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ADDRESS: &str = "ws://127.0.0.1:8765/ws";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub address: String,
    pub max_frame_bytes: usize,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub session: SessionConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Zero disables the limit.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub toast_ttl_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            toast_ttl_ms: 4_000,
            command_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn toast_ttl(&self) -> Duration {
        Duration::from_millis(self.toast_ttl_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl ChannelConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ChannelConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Applies `DECK_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &'static str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(address) = read("DECK_ADDRESS") {
            self.address = address;
        }
        if let Some(value) = read("DECK_HEARTBEAT_MS") {
            self.heartbeat.interval_ms = parse_env("DECK_HEARTBEAT_MS", &value)?;
        }
        if let Some(value) = read("DECK_MAX_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = parse_env("DECK_MAX_RECONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = read("DECK_MAX_BACKOFF_MS") {
            self.reconnect.max_backoff_ms = parse_env("DECK_MAX_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read("DECK_COMMAND_TIMEOUT_MS") {
            self.session.command_timeout_ms = parse_env("DECK_COMMAND_TIMEOUT_MS", &value)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".to_string()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be > 0".to_string()));
        }
        let reconnect = &self.reconnect;
        if reconnect.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_backoff_ms must be > 0".to_string(),
            ));
        }
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect.backoff_multiplier must be >= 1.0, got {}",
                reconnect.backoff_multiplier
            )));
        }
        if reconnect.max_backoff_ms < reconnect.initial_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect.max_backoff_ms ({}) is below initial_backoff_ms ({})",
                reconnect.max_backoff_ms, reconnect.initial_backoff_ms
            )));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms must be > 0".to_string(),
            ));
        }
        if self.session.toast_ttl_ms == 0 || self.session.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session timings must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}
