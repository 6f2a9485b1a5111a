//! Chat client configuration
//!
//! Loaded from YAML, then overridden from the environment (`.env`
//! supported), then validated and turned into a [`ClientBuilder`].
//!
//! ```yaml
//! host: chat.example.com
//! use_ssl: true
//! user: bot
//! connect_timeout_ms: 20000
//! reopen_delay_ms: 10000
//! heartbeat_interval_ms: 30000
//! log_level: info
//! rooms: [GENERAL]
//! ```

use ddp::builder::states::HasUrl;
use ddp::{ClientBuilder, ClientConfig, Credentials, DdpClient};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarMissing(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Server host, optionally with scheme and port
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub user: Option<String>,
    /// Normally supplied through `ROCKETCHAT_PASSWORD`
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub integration_id: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reopen_delay_ms")]
    pub reopen_delay_ms: u64,
    /// 0 disables the heartbeat
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Rooms the demo binary watches
    #[serde(default)]
    pub rooms: Vec<String>,
}

fn default_host() -> String {
    "localhost:3000".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_reopen_delay_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            use_ssl: false,
            user: None,
            password: None,
            integration_id: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            reopen_delay_ms: default_reopen_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            log_level: default_log_level(),
            rooms: Vec::new(),
        }
    }
}

impl ChatConfig {
    /// Load configuration from a YAML file plus environment overrides
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        dotenv::dotenv().ok(); // Don't fail if .env doesn't exist

        let yaml_content = std::fs::read_to_string(config_path)?;
        let mut config: ChatConfig = serde_yaml::from_str(&yaml_content)?;

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = ChatConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROCKETCHAT_*` / `INTEGRATION_ID` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("ROCKETCHAT_URL") {
            info!("Overriding host from environment variable");
            self.use_ssl = url.starts_with("https://") || url.starts_with("wss://");
            self.host = url;
        }
        if let Some(flag) = lookup("ROCKETCHAT_USE_SSL") {
            self.use_ssl = matches!(flag.trim().to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(user) = lookup("ROCKETCHAT_USER") {
            self.user = Some(user);
        }
        if let Some(password) = lookup("ROCKETCHAT_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(id) = lookup("INTEGRATION_ID") {
            self.integration_id = Some(id);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError("host must not be empty".to_string()));
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.reopen_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reopen_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.user.is_some() != self.password.is_some() {
            return Err(ConfigError::ValidationError(
                "user and password must be set together".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "log_level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Normalized `ws[s]://host/websocket` endpoint
    pub fn websocket_url(&self) -> String {
        ClientConfig::websocket_url(&self.host, self.use_ssl)
    }

    /// Client builder carrying every setting from this configuration
    pub fn client_builder(&self) -> ClientBuilder<HasUrl> {
        let mut builder = DdpClient::builder()
            .url(self.websocket_url())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .reopen_delay(Duration::from_millis(self.reopen_delay_ms));

        builder = match self.heartbeat_interval_ms {
            0 => builder.no_heartbeat(),
            ms => builder.heartbeat(Duration::from_millis(ms)),
        };
        if let Some(id) = &self.integration_id {
            builder = builder.integration_id(id.clone());
        }
        builder
    }

    /// Password credentials, if configured
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials::password(user.clone(), password.clone())),
            _ => None,
        }
    }

    /// Log configuration summary
    pub fn log(&self) {
        info!("Configuration loaded:");
        info!("  Endpoint: {}", self.websocket_url());
        info!("  User: {}", self.user.as_deref().unwrap_or("<anonymous>"));
        info!("  Connect timeout: {} ms", self.connect_timeout_ms);
        info!("  Reopen delay: {} ms", self.reopen_delay_ms);
        info!("  Heartbeat: {} ms", self.heartbeat_interval_ms);
        info!("  Log level: {}", self.log_level);
    }
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConfig")
            .field("host", &self.host)
            .field("use_ssl", &self.use_ssl)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("integration_id", &self.integration_id)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("reopen_delay_ms", &self.reopen_delay_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("log_level", &self.log_level)
            .field("rooms", &self.rooms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.websocket_url(), "ws://localhost:3000/websocket");
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("ROCKETCHAT_URL", "https://open.rocket.chat"),
            ("ROCKETCHAT_USER", "bot"),
            ("ROCKETCHAT_PASSWORD", "pass"),
            ("INTEGRATION_ID", "js.sdk"),
        ]
        .into_iter()
        .collect();

        let mut config = ChatConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert!(config.use_ssl);
        assert_eq!(config.websocket_url(), "wss://open.rocket.chat/websocket");
        assert_eq!(config.integration_id.as_deref(), Some("js.sdk"));
        assert!(config.credentials().is_some());
    }

    #[test]
    fn test_explicit_ssl_flag_wins() {
        let mut config = ChatConfig::default();
        config.apply_overrides(|key| match key {
            "ROCKETCHAT_URL" => Some("https://chat.internal".to_string()),
            "ROCKETCHAT_USE_SSL" => Some("false".to_string()),
            _ => None,
        });
        assert_eq!(config.websocket_url(), "ws://chat.internal/websocket");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ChatConfig::default();
        config.user = Some("bot".into());
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = ChatConfig::default();
        config.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = ChatConfig::default();
        config.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = ChatConfig::default();
        config.password = Some("hunter2".into());
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
