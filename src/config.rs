use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "ESG_SYNC_CONFIG";

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }

    pub fn default_value(value: T) -> Self {
        Self::new(value, ConfigSource::Default)
    }

    /// Replaces the value if `file_value` is set.
    pub fn merge_file(&mut self, file_value: Option<T>) {
        if let Some(value) = file_value {
            *self = Self::new(value, ConfigSource::File);
        }
    }
}

/// Applies an environment override parsed from `raw`.
///
/// Unparseable values are rejected rather than silently ignored.
pub(crate) fn merge_env<T: std::str::FromStr>(
    target: &mut ConfigValue<T>,
    key: &'static str,
    raw: Option<String>,
) -> Result<(), ConfigError> {
    if let Some(raw) = raw {
        let value = raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw })?;
        *target = ConfigValue::new(value, ConfigSource::Environment);
    }
    Ok(())
}

/// Reads and parses a YAML config file, if it exists.
pub(crate) fn read_config_file<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
    let parsed = serde_yaml::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))?;
    Ok(Some(parsed))
}

/// Default config directory (platform-specific):
/// - Linux: ~/.config/esg-sync/
/// - macOS: ~/Library/Application Support/esg-sync/
/// - Windows: %APPDATA%/esg-sync/
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("esg-sync")
}

/// Default data directory (platform-specific):
/// - Linux: ~/.local/share/esg-sync/
/// - macOS: ~/Library/Application Support/esg-sync/
/// - Windows: %APPDATA%/esg-sync/
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("esg-sync")
}

/// Client configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct ClientConfig {
    /// Broker URL (e.g., "ws://localhost:8080" or "wss://sync.example.com")
    pub server_url: ConfigValue<String>,
    /// Identity to connect as
    pub identity: ConfigValue<Option<String>>,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: ConfigValue<u32>,
    /// Seconds between heartbeats
    pub heartbeat_secs: ConfigValue<u64>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ClientConfigFile {
    server_url: Option<String>,
    identity: Option<String>,
    max_reconnect_attempts: Option<u32>,
    heartbeat_secs: Option<u64>,
}

impl ClientConfig {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Like `load`, reading environment variables through `env`.
    pub fn load_with<F>(config_path: Option<PathBuf>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut server_url = ConfigValue::default_value("ws://localhost:8080".to_string());
        let mut identity = ConfigValue::default_value(None);
        let mut max_reconnect_attempts = ConfigValue::default_value(5);
        let mut heartbeat_secs = ConfigValue::default_value(30);
        let mut config_file = None;

        let path = config_path
            .or_else(|| env(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(Self::default_config_path);
        if let Some(file) = read_config_file::<ClientConfigFile>(&path)? {
            config_file = Some(path);
            server_url.merge_file(file.server_url);
            identity.merge_file(file.identity.map(Some));
            max_reconnect_attempts.merge_file(file.max_reconnect_attempts);
            heartbeat_secs.merge_file(file.heartbeat_secs);
        }

        if let Some(url) = env("ESG_SYNC_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Some(id) = env("ESG_SYNC_IDENTITY") {
            identity = ConfigValue::new(Some(id), ConfigSource::Environment);
        }
        merge_env(
            &mut max_reconnect_attempts,
            "ESG_SYNC_MAX_RECONNECT_ATTEMPTS",
            env("ESG_SYNC_MAX_RECONNECT_ATTEMPTS"),
        )?;
        merge_env(
            &mut heartbeat_secs,
            "ESG_SYNC_HEARTBEAT_SECS",
            env("ESG_SYNC_HEARTBEAT_SECS"),
        )?;

        Ok(Self {
            server_url,
            identity,
            max_reconnect_attempts,
            heartbeat_secs,
            config_file,
        })
    }

    /// Default config file path (platform-specific config dir + client.yaml)
    pub fn default_config_path() -> PathBuf {
        default_config_dir().join("client.yaml")
    }

    /// Client options derived from this configuration.
    pub fn client_options(&self) -> esg_sync_core::ClientOptions {
        esg_sync_core::ClientOptions {
            heartbeat_interval: std::time::Duration::from_secs(self.heartbeat_secs.value.max(1)),
            max_reconnect_attempts: self.max_reconnect_attempts.value,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: '{}'", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
