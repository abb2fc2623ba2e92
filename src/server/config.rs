//! Broker configuration.
//!
//! Environment variables:
//! - `ESG_SYNC_PORT`: Port to listen on (default: 8080)
//! - `ESG_SYNC_DATABASE_PATH`: Event log database (default: ~/.local/share/esg-sync/events.db)
//! - `ESG_SYNC_WRITE_TIMEOUT`: Seconds a socket write may take (default: 10)
//! - `ESG_SYNC_OUTBOUND_CAPACITY`: Outbound queue size per connection (default: 256)
//! - `ESG_SYNC_CONFIG`: Path to config file (default: ~/.config/esg-sync/server.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! port: 8080
//! database_path: /var/lib/esg-sync/events.db
//! write_timeout_secs: 10
//! outbound_capacity: 256
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::broker::BrokerOptions;
use crate::config::{
    default_config_dir, default_data_dir, merge_env, read_config_file, ConfigError, ConfigSource,
    ConfigValue, CONFIG_ENV,
};

/// Server configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: ConfigValue<u16>,
    /// SQLite event log
    pub database_path: ConfigValue<PathBuf>,
    pub write_timeout_secs: ConfigValue<u64>,
    pub outbound_capacity: ConfigValue<usize>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ServerConfigFile {
    port: Option<u16>,
    database_path: Option<PathBuf>,
    write_timeout_secs: Option<u64>,
    outbound_capacity: Option<usize>,
}

impl ServerConfig {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Like `load`, reading environment variables through `env`.
    pub fn load_with<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut port = ConfigValue::default_value(8080);
        let mut database_path = ConfigValue::default_value(default_data_dir().join("events.db"));
        let mut write_timeout_secs = ConfigValue::default_value(10);
        let mut outbound_capacity = ConfigValue::default_value(256);
        let mut config_file = None;

        let path = env(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);
        if let Some(file) = read_config_file::<ServerConfigFile>(&path)? {
            if let Some(db_path) = &file.database_path {
                // Relative paths are relative to the config file
                let resolved = if db_path.is_relative() {
                    path.parent()
                        .map(|p| p.join(db_path))
                        .unwrap_or_else(|| db_path.clone())
                } else {
                    db_path.clone()
                };
                database_path = ConfigValue::new(resolved, ConfigSource::File);
            }
            port.merge_file(file.port);
            write_timeout_secs.merge_file(file.write_timeout_secs);
            outbound_capacity.merge_file(file.outbound_capacity);
            config_file = Some(path);
        }

        merge_env(&mut port, "ESG_SYNC_PORT", env("ESG_SYNC_PORT"))?;
        if let Some(db_path) = env("ESG_SYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        merge_env(
            &mut write_timeout_secs,
            "ESG_SYNC_WRITE_TIMEOUT",
            env("ESG_SYNC_WRITE_TIMEOUT"),
        )?;
        merge_env(
            &mut outbound_capacity,
            "ESG_SYNC_OUTBOUND_CAPACITY",
            env("ESG_SYNC_OUTBOUND_CAPACITY"),
        )?;

        Ok(Self {
            port,
            database_path,
            write_timeout_secs,
            outbound_capacity,
            config_file,
        })
    }

    /// Default config file path (platform-specific config dir + server.yaml)
    pub fn default_config_path() -> PathBuf {
        default_config_dir().join("server.yaml")
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            write_timeout: Duration::from_secs(self.write_timeout_secs.value.max(1)),
            outbound_capacity: self.outbound_capacity.value.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&'static str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<&'static str, String> = pairs.iter().cloned().collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("missing.yaml");

        let config =
            ServerConfig::load_with(env_from(&[(CONFIG_ENV, missing.display().to_string())]))
                .unwrap();

        assert_eq!(config.port.value, 8080);
        assert_eq!(config.port.source, ConfigSource::Default);
        assert!(config.database_path.value.ends_with("esg-sync/events.db"));
        assert_eq!(config.write_timeout_secs.value, 10);
        assert_eq!(config.outbound_capacity.value, 256);
        assert!(config.config_file.is_none());

        let options = config.broker_options();
        assert_eq!(options.write_timeout, Duration::from_secs(10));
        assert_eq!(options.outbound_capacity, 256);
    }

    #[test]
    fn test_file_then_env() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("server.yaml");
        std::fs::write(
            &config_path,
            "port: 9000\ndatabase_path: data/events.db\noutbound_capacity: 16\n",
        )
        .unwrap();

        let config = ServerConfig::load_with(env_from(&[
            (CONFIG_ENV, config_path.display().to_string()),
            ("ESG_SYNC_PORT", "9100".to_string()),
        ]))
        .unwrap();

        assert_eq!(config.port.value, 9100);
        assert_eq!(config.port.source, ConfigSource::Environment);
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/events.db")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.outbound_capacity.value, 16);
        assert_eq!(config.write_timeout_secs.source, ConfigSource::Default);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_invalid_port() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("missing.yaml");

        let result = ServerConfig::load_with(env_from(&[
            (CONFIG_ENV, missing.display().to_string()),
            ("ESG_SYNC_PORT", "eighty".to_string()),
        ]));

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                key: "ESG_SYNC_PORT",
                ..
            })
        ));
    }
}
