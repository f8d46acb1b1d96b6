//! Configuration management for the resource fetcher
//!
//! [`AppConfig`] is the TOML representation of every tunable setting. Fields
//! holding durations are plain integers (`*_ms`, `*_secs`) so files stay easy
//! to edit; [`AppConfig::to_runtime_config`] turns them into the typed configs
//! the components take.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{CacheConfig, ClientConfig, ExecutorConfig, Priority, TrustPolicy};
use crate::constants::{cache, connections, http, logging};
use crate::errors::{ConfigError, ConfigResult};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Connection and execution settings
    pub connection: ConnectionConfigToml,
    /// Download cache settings
    pub cache: CacheConfigToml,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// TOML-friendly connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfigToml {
    /// Maximum number of concurrently executing requests
    pub max_concurrent_connections: usize,
    /// Connect timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Priority for requests queued without an explicit one
    pub default_priority: Priority,
    /// User-Agent header
    pub user_agent: String,
    /// Server certificate trust policy
    pub trust_policy: TrustPolicy,
}

impl Default for ConnectionConfigToml {
    fn default() -> Self {
        Self {
            max_concurrent_connections: connections::DEFAULT_MAX_CONNECTIONS,
            connection_timeout_ms: connections::DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64,
            read_timeout_ms: connections::DEFAULT_READ_TIMEOUT.as_millis() as u64,
            default_priority: Priority::Normal,
            user_agent: http::USER_AGENT.to_string(),
            trust_policy: TrustPolicy::System,
        }
    }
}

/// TOML-friendly cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfigToml {
    /// Cache instance name
    pub name: String,
    /// Cache directory path (system cache directory if absent)
    pub cache_root: Option<PathBuf>,
    /// Freshness window in seconds (absent = never stale)
    pub max_age_secs: Option<u64>,
}

impl Default for CacheConfigToml {
    fn default() -> Self {
        Self {
            name: cache::DEFAULT_CACHE_NAME.to_string(),
            cache_root: None,
            max_age_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level for the crate
    pub level: String,
    /// Enable colored output
    pub colored_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: logging::DEFAULT_LEVEL.to_string(),
            colored_output: true,
        }
    }
}

/// Typed configuration for each component
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub executor: ExecutorConfig,
    pub client: ClientConfig,
    pub cache: CacheConfig,
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl AppConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NotFound` if the file does not exist,
    /// `ConfigError::InvalidFormat` if it is not valid TOML for this schema,
    /// and `ConfigError::InvalidValue` if a value fails validation
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        debug!("Parsed configuration: {:?}", config);
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        let connection = &self.connection;
        if connection.max_concurrent_connections == 0
            || connection.max_concurrent_connections > connections::MAX_CONNECTIONS_LIMIT
        {
            return Err(ConfigError::invalid_value(
                "connection.max_concurrent_connections",
                connection.max_concurrent_connections,
                format!("Must be between 1 and {}", connections::MAX_CONNECTIONS_LIMIT),
            ));
        }
        if connection.connection_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "connection.connection_timeout_ms",
                0,
                "Must be greater than zero",
            ));
        }
        if connection.read_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "connection.read_timeout_ms",
                0,
                "Must be greater than zero",
            ));
        }

        let name = &self.cache.name;
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ConfigError::invalid_value(
                "cache.name",
                name,
                "Must be a non-empty file name",
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                &self.logging.level,
                format!("Must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        Ok(())
    }

    /// Convert TOML-friendly configuration to runtime configuration
    pub fn to_runtime_config(&self) -> RuntimeConfig {
        let connection = &self.connection;

        let executor = ExecutorConfig {
            max_concurrent_connections: connection.max_concurrent_connections,
            default_priority: connection.default_priority,
        };

        let client = ClientConfig {
            connect_timeout: Duration::from_millis(connection.connection_timeout_ms),
            read_timeout: Duration::from_millis(connection.read_timeout_ms),
            user_agent: connection.user_agent.clone(),
            trust_policy: connection.trust_policy,
            ..ClientConfig::default()
        };

        let cache = CacheConfig {
            name: self.cache.name.clone(),
            cache_root: self.cache.cache_root.clone(),
            max_age: self.cache.max_age_secs.map(Duration::from_secs),
            default_priority: connection.default_priority,
        };

        RuntimeConfig {
            executor,
            client,
            cache,
        }
    }

    /// Default configuration as commented TOML
    pub fn generate_default_config_content() -> String {
        format!(
            r#"# Resource Fetcher Configuration

[connection]
# Maximum number of requests executing at once
max_concurrent_connections = {}
connection_timeout_ms = {}
read_timeout_ms = {}
# low, normal or high
default_priority = "normal"
user_agent = "{}"
# "system" or "accept_all" (development servers only)
trust_policy = "system"

[cache]
name = "{}"
# Cache directory (leave unset to use the system cache directory)
# cache_root = "/path/to/cache"
# Seconds a downloaded file stays fresh (leave unset to never expire)
# max_age_secs = 86400

[logging]
level = "{}"  # error, warn, info, debug, trace
colored_output = true
"#,
            connections::DEFAULT_MAX_CONNECTIONS,
            connections::DEFAULT_CONNECTION_TIMEOUT.as_millis(),
            connections::DEFAULT_READ_TIMEOUT.as_millis(),
            http::USER_AGENT,
            cache::DEFAULT_CACHE_NAME,
            logging::DEFAULT_LEVEL,
        )
    }
}
