//! Messaging configuration.
//!
//! Configuration is read from layered sources (YAML files, then prefixed
//! environment variables) and resolved into typed descriptors: one
//! [`GeneralConfig`] of process-wide defaults plus one [`ConnectionConfig`]
//! per declared connection. Resolution is pure — no network I/O happens
//! until bootstrap.

pub mod connection;
pub mod consumer;
pub mod duration;
pub mod stream;

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use connection::{
    AuthConfig, ConnectionConfig, JetStreamContextConfig, RawConnection, TlsConfig,
    DEFAULT_ADDRESS, DEFAULT_CONNECTION_NAME,
};
pub use consumer::{AckPolicy, ConsumerSpec, DeliverPolicy, ReplayPolicy, StreamConsumers};
pub use stream::{
    DiscardPolicy, RetentionPolicy, StorageType, StreamSpec, DEFAULT_DUPLICATE_WINDOW,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "jetbind.yaml";
/// Environment variable naming an alternate configuration file.
pub const CONFIG_ENV_VAR: &str = "JETBIND_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "JETBIND";

/// Default synchronous response timeout.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default publish-acknowledgement confirmation timeout.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default publish-acknowledgement retry count.
pub const DEFAULT_ACK_RETRIES: usize = 3;
/// Default drain timeout on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration errors. Fatal at startup: a process with broken messaging
/// configuration must not come up half-wired.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The messaging root block is missing entirely.
    #[error("missing 'nats' configuration root")]
    MissingRoot,

    /// A `servers` list entry has no `name`.
    #[error("servers[{0}] is missing the mandatory 'name' field")]
    MissingServerName(usize),

    /// Two connections share a name.
    #[error("duplicate connection name '{0}'")]
    DuplicateConnection(String),

    /// A declared stream has no name.
    #[error("connection '{connection}': streams[{index}] is missing 'name'")]
    MissingStreamName {
        /// Owning connection.
        connection: String,
        /// Position in the stream list.
        index: usize,
    },

    /// A consumer template block names no stream or no durable.
    #[error("connection '{connection}': {detail}")]
    InvalidConsumerBlock {
        /// Owning connection.
        connection: String,
        /// What is wrong.
        detail: String,
    },

    /// Underlying loader/deserialization failure (missing file, bad YAML,
    /// malformed duration, unknown policy literal).
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Process-wide defaults, created once at startup and immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralConfig {
    /// Timeout for synchronous request/reply calls.
    pub response_timeout: Duration,
    /// Timeout for one publish-acknowledgement confirmation.
    pub ack_timeout: Duration,
    /// Retries for publish-acknowledgement confirmation.
    pub ack_retries: usize,
    /// Drain budget on shutdown.
    pub drain_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            ack_retries: DEFAULT_ACK_RETRIES,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Raw messaging root block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MessagingConfig {
    /// Synchronous response timeout.
    #[serde(deserialize_with = "duration::serde_iso::option")]
    pub response_timeout: Option<Duration>,
    /// Publish-acknowledgement confirmation timeout.
    #[serde(deserialize_with = "duration::serde_iso::option")]
    pub ack_timeout: Option<Duration>,
    /// Publish-acknowledgement retry count.
    pub ack_retries: Option<usize>,
    /// Drain budget on shutdown.
    #[serde(deserialize_with = "duration::serde_iso::option")]
    pub drain_timeout: Option<Duration>,
    /// Named connections (cluster mode). Each entry must carry a name.
    pub servers: Option<Vec<RawConnection>>,
    /// Single-connection fields, read from the root block itself.
    #[serde(flatten)]
    pub connection: RawConnection,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging root. Absent means messaging is not configured.
    pub nats: Option<MessagingConfig>,
}

impl Config {
    /// Load configuration from layered sources.
    ///
    /// Sources, later overriding earlier:
    /// 1. `jetbind.yaml` in the current directory (if present)
    /// 2. File named by the `path` argument (if provided, required)
    /// 3. File named by `JETBIND_CONFIG` (if set, required)
    /// 4. Environment variables prefixed `JETBIND` with `__` separators
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(loaded.try_deserialize()?)
    }

    /// Parse configuration from a YAML string. Used by tests and embedders.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let loaded = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;

        Ok(loaded.try_deserialize()?)
    }

    /// Resolve the loaded configuration into typed descriptors.
    ///
    /// Cluster mode (a `servers` list) produces one connection per entry,
    /// each with a mandatory unique name. Otherwise the root block itself is
    /// the single connection named [`DEFAULT_CONNECTION_NAME`]. A missing
    /// root block is fatal.
    pub fn resolve(
        &self,
    ) -> Result<(GeneralConfig, HashMap<String, ConnectionConfig>), ConfigError> {
        let root = self.nats.as_ref().ok_or(ConfigError::MissingRoot)?;

        let general = GeneralConfig {
            response_timeout: root.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
            ack_timeout: root.ack_timeout.unwrap_or(DEFAULT_ACK_TIMEOUT),
            ack_retries: root.ack_retries.unwrap_or(DEFAULT_ACK_RETRIES),
            drain_timeout: root.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT),
        };

        let mut connections = HashMap::new();

        match &root.servers {
            Some(servers) => {
                for (index, raw) in servers.iter().enumerate() {
                    let name = raw
                        .name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .ok_or(ConfigError::MissingServerName(index))?;
                    if connections.contains_key(&name) {
                        return Err(ConfigError::DuplicateConnection(name));
                    }
                    let config = ConnectionConfig::from_raw(name.clone(), raw.clone());
                    validate_connection(&config)?;
                    connections.insert(name, config);
                }
            }
            None => {
                let config = ConnectionConfig::from_raw(
                    DEFAULT_CONNECTION_NAME.to_string(),
                    root.connection.clone(),
                );
                validate_connection(&config)?;
                connections.insert(DEFAULT_CONNECTION_NAME.to_string(), config);
            }
        }

        Ok((general, connections))
    }
}

fn validate_connection(config: &ConnectionConfig) -> Result<(), ConfigError> {
    for (index, stream) in config.streams.iter().enumerate() {
        if stream.name.is_empty() {
            return Err(ConfigError::MissingStreamName {
                connection: config.name.clone(),
                index,
            });
        }
    }

    for block in &config.consumer_configuration {
        if block.stream.is_empty() {
            return Err(ConfigError::InvalidConsumerBlock {
                connection: config.name.clone(),
                detail: "consumer-configuration entry is missing 'stream'".to_string(),
            });
        }
        for consumer in &block.consumers {
            if consumer.name.is_empty() {
                return Err(ConfigError::InvalidConsumerBlock {
                    connection: config.name.clone(),
                    detail: format!(
                        "consumer for stream '{}' is missing 'name'",
                        block.stream
                    ),
                });
            }
        }
    }

    Ok(())
}
