//! Per-connection configuration.

use std::time::Duration;

use serde::Deserialize;

use super::consumer::StreamConsumers;
use super::duration::serde_iso;
use super::stream::StreamSpec;

/// Name given to the single connection when no `servers` list is configured.
pub const DEFAULT_CONNECTION_NAME: &str = "default";

/// Endpoint used when a connection declares no addresses.
pub const DEFAULT_ADDRESS: &str = "nats://localhost:4222";

/// Reconnect attempt ceiling when unset.
pub const DEFAULT_MAX_RECONNECTS: usize = 60;
/// Wait between reconnect attempts when unset.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
/// Per-address connection timeout when unset.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);
/// Ping interval when unset.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
/// Reconnect buffer size in bytes when unset.
pub const DEFAULT_RECONNECT_BUFFER_SIZE: usize = 8 * 1024 * 1024;
/// Inbox prefix when unset.
pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

/// TLS material for one connection.
///
/// Absent block means default transport security; every field inside the
/// block is optional and falls back to library defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TlsConfig {
    /// Require a TLS handshake even without explicit certificate material.
    pub required: bool,
    /// PEM file with additional root certificates.
    pub root_cert: Option<String>,
    /// PEM file with the client certificate.
    pub client_cert: Option<String>,
    /// PEM file with the client key.
    pub client_key: Option<String>,
}

/// Credentials for one connection. All fields optional; username/password,
/// token, and credentials file are mutually independent inputs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthConfig {
    /// Username for basic authentication.
    pub username: Option<String>,
    /// Password for basic authentication.
    pub password: Option<String>,
    /// Static authentication token.
    pub token: Option<String>,
    /// Path to a `.creds` file.
    pub credentials_file: Option<String>,
}

impl AuthConfig {
    fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.password.is_none()
            && self.token.is_none()
            && self.credentials_file.is_none()
    }
}

/// Options for one named JetStream context on a connection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct JetStreamContextConfig {
    /// Context name (empty for the connection's default context).
    pub name: String,
    /// JetStream domain.
    pub domain: Option<String>,
    /// Custom API prefix.
    pub prefix: Option<String>,
    /// Budget for individual server round-trips made through this context.
    #[serde(deserialize_with = "serde_iso::option")]
    pub request_timeout: Option<Duration>,
}

/// Raw connection block as it appears in the configuration source.
///
/// Every field is optional; [`ConnectionConfig`] applies the documented
/// defaults during resolution.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawConnection {
    /// Connection name. Mandatory for entries of the `servers` list.
    pub name: Option<String>,
    /// Server addresses.
    pub addresses: Vec<String>,
    /// Maximum reconnect attempts.
    pub max_reconnects: Option<usize>,
    /// Wait between reconnect attempts.
    #[serde(deserialize_with = "serde_iso::option")]
    pub reconnect_wait: Option<Duration>,
    /// Per-address connection timeout.
    #[serde(deserialize_with = "serde_iso::option")]
    pub connection_timeout: Option<Duration>,
    /// Ping interval.
    #[serde(deserialize_with = "serde_iso::option")]
    pub ping_interval: Option<Duration>,
    /// Reconnect buffer size in bytes.
    pub reconnect_buffer_size: Option<usize>,
    /// Inbox prefix.
    pub inbox_prefix: Option<String>,
    /// Suppress delivery of own published messages.
    pub no_echo: bool,
    /// Authentication material.
    #[serde(flatten)]
    pub auth: AuthConfig,
    /// Optional TLS block.
    pub tls: Option<TlsConfig>,
    /// Declared streams.
    pub streams: Vec<StreamSpec>,
    /// Declared consumer templates, grouped by stream.
    pub consumer_configuration: Vec<StreamConsumers>,
    /// Named JetStream context options.
    pub jetstream_contexts: Vec<JetStreamContextConfig>,
}

/// Fully resolved configuration for one connection.
///
/// Built once from configuration at startup and read-only thereafter. The
/// live transport handle is created asynchronously by the coordinator and may
/// never materialize if bootstrap failed; the descriptor itself stays valid.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Unique connection name.
    pub name: String,
    /// Server addresses, never empty.
    pub addresses: Vec<String>,
    /// Maximum reconnect attempts.
    pub max_reconnects: usize,
    /// Wait between reconnect attempts.
    pub reconnect_wait: Duration,
    /// Per-address connection timeout.
    pub connection_timeout: Duration,
    /// Ping interval.
    pub ping_interval: Duration,
    /// Reconnect buffer size in bytes.
    pub reconnect_buffer_size: usize,
    /// Inbox prefix.
    pub inbox_prefix: String,
    /// Suppress delivery of own published messages.
    pub no_echo: bool,
    /// Authentication material, if any.
    pub auth: Option<AuthConfig>,
    /// TLS material, if the block was present.
    pub tls: Option<TlsConfig>,
    /// Declared streams.
    pub streams: Vec<StreamSpec>,
    /// Declared consumer templates, grouped by stream.
    pub consumer_configuration: Vec<StreamConsumers>,
    /// Named JetStream context options.
    pub jetstream_contexts: Vec<JetStreamContextConfig>,
}

impl ConnectionConfig {
    /// Resolve a raw block into a full descriptor under the given name.
    pub fn from_raw(name: String, raw: RawConnection) -> Self {
        let addresses = if raw.addresses.is_empty() {
            vec![DEFAULT_ADDRESS.to_string()]
        } else {
            raw.addresses
        };

        Self {
            name,
            addresses,
            max_reconnects: raw.max_reconnects.unwrap_or(DEFAULT_MAX_RECONNECTS),
            reconnect_wait: raw.reconnect_wait.unwrap_or(DEFAULT_RECONNECT_WAIT),
            connection_timeout: raw
                .connection_timeout
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            ping_interval: raw.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            reconnect_buffer_size: raw
                .reconnect_buffer_size
                .unwrap_or(DEFAULT_RECONNECT_BUFFER_SIZE),
            inbox_prefix: raw
                .inbox_prefix
                .unwrap_or_else(|| DEFAULT_INBOX_PREFIX.to_string()),
            no_echo: raw.no_echo,
            auth: if raw.auth.is_empty() {
                None
            } else {
                Some(raw.auth)
            },
            tls: raw.tls,
            streams: raw.streams,
            consumer_configuration: raw.consumer_configuration,
            jetstream_contexts: raw.jetstream_contexts,
        }
    }

    /// Wait budget this connection contributes to bootstrap:
    /// per-address timeout times the number of addresses.
    pub fn connect_budget(&self) -> Duration {
        self.connection_timeout * self.addresses.len() as u32
    }

    /// Declared consumers for a given stream, if any.
    pub fn consumers_for(&self, stream: &str) -> Option<&StreamConsumers> {
        self.consumer_configuration
            .iter()
            .find(|entry| entry.stream == stream)
    }

    /// Named JetStream context options, if declared.
    pub fn context_options(&self, name: &str) -> Option<&JetStreamContextConfig> {
        self.jetstream_contexts.iter().find(|ctx| ctx.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_applies_defaults() {
        let config = ConnectionConfig::from_raw("default".into(), RawConnection::default());
        assert_eq!(config.addresses, vec![DEFAULT_ADDRESS.to_string()]);
        assert_eq!(config.max_reconnects, DEFAULT_MAX_RECONNECTS);
        assert_eq!(config.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
        assert_eq!(config.inbox_prefix, DEFAULT_INBOX_PREFIX);
        assert!(config.auth.is_none());
        assert!(config.tls.is_none());
        assert!(config.streams.is_empty());
    }

    #[test]
    fn test_connect_budget_scales_with_addresses() {
        let raw = RawConnection {
            addresses: vec!["nats://a:4222".into(), "nats://b:4222".into()],
            ..Default::default()
        };
        let config = ConnectionConfig::from_raw("cluster".into(), raw);
        assert_eq!(config.connect_budget(), DEFAULT_CONNECTION_TIMEOUT * 2);
    }
}
