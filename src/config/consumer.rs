//! Declared durable consumer configuration.
//!
//! Declared consumers (from configuration) and live consumers (fetched from
//! the server) both normalize into [`ConsumerSpec`] so that the merge engine
//! can diff and layer them.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::duration::serde_iso;

/// Error for a policy literal that matches no known variant.
///
/// Policy fields fail closed: an unknown literal is an error, not a default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown policy literal '{0}'")]
pub struct UnknownPolicy(pub String);

/// Where a consumer starts receiving messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverPolicy {
    /// Deliver everything in the stream.
    #[default]
    All,
    /// Deliver starting with the last message.
    Last,
    /// Deliver only messages that arrive after subscription.
    New,
    /// Deliver the last message for each filtered subject.
    LastPerSubject,
    /// Deliver starting at a specific stream sequence.
    #[serde(rename = "by-start-sequence", rename_all = "kebab-case")]
    ByStartSequence {
        /// Stream sequence to start from.
        start_sequence: u64,
    },
}

impl FromStr for DeliverPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "last" => Ok(Self::Last),
            "new" => Ok(Self::New),
            "last-per-subject" => Ok(Self::LastPerSubject),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// Acknowledgement requirements for delivered messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Each message must be acknowledged individually.
    #[default]
    Explicit,
    /// Acknowledging a message acknowledges all before it.
    All,
    /// No acknowledgement required.
    None,
}

impl FromStr for AckPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(Self::Explicit),
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// Replay pacing when delivering stored messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// Deliver as fast as possible.
    #[default]
    Instant,
    /// Deliver at the original arrival rate.
    Original,
}

impl FromStr for ReplayPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instant" => Ok(Self::Instant),
            "original" => Ok(Self::Original),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// One durable consumer configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConsumerSpec {
    /// Durable name.
    pub name: String,
    /// Delivery start position.
    pub deliver_policy: DeliverPolicy,
    /// Acknowledgement policy.
    pub ack_policy: AckPolicy,
    /// Replay pacing.
    pub replay_policy: ReplayPolicy,
    /// Subject filter (empty for all stream subjects).
    pub filter_subject: String,
    /// Delivery rate limit in bits per second (0 for unlimited).
    pub rate_limit: u64,
    /// Maximum outstanding unacknowledged messages.
    pub max_ack_pending: i64,
    /// Maximum delivery attempts per message (-1 for unlimited).
    pub max_deliver: i64,
    /// Redelivery backoff schedule, in order.
    #[serde(deserialize_with = "serde_iso::list")]
    pub backoff: Vec<Duration>,
    /// Enable flow control (push consumers only).
    pub flow_control: bool,
    /// Deliver headers without payloads.
    pub headers_only: bool,
    /// Keep consumer state in memory.
    pub memory_storage: bool,
    /// Replica count (0 inherits the stream's).
    pub replicas: usize,
}

impl Default for ConsumerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            deliver_policy: DeliverPolicy::default(),
            ack_policy: AckPolicy::default(),
            replay_policy: ReplayPolicy::default(),
            filter_subject: String::new(),
            rate_limit: 0,
            max_ack_pending: 1_000,
            max_deliver: -1,
            backoff: Vec::new(),
            flow_control: false,
            headers_only: false,
            memory_storage: false,
            replicas: 0,
        }
    }
}

/// Named consumer templates declared for one stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamConsumers {
    /// Stream the consumers belong to.
    pub stream: String,
    /// Declared consumer templates.
    pub consumers: Vec<ConsumerSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies_fail_closed() {
        assert!("explicit".parse::<AckPolicy>().is_ok());
        assert!("EXPLICIT".parse::<AckPolicy>().is_err());
        assert!("sometimes".parse::<AckPolicy>().is_err());
        assert!("soon".parse::<DeliverPolicy>().is_err());
        assert!("fast".parse::<ReplayPolicy>().is_err());
    }

    #[test]
    fn test_spec_defaults() {
        let spec = ConsumerSpec::default();
        assert_eq!(spec.ack_policy, AckPolicy::Explicit);
        assert_eq!(spec.max_deliver, -1);
        assert!(spec.backoff.is_empty());
    }
}
