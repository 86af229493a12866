//! Three-tier consumer configuration merge.
//!
//! A durable consumer's final configuration is resolved from up to three
//! layers: a declared base (from configuration), a live base (fetched from
//! the server when the declared one is absent), and call-site override
//! directives applied on top. The requested durable name always wins.

use tracing::debug;

use super::{ReconcileError, StreamStore};
use crate::config::duration::parse_iso8601;
use crate::config::ConsumerSpec;
use thiserror::Error;

/// Call-site override directives for one consumer binding.
#[derive(Debug, Clone, Default)]
pub struct ConsumerOverrides {
    /// Name of the base consumer to start from. When set, the base must
    /// exist locally or on the server; when unset, merging starts from an
    /// empty default base.
    pub base: Option<String>,
    /// Ordered (field, value) directives. Later entries win.
    pub directives: Vec<(String, String)>,
}

impl ConsumerOverrides {
    /// Overrides starting from the named base consumer.
    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            base: Some(base.into()),
            directives: Vec::new(),
        }
    }

    /// Append one directive.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.directives.push((key.into(), value.into()));
        self
    }
}

/// Errors from the merge step. Surfaced at bootstrap, never swallowed.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The named base consumer exists neither locally nor on the server.
    #[error("base consumer '{base}' not found for stream '{stream}'")]
    BaseNotFound {
        /// Stream name.
        stream: String,
        /// Requested base consumer name.
        base: String,
    },

    /// An override value failed its field parser.
    #[error("invalid override '{key}={value}': {reason}")]
    InvalidValue {
        /// Directive key.
        key: String,
        /// Offending value.
        value: String,
        /// Parser failure description.
        reason: String,
    },

    /// The live base lookup itself failed.
    #[error(transparent)]
    Lookup(#[from] ReconcileError),
}

/// Resolve the final configuration for the durable named `durable_name`.
///
/// Returns `Ok(None)` when there is nothing to configure: no overrides and
/// no declared consumer of that name. The caller decides whether that is
/// acceptable for its binding.
pub async fn merge_consumer_config(
    durable_name: &str,
    stream: &str,
    declared: &[ConsumerSpec],
    store: &dyn StreamStore,
    overrides: Option<&ConsumerOverrides>,
) -> Result<Option<ConsumerSpec>, MergeError> {
    let Some(overrides) = overrides else {
        return Ok(declared
            .iter()
            .find(|spec| spec.name == durable_name)
            .cloned());
    };

    let mut base = match &overrides.base {
        Some(base_name) => match declared.iter().find(|spec| &spec.name == base_name) {
            Some(local) => local.clone(),
            None => match store.consumer_info(stream, base_name).await? {
                Some(live) => live,
                None => {
                    return Err(MergeError::BaseNotFound {
                        stream: stream.to_string(),
                        base: base_name.clone(),
                    })
                }
            },
        },
        None => ConsumerSpec::default(),
    };

    for (key, value) in &overrides.directives {
        apply_directive(&mut base, key, value)?;
    }

    base.name = durable_name.to_string();
    Ok(Some(base))
}

fn apply_directive(spec: &mut ConsumerSpec, key: &str, value: &str) -> Result<(), MergeError> {
    let invalid = |reason: String| MergeError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };

    match key {
        "deliver-policy" => {
            spec.deliver_policy = value.parse().map_err(|e| invalid(format!("{e}")))?;
        }
        "ack-policy" => {
            spec.ack_policy = value.parse().map_err(|e| invalid(format!("{e}")))?;
        }
        "replay-policy" => {
            spec.replay_policy = value.parse().map_err(|e| invalid(format!("{e}")))?;
        }
        "filter-subject" => {
            spec.filter_subject = value.to_string();
        }
        "rate-limit" => {
            spec.rate_limit = value
                .parse()
                .map_err(|_| invalid("expected an unsigned integer".to_string()))?;
        }
        "max-ack-pending" => {
            spec.max_ack_pending = value
                .parse()
                .map_err(|_| invalid("expected an integer".to_string()))?;
        }
        "max-deliver" => {
            spec.max_deliver = value
                .parse()
                .map_err(|_| invalid("expected an integer".to_string()))?;
        }
        "backoff" => {
            spec.backoff = value
                .split(',')
                .map(|part| parse_iso8601(part.trim()))
                .collect::<Result<_, _>>()
                .map_err(|e| invalid(format!("{e}")))?;
        }
        "flow-control" => {
            spec.flow_control = parse_bool(value).ok_or_else(|| {
                invalid("expected 'true' or 'false'".to_string())
            })?;
        }
        "headers-only" => {
            spec.headers_only = parse_bool(value).ok_or_else(|| {
                invalid("expected 'true' or 'false'".to_string())
            })?;
        }
        "memory-storage" => {
            spec.memory_storage = parse_bool(value).ok_or_else(|| {
                invalid("expected 'true' or 'false'".to_string())
            })?;
        }
        "replicas" => {
            spec.replicas = value
                .parse()
                .map_err(|_| invalid("expected an unsigned integer".to_string()))?;
        }
        unknown => {
            // Forward-compatible: newer override sets may carry keys this
            // version does not know.
            debug!(key = %unknown, "Ignoring unknown consumer override key");
        }
    }

    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
