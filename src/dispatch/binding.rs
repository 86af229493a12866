//! Static binding resolution.
//!
//! Declared bindings carry optional fields; resolution collapses them into
//! a complete, immutable dispatch table once, at registration time. After
//! that, per-message work is a table lookup with no fallback logic.

use std::time::Duration;

use serde::Deserialize;

use super::DispatchError;
use crate::config::{GeneralConfig, DEFAULT_CONNECTION_NAME};

/// One declared method binding.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BindingDescriptor {
    /// Method name, unique within its client.
    pub method: String,
    /// Subject to publish or subscribe on. Mandatory after resolution.
    pub subject: Option<String>,
    /// Connection override for this method.
    pub connection: Option<String>,
    /// Queue group for inbound bindings.
    pub queue_group: Option<String>,
    /// Response window override for synchronous calls.
    #[serde(deserialize_with = "crate::config::duration::serde_iso::option")]
    pub response_timeout: Option<Duration>,
}

/// Declared bindings for one client or listener interface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientSpec {
    /// Connection used by methods without their own override.
    pub connection: Option<String>,
    /// Declared method bindings.
    pub methods: Vec<BindingDescriptor>,
}

/// One fully resolved binding. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBinding {
    /// Method name.
    pub method: String,
    /// Subject, always present.
    pub subject: String,
    /// Connection name, always present.
    pub connection: String,
    /// Queue group for inbound bindings.
    pub queue_group: Option<String>,
    /// Response window for synchronous calls.
    pub response_timeout: Duration,
}

/// Lifecycle of one inbound binding.
///
/// `Failed` is terminal: a binding that could not be established is not
/// silently retried, it is reported and left down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Declared but not yet processed.
    Unbound,
    /// Resolution and subscription in progress.
    Resolving,
    /// Subscribed, no message seen yet.
    Bound,
    /// At least one message has been dispatched.
    Active,
    /// Establishment failed. Terminal.
    Failed,
}

impl BindingState {
    /// Whether moving to `next` is a legal lifecycle step.
    pub fn can_become(self, next: BindingState) -> bool {
        use BindingState::*;
        matches!(
            (self, next),
            (Unbound, Resolving)
                | (Resolving, Bound)
                | (Resolving, Failed)
                | (Bound, Active)
                | (Bound, Failed)
        )
    }
}

/// Resolve every declared binding of a spec, or fail the whole spec.
///
/// Connection precedence: method override, then the spec's connection, then
/// [`DEFAULT_CONNECTION_NAME`]. A binding without a subject is fatal.
pub fn resolve_bindings(
    spec: &ClientSpec,
    general: &GeneralConfig,
) -> Result<Vec<ResolvedBinding>, DispatchError> {
    let mut resolved = Vec::with_capacity(spec.methods.len());

    for descriptor in &spec.methods {
        if descriptor.method.is_empty() {
            return Err(DispatchError::Binding {
                method: "<unnamed>".to_string(),
                detail: "method name is mandatory".to_string(),
            });
        }
        let subject = descriptor
            .subject
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DispatchError::Binding {
                method: descriptor.method.clone(),
                detail: "no subject declared".to_string(),
            })?;
        if resolved
            .iter()
            .any(|b: &ResolvedBinding| b.method == descriptor.method)
        {
            return Err(DispatchError::Binding {
                method: descriptor.method.clone(),
                detail: "duplicate method name".to_string(),
            });
        }

        let connection = descriptor
            .connection
            .clone()
            .or_else(|| spec.connection.clone())
            .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_string());

        resolved.push(ResolvedBinding {
            method: descriptor.method.clone(),
            subject,
            connection,
            queue_group: descriptor.queue_group.clone(),
            response_timeout: descriptor
                .response_timeout
                .unwrap_or(general.response_timeout),
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(method: &str, subject: &str) -> BindingDescriptor {
        BindingDescriptor {
            method: method.into(),
            subject: Some(subject.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_precedence() {
        let spec = ClientSpec {
            connection: Some("edge".into()),
            methods: vec![
                descriptor("a", "svc.a"),
                BindingDescriptor {
                    connection: Some("core".into()),
                    ..descriptor("b", "svc.b")
                },
            ],
        };

        let resolved = resolve_bindings(&spec, &GeneralConfig::default()).unwrap();
        assert_eq!(resolved[0].connection, "edge");
        assert_eq!(resolved[1].connection, "core");

        let bare = ClientSpec {
            connection: None,
            methods: vec![descriptor("a", "svc.a")],
        };
        let resolved = resolve_bindings(&bare, &GeneralConfig::default()).unwrap();
        assert_eq!(resolved[0].connection, DEFAULT_CONNECTION_NAME);
    }

    #[test]
    fn test_missing_subject_is_fatal() {
        let spec = ClientSpec {
            connection: None,
            methods: vec![BindingDescriptor {
                method: "a".into(),
                ..Default::default()
            }],
        };
        assert!(matches!(
            resolve_bindings(&spec, &GeneralConfig::default()),
            Err(DispatchError::Binding { method, .. }) if method == "a"
        ));
    }

    #[test]
    fn test_duplicate_methods_rejected() {
        let spec = ClientSpec {
            connection: None,
            methods: vec![descriptor("a", "svc.a"), descriptor("a", "svc.a2")],
        };
        assert!(resolve_bindings(&spec, &GeneralConfig::default()).is_err());
    }

    #[test]
    fn test_timeout_defaults_from_general() {
        let general = GeneralConfig {
            response_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let spec = ClientSpec {
            connection: None,
            methods: vec![
                descriptor("a", "svc.a"),
                BindingDescriptor {
                    response_timeout: Some(Duration::from_secs(1)),
                    ..descriptor("b", "svc.b")
                },
            ],
        };
        let resolved = resolve_bindings(&spec, &general).unwrap();
        assert_eq!(resolved[0].response_timeout, Duration::from_secs(3));
        assert_eq!(resolved[1].response_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_failed_is_terminal() {
        assert!(BindingState::Unbound.can_become(BindingState::Resolving));
        assert!(BindingState::Resolving.can_become(BindingState::Bound));
        assert!(BindingState::Bound.can_become(BindingState::Active));
        assert!(!BindingState::Failed.can_become(BindingState::Resolving));
        assert!(!BindingState::Failed.can_become(BindingState::Bound));
        assert!(!BindingState::Active.can_become(BindingState::Unbound));
    }
}
