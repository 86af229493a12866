//! Declared stream configuration.

use std::time::Duration;

use serde::Deserialize;

use super::duration::serde_iso;

/// Duplicate-tracking window applied when a stream does not configure one.
///
/// Matches the server-side default so that reconciliation of a stream created
/// with an omitted window stays idempotent: a zero value here would make every
/// bootstrap see a config difference and issue a pointless update.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Message retention policy for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Retain messages until limits are reached.
    #[default]
    Limits,
    /// Retain messages while any consumer is interested.
    Interest,
    /// Remove messages once consumed (work queue semantics).
    Workqueue,
}

/// Behavior when a stream hits its limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Discard the oldest messages.
    #[default]
    Old,
    /// Reject new messages.
    New,
}

/// Backing storage for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// File-backed storage.
    #[default]
    File,
    /// In-memory storage.
    Memory,
}

/// Declared configuration for one persistent stream.
///
/// Declared once in configuration and reconciled against server state on
/// every bootstrap. Reconciliation only ever widens the subject set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamSpec {
    /// Stream name. Required.
    pub name: String,
    /// Subjects bound to the stream.
    pub subjects: Vec<String>,
    /// Retention policy.
    pub retention: RetentionPolicy,
    /// Discard policy.
    pub discard: DiscardPolicy,
    /// Storage backend.
    pub storage: StorageType,
    /// Maximum total size in bytes (-1 for unlimited).
    pub max_bytes: i64,
    /// Maximum message age; zero means unlimited.
    #[serde(deserialize_with = "serde_iso::option")]
    pub max_age: Option<Duration>,
    /// Maximum message count (-1 for unlimited).
    pub max_messages: i64,
    /// Replica count.
    pub replicas: usize,
    /// Duplicate-tracking window. Defaults to [`DEFAULT_DUPLICATE_WINDOW`].
    #[serde(deserialize_with = "serde_iso::option")]
    pub duplicate_window: Option<Duration>,
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            discard: DiscardPolicy::default(),
            storage: StorageType::default(),
            max_bytes: -1,
            max_age: None,
            max_messages: -1,
            replicas: 1,
            duplicate_window: None,
        }
    }
}

impl StreamSpec {
    /// The effective duplicate window, never zero.
    pub fn duplicate_window(&self) -> Duration {
        match self.duplicate_window {
            Some(window) if !window.is_zero() => window,
            _ => DEFAULT_DUPLICATE_WINDOW,
        }
    }
}
