//! Persistent-stream reconciliation.
//!
//! This module contains:
//! - `StreamStore` trait: the persistent-stream server surface
//! - `StreamReconciler`: makes server stream state match declared config
//! - consumer config merging: declared base + live base + overrides
//!
//! Reconciliation is idempotent and never narrows: declared subjects are
//! only ever added to a live stream, because streams are routinely shared by
//! deployments that each contribute their own subjects.

pub mod consumer;
pub mod publish;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::config::{ConsumerSpec, StreamSpec};

pub use consumer::{merge_consumer_config, ConsumerOverrides, MergeError};
pub use publish::StreamPublisher;
pub use stream::{ReconcileReport, StreamReconciler};

/// Token-wise subject match with `*` and `>` wildcards, the server's own
/// matching rules.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Errors from stream/consumer reconciliation. Contained per resource: one
/// broken stream never blocks reconciliation of its siblings.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Stream info fetch failed for a reason other than absence.
    #[error("lookup of stream '{stream}' failed: {message}")]
    Lookup {
        /// Stream name.
        stream: String,
        /// Failure description.
        message: String,
    },

    /// Stream creation failed.
    #[error("create of stream '{stream}' failed: {message}")]
    Create {
        /// Stream name.
        stream: String,
        /// Failure description.
        message: String,
    },

    /// Stream update failed.
    #[error("update of stream '{stream}' failed: {message}")]
    Update {
        /// Stream name.
        stream: String,
        /// Failure description.
        message: String,
    },

    /// Consumer creation/update failed.
    #[error("consumer '{consumer}' on stream '{stream}' failed: {message}")]
    Consumer {
        /// Stream name.
        stream: String,
        /// Durable name.
        consumer: String,
        /// Failure description.
        message: String,
    },

    /// Persistent publish failed or was never acknowledged.
    #[error("persistent publish to '{subject}' failed: {message}")]
    Publish {
        /// Target subject.
        subject: String,
        /// Failure description.
        message: String,
    },
}

/// Live state of one stream as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    /// Stream name.
    pub name: String,
    /// Subjects currently bound to the stream.
    pub subjects: Vec<String>,
}

/// Result of a stream info fetch. Absence is an expected outcome, not an
/// error, so it gets its own variant instead of error-code matching at call
/// sites.
#[derive(Debug)]
pub enum StreamLookup {
    /// The stream exists with the given live state.
    Found(StreamState),
    /// The stream does not exist.
    NotFound,
    /// The fetch itself failed; propagated to the caller.
    Error(ReconcileError),
}

/// Handles delivery of durable-consumer messages.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Process one message. `Ok` acknowledges it; `Err` leaves it
    /// unacknowledged for redelivery per the consumer's ack policy.
    async fn deliver(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The persistent-stream server surface for one connection/context.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Fetch live stream state by name.
    async fn lookup(&self, name: &str) -> StreamLookup;

    /// Create a stream with the full declared configuration.
    async fn create(&self, spec: &StreamSpec) -> Result<(), ReconcileError>;

    /// Replace the stream's subject set. Callers pass the widened union;
    /// this call never computes differences itself.
    async fn update_subjects(
        &self,
        spec: &StreamSpec,
        subjects: Vec<String>,
    ) -> Result<(), ReconcileError>;

    /// Fetch a live consumer and normalize it into the declared shape.
    /// `Ok(None)` means the server knows no such consumer.
    async fn consumer_info(
        &self,
        stream: &str,
        name: &str,
    ) -> Result<Option<ConsumerSpec>, ReconcileError>;

    /// Create or update a durable consumer on a stream.
    async fn apply_consumer(&self, stream: &str, spec: &ConsumerSpec)
        -> Result<(), ReconcileError>;

    /// Publish to a stream subject with acknowledgement confirmation,
    /// retried per the process-wide ack settings.
    async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<u64, ReconcileError>;

    /// Start delivering a durable consumer's messages to a handler. The
    /// consumer is materialized first (create-or-update), then a detached
    /// delivery loop feeds the handler with per-message error isolation.
    async fn consume(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<(), ReconcileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("orders.created", "orders.created"));
        assert!(subject_matches("orders.*", "orders.created"));
        assert!(subject_matches("orders.>", "orders.eu.created"));
        assert!(!subject_matches("orders.*", "orders.eu.created"));
        assert!(!subject_matches("orders.created", "orders"));
    }
}
