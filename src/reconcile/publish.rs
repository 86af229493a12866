//! Publish-time stream reconciliation.
//!
//! A persistent publish must land on a stream that actually binds its
//! subject. Declared configuration can run ahead of server state (a new
//! subject shipped before the next full bootstrap), so the publisher checks
//! coverage on first use of each subject and widens the declared stream
//! once when needed. Verified subjects are cached so the steady-state
//! publish path makes no server calls beyond the publish itself.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::warn;

use super::{subject_matches, ReconcileError, StreamLookup, StreamReconciler, StreamStore};
use crate::config::StreamSpec;

/// Ack-confirmed publisher for one connection's declared streams.
pub struct StreamPublisher {
    store: Arc<dyn StreamStore>,
    connection: String,
    streams: Vec<StreamSpec>,
    // Subjects whose stream binding has been verified. Held across the
    // check-then-reconcile step so concurrent first publishes to one subject
    // issue at most one update.
    bound: Mutex<HashSet<String>>,
}

impl StreamPublisher {
    /// Publisher over a connection's stream store and declared streams.
    pub fn new(store: Arc<dyn StreamStore>, connection: &str, streams: Vec<StreamSpec>) -> Self {
        Self {
            store,
            connection: connection.to_string(),
            streams,
            bound: Mutex::new(HashSet::new()),
        }
    }

    /// Publish with acknowledgement confirmation, reconciling the subject's
    /// declared stream first if the server does not yet bind the subject.
    pub async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<u64, ReconcileError> {
        self.ensure_bound(subject).await?;
        self.store.publish(subject, headers, payload).await
    }

    async fn ensure_bound(&self, subject: &str) -> Result<(), ReconcileError> {
        let mut bound = self.bound.lock().await;
        if bound.contains(subject) {
            return Ok(());
        }

        let Some(spec) = self
            .streams
            .iter()
            .find(|s| s.subjects.iter().any(|p| subject_matches(p, subject)))
        else {
            warn!(
                connection = %self.connection,
                subject,
                "No declared stream binds this subject; publishing as-is"
            );
            bound.insert(subject.to_string());
            return Ok(());
        };

        let covered = match self.store.lookup(&spec.name).await {
            StreamLookup::Found(live) => live
                .subjects
                .iter()
                .any(|p| subject_matches(p, subject)),
            StreamLookup::NotFound => false,
            StreamLookup::Error(e) => return Err(e),
        };
        if !covered {
            StreamReconciler::new(self.store.as_ref(), &self.connection)
                .reconcile(spec)
                .await?;
        }

        bound.insert(subject.to_string());
        Ok(())
    }
}
