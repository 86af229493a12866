//! Idempotent stream reconciliation.

use tracing::{debug, info, warn};

use super::{ReconcileError, StreamLookup, StreamStore};
use crate::config::StreamSpec;

/// Outcome counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Streams created.
    pub created: usize,
    /// Streams whose subject set was widened.
    pub widened: usize,
    /// Streams already matching (no server call issued).
    pub unchanged: usize,
    /// Streams that failed and were skipped.
    pub failed: usize,
}

/// Makes server-side stream state match declared configuration.
///
/// Safe to run on every bootstrap: an already-converged stream produces no
/// server mutation at all.
pub struct StreamReconciler<'a> {
    store: &'a dyn StreamStore,
    connection: &'a str,
}

impl<'a> StreamReconciler<'a> {
    /// Reconciler for one connection's stream store.
    pub fn new(store: &'a dyn StreamStore, connection: &'a str) -> Self {
        Self { store, connection }
    }

    /// Reconcile every declared stream. Failures are logged per stream and
    /// never block the remaining streams.
    pub async fn reconcile_all(&self, declared: &[StreamSpec]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for spec in declared {
            match self.reconcile(spec).await {
                Ok(StreamOutcome::Created) => report.created += 1,
                Ok(StreamOutcome::Widened) => report.widened += 1,
                Ok(StreamOutcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    warn!(
                        connection = %self.connection,
                        stream = %spec.name,
                        error = %e,
                        "Stream reconciliation failed; continuing with remaining streams"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Reconcile one stream: create when absent, widen subjects when the
    /// declared set is not already covered, otherwise do nothing.
    pub async fn reconcile(&self, spec: &StreamSpec) -> Result<StreamOutcome, ReconcileError> {
        match self.store.lookup(&spec.name).await {
            StreamLookup::NotFound => {
                self.store.create(spec).await?;
                info!(
                    connection = %self.connection,
                    stream = %spec.name,
                    subjects = ?spec.subjects,
                    "Created stream"
                );
                Ok(StreamOutcome::Created)
            }
            StreamLookup::Found(live) => {
                let missing: Vec<String> = spec
                    .subjects
                    .iter()
                    .filter(|subject| !live.subjects.contains(subject))
                    .cloned()
                    .collect();

                if missing.is_empty() {
                    debug!(
                        connection = %self.connection,
                        stream = %spec.name,
                        "Stream already covers declared subjects"
                    );
                    return Ok(StreamOutcome::Unchanged);
                }

                // Union, preserving live order: co-tenant subjects stay put.
                let mut widened = live.subjects.clone();
                widened.extend(missing.iter().cloned());
                self.store.update_subjects(spec, widened).await?;
                info!(
                    connection = %self.connection,
                    stream = %spec.name,
                    added = ?missing,
                    "Widened stream subjects"
                );
                Ok(StreamOutcome::Widened)
            }
            StreamLookup::Error(e) => Err(e),
        }
    }
}

/// What one stream reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Stream was created.
    Created,
    /// Subject set was widened.
    Widened,
    /// No server mutation was needed.
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockStreamStore;

    fn spec(name: &str, subjects: &[&str]) -> StreamSpec {
        StreamSpec {
            name: name.into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_creates_absent_stream() {
        let store = MockStreamStore::new();
        let reconciler = StreamReconciler::new(&store, "default");

        let report = reconciler
            .reconcile_all(&[spec("orders", &["orders.>"])])
            .await;
        assert_eq!(report.created, 1);
        assert_eq!(store.update_calls().await, 0);
        assert_eq!(store.subjects("orders").await.unwrap(), vec!["orders.>"]);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let store = MockStreamStore::new();
        let reconciler = StreamReconciler::new(&store, "default");
        let declared = [spec("orders", &["orders.created", "orders.updated"])];

        let first = reconciler.reconcile_all(&declared).await;
        assert_eq!(first.created, 1);

        let second = reconciler.reconcile_all(&declared).await;
        assert_eq!(second.created, 0);
        assert_eq!(second.widened, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(store.update_calls().await, 0);
    }

    #[tokio::test]
    async fn test_widening_is_monotonic() {
        let store = MockStreamStore::new();
        store.seed_stream("orders", &["a", "b"]).await;
        let reconciler = StreamReconciler::new(&store, "default");

        let outcome = reconciler.reconcile(&spec("orders", &["b", "c"])).await;
        assert_eq!(outcome.unwrap(), StreamOutcome::Widened);
        assert_eq!(store.update_calls().await, 1);
        assert_eq!(store.subjects("orders").await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_lookup_error_propagates_but_does_not_block_siblings() {
        let store = MockStreamStore::new();
        store.fail_lookup_of("broken").await;
        let reconciler = StreamReconciler::new(&store, "default");

        let report = reconciler
            .reconcile_all(&[spec("broken", &["x"]), spec("orders", &["orders.>"])])
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
        assert!(store.subjects("orders").await.is_some());
    }
}
