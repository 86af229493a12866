//! Connection bootstrap.
//!
//! This module contains:
//! - `Registry`: live connections and their cached JetStream contexts
//! - `ConnectionCoordinator`: concurrent connection establishment under a
//!   shared wait budget
//! - `bootstrap`: the full startup pass — connect, reconcile streams, apply
//!   declared consumers
//!
//! Bootstrap is containment-first: one connection failing to come up, one
//! stream failing to reconcile, or one consumer failing to apply never
//! prevents the rest of the process from starting. What failed is logged;
//! what succeeded is in the registry.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, JetStreamContextConfig};
use crate::reconcile::{merge_consumer_config, StreamPublisher, StreamReconciler};
use crate::transport::Connector;

pub use registry::Registry;

/// Establishes every configured connection concurrently.
pub struct ConnectionCoordinator {
    connector: Arc<dyn Connector>,
}

impl ConnectionCoordinator {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Connect every descriptor in parallel, inserting successes into the
    /// registry.
    ///
    /// The overall wait is bounded by the largest single connection budget
    /// (per-address timeout times address count): a slow or dead server
    /// delays startup by at most that budget, and stragglers past it are
    /// abandoned. Returns the number of established connections.
    pub async fn establish_all(
        &self,
        configs: &HashMap<String, ConnectionConfig>,
        registry: &Registry,
    ) -> usize {
        let budget = configs
            .values()
            .map(ConnectionConfig::connect_budget)
            .max()
            .unwrap_or(Duration::ZERO);

        let mut attempts = JoinSet::new();
        for config in configs.values().cloned() {
            let connector = self.connector.clone();
            attempts.spawn(async move {
                let name = config.name.clone();
                (name, connector.connect(&config).await)
            });
        }

        let mut established = 0;
        let drain = async {
            while let Some(joined) = attempts.join_next().await {
                match joined {
                    Ok((_, Ok(handle))) => {
                        registry.insert(handle).await;
                        established += 1;
                    }
                    Ok((name, Err(e))) => {
                        warn!(connection = %name, error = %e, "Connection failed to establish");
                    }
                    Err(e) => {
                        warn!(error = %e, "Connection attempt panicked");
                    }
                }
            }
        };

        if timeout(budget, drain).await.is_err() {
            warn!(
                budget = ?budget,
                "Bootstrap budget exhausted; abandoning unfinished connections"
            );
            attempts.abort_all();
        }

        info!(
            established,
            configured = configs.len(),
            "Connection bootstrap finished"
        );
        established
    }
}

/// Full startup pass: establish connections, reconcile declared streams,
/// apply declared consumers, and install each connection's persistent
/// publisher, each layer contained per resource.
pub async fn bootstrap(
    connector: Arc<dyn Connector>,
    connections: &HashMap<String, ConnectionConfig>,
) -> Arc<Registry> {
    let registry = Registry::new();
    let coordinator = ConnectionCoordinator::new(connector);
    coordinator.establish_all(connections, &registry).await;

    for (name, config) in connections {
        if config.streams.is_empty() && config.consumer_configuration.is_empty() {
            continue;
        }
        let Some(store) = registry
            .context(name, &JetStreamContextConfig::default())
            .await
        else {
            continue;
        };

        let report = StreamReconciler::new(store.as_ref(), name)
            .reconcile_all(&config.streams)
            .await;
        info!(
            connection = %name,
            created = report.created,
            widened = report.widened,
            unchanged = report.unchanged,
            failed = report.failed,
            "Stream reconciliation finished"
        );

        for block in &config.consumer_configuration {
            for declared in &block.consumers {
                let merged = match merge_consumer_config(
                    &declared.name,
                    &block.stream,
                    &block.consumers,
                    store.as_ref(),
                    None,
                )
                .await
                {
                    Ok(Some(spec)) => spec,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(
                            connection = %name,
                            stream = %block.stream,
                            consumer = %declared.name,
                            error = %e,
                            "Consumer merge failed"
                        );
                        continue;
                    }
                };
                if let Err(e) = store.apply_consumer(&block.stream, &merged).await {
                    warn!(
                        connection = %name,
                        stream = %block.stream,
                        consumer = %merged.name,
                        error = %e,
                        "Consumer apply failed"
                    );
                }
            }
        }

        if !config.streams.is_empty() {
            registry
                .install_publisher(
                    name,
                    StreamPublisher::new(store.clone(), name, config.streams.clone()),
                )
                .await;
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConnection;
    use crate::transport::{MockBroker, MockConnector};

    fn config(name: &str, timeout: Duration) -> ConnectionConfig {
        let mut config = ConnectionConfig::from_raw(name.to_string(), RawConnection::default());
        config.connection_timeout = timeout;
        config
    }

    #[tokio::test]
    async fn test_failure_of_one_connection_is_contained() {
        let broker = MockBroker::new();
        let connector = MockConnector::new(broker);
        connector.fail_connection("edge").await;
        let connector = Arc::new(connector);

        let configs = HashMap::from([
            ("core".to_string(), config("core", Duration::from_secs(1))),
            ("edge".to_string(), config("edge", Duration::from_secs(1))),
        ]);

        let registry = Registry::new();
        let established = ConnectionCoordinator::new(connector)
            .establish_all(&configs, &registry)
            .await;
        assert_eq!(established, 1);
        assert!(registry.get("core").await.is_some());
        assert!(registry.get("edge").await.is_none());
    }

    // Paused virtual time keeps the budget cutover deterministic under
    // parallel test load.
    #[tokio::test(start_paused = true)]
    async fn test_straggler_past_budget_is_abandoned() {
        let broker = MockBroker::new();
        let connector = MockConnector::new(broker);
        connector
            .delay_connection("slow", Duration::from_secs(5))
            .await;
        let connector = Arc::new(connector);

        let configs = HashMap::from([
            ("fast".to_string(), config("fast", Duration::from_millis(100))),
            ("slow".to_string(), config("slow", Duration::from_millis(100))),
        ]);

        let registry = Registry::new();
        let started = tokio::time::Instant::now();
        let established = ConnectionCoordinator::new(connector)
            .establish_all(&configs, &registry)
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(established, 1);
        assert!(registry.get("slow").await.is_none());
    }
}
