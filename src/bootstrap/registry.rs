//! Shared registry of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::JetStreamContextConfig;
use crate::reconcile::{StreamPublisher, StreamStore};
use crate::transport::ConnectionHandle;

/// Live connections by name, plus their cached JetStream contexts and
/// persistent publishers.
///
/// A connection that failed bootstrap is simply absent; callers observe that
/// as an unavailable connection rather than a poisoned handle.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    contexts: Mutex<HashMap<(String, String), Arc<dyn StreamStore>>>,
    publishers: RwLock<HashMap<String, Arc<StreamPublisher>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an established connection.
    pub async fn insert(&self, handle: ConnectionHandle) {
        self.connections
            .write()
            .await
            .insert(handle.name.clone(), handle);
    }

    /// Live connection by name.
    pub async fn get(&self, name: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(name).cloned()
    }

    /// Names of established connections.
    pub async fn names(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Number of established connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// JetStream context for a connection, cached per context name so every
    /// caller shares one store.
    pub async fn context(
        &self,
        connection: &str,
        options: &JetStreamContextConfig,
    ) -> Option<Arc<dyn StreamStore>> {
        let mut contexts = self.contexts.lock().await;
        let key = (connection.to_string(), options.name.clone());
        if let Some(store) = contexts.get(&key) {
            return Some(store.clone());
        }
        let handle = self.get(connection).await?;
        let store = handle.transport.jetstream_context(options);
        contexts.insert(key, store.clone());
        Some(store)
    }

    /// Record a connection's persistent publisher. Bootstrap installs one
    /// per connection with declared streams.
    pub async fn install_publisher(&self, connection: &str, publisher: StreamPublisher) {
        self.publishers
            .write()
            .await
            .insert(connection.to_string(), Arc::new(publisher));
    }

    /// Persistent publisher for a connection, `None` when the connection
    /// has no declared streams or never came up.
    pub async fn publisher(&self, connection: &str) -> Option<Arc<StreamPublisher>> {
        self.publishers.read().await.get(connection).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBroker, MockTransport};

    fn handle(name: &str) -> ConnectionHandle {
        ConnectionHandle {
            name: name.to_string(),
            transport: Arc::new(MockTransport::new(MockBroker::new())),
        }
    }

    #[tokio::test]
    async fn test_absent_connection_is_none() {
        let registry = Registry::new();
        assert!(registry.get("default").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_context_is_cached_per_name() {
        let registry = Registry::new();
        registry.insert(handle("default")).await;

        let options = JetStreamContextConfig::default();
        let first = registry.context("default", &options).await.unwrap();
        let second = registry.context("default", &options).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let named = JetStreamContextConfig {
            name: "archival".into(),
            ..Default::default()
        };
        let other = registry.context("default", &named).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn test_context_for_absent_connection_is_none() {
        let registry = Registry::new();
        let options = JetStreamContextConfig::default();
        assert!(registry.context("ghost", &options).await.is_none());
    }

    #[tokio::test]
    async fn test_publisher_absent_until_installed() {
        let registry = Registry::new();
        assert!(registry.publisher("default").await.is_none());

        registry.insert(handle("default")).await;
        let store = registry
            .context("default", &JetStreamContextConfig::default())
            .await
            .unwrap();
        registry
            .install_publisher("default", StreamPublisher::new(store, "default", Vec::new()))
            .await;
        assert!(registry.publisher("default").await.is_some());
    }
}
