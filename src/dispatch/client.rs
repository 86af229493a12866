//! Outbound dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use super::binding::{resolve_bindings, ClientSpec, ResolvedBinding};
use super::DispatchError;
use crate::bootstrap::Registry;
use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::GeneralConfig;
use crate::transport::{ConnectionHandle, TransportError, DEDUP_HEADER};

/// Per-call overrides. Everything unset falls back to the resolved binding.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the binding's subject.
    pub subject: Option<String>,
    /// Override the binding's connection.
    pub connection: Option<String>,
    /// Override the response window.
    pub timeout: Option<Duration>,
    /// Deduplication identity attached as a message header, on both the
    /// publish and request paths.
    pub dedup_id: Option<String>,
}

/// A no-responders status is the server saying nobody will ever answer;
/// surface it the way an expired response window is surfaced.
fn invocation_error(method: &str, window: Duration, error: TransportError) -> DispatchError {
    match error {
        TransportError::NoResponders { subject } => DispatchError::Timeout {
            subject,
            elapsed: window,
        },
        other => DispatchError::Invocation {
            method: method.to_string(),
            detail: other.to_string(),
        },
    }
}

/// Typed outbound client over a resolved dispatch table.
///
/// Cheap to clone; clones share the registry and the immutable table.
pub struct DispatchClient<C: PayloadCodec = JsonCodec> {
    registry: Arc<Registry>,
    bindings: Arc<HashMap<String, ResolvedBinding>>,
    codec: C,
}

impl<C: PayloadCodec> Clone for DispatchClient<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            bindings: self.bindings.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl DispatchClient<JsonCodec> {
    /// Client with the default JSON codec.
    pub fn new(
        registry: Arc<Registry>,
        spec: &ClientSpec,
        general: &GeneralConfig,
    ) -> Result<Self, DispatchError> {
        Self::with_codec(registry, spec, general, JsonCodec)
    }
}

impl<C: PayloadCodec> DispatchClient<C> {
    /// Client with a custom codec. Resolution runs here, once; any invalid
    /// binding fails construction.
    pub fn with_codec(
        registry: Arc<Registry>,
        spec: &ClientSpec,
        general: &GeneralConfig,
        codec: C,
    ) -> Result<Self, DispatchError> {
        let bindings = resolve_bindings(spec, general)?
            .into_iter()
            .map(|binding| (binding.method.clone(), binding))
            .collect();
        Ok(Self {
            registry,
            bindings: Arc::new(bindings),
            codec,
        })
    }

    fn binding(&self, method: &str) -> Result<&ResolvedBinding, DispatchError> {
        self.bindings.get(method).ok_or_else(|| DispatchError::Binding {
            method: method.to_string(),
            detail: "method is not in the dispatch table".to_string(),
        })
    }

    async fn connection(&self, name: &str) -> Result<ConnectionHandle, DispatchError> {
        self.registry
            .get(name)
            .await
            .ok_or_else(|| DispatchError::Unavailable {
                connection: name.to_string(),
            })
    }

    /// Fire-and-forget publish of a typed payload.
    pub async fn notify<T: Serialize>(
        &self,
        method: &str,
        payload: &T,
    ) -> Result<(), DispatchError> {
        self.notify_with(method, payload, CallOptions::default()).await
    }

    /// Fire-and-forget publish with per-call overrides.
    pub async fn notify_with<T: Serialize>(
        &self,
        method: &str,
        payload: &T,
        options: CallOptions,
    ) -> Result<(), DispatchError> {
        let binding = self.binding(method)?;
        let subject = options.subject.as_deref().unwrap_or(&binding.subject);
        let connection = options.connection.as_deref().unwrap_or(&binding.connection);

        let bytes = self
            .codec
            .encode(payload)
            .map_err(|e| DispatchError::Serialization {
                subject: subject.to_string(),
                detail: e.to_string(),
            })?;

        let handle = self.connection(connection).await?;
        let outcome = match options.dedup_id {
            Some(id) => {
                handle
                    .transport
                    .publish_with_headers(
                        subject,
                        vec![(DEDUP_HEADER.to_string(), id)],
                        bytes,
                    )
                    .await
            }
            None => handle.transport.publish(subject, bytes).await,
        };
        outcome.map_err(|e| DispatchError::Invocation {
            method: method.to_string(),
            detail: e.to_string(),
        })
    }

    /// Synchronous request/reply bounded by the binding's response window.
    pub async fn call<T, R>(&self, method: &str, payload: &T) -> Result<R, DispatchError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.call_with(method, payload, CallOptions::default()).await
    }

    /// Request/reply with per-call overrides.
    pub async fn call_with<T, R>(
        &self,
        method: &str,
        payload: &T,
        options: CallOptions,
    ) -> Result<R, DispatchError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let binding = self.binding(method)?;
        let subject = options
            .subject
            .clone()
            .unwrap_or_else(|| binding.subject.clone());
        let connection = options.connection.as_deref().unwrap_or(&binding.connection);
        let window = options.timeout.unwrap_or(binding.response_timeout);

        let bytes = self
            .codec
            .encode(payload)
            .map_err(|e| DispatchError::Serialization {
                subject: subject.clone(),
                detail: e.to_string(),
            })?;

        let handle = self.connection(connection).await?;
        debug!(method, subject = %subject, timeout = ?window, "Dispatching request");

        let headers = options
            .dedup_id
            .map(|id| vec![(DEDUP_HEADER.to_string(), id)]);
        let request = async {
            match headers {
                Some(headers) => {
                    handle
                        .transport
                        .request_with_headers(&subject, headers, bytes)
                        .await
                }
                None => handle.transport.request(&subject, bytes).await,
            }
        };
        let reply = timeout(window, request)
            .await
            .map_err(|_| DispatchError::Timeout {
                subject: subject.clone(),
                elapsed: window,
            })?
            .map_err(|e| invocation_error(method, window, e))?;

        self.codec
            .decode(&reply)
            .map_err(|e| DispatchError::Serialization {
                subject,
                detail: e.to_string(),
            })
    }

    /// Request/reply running on its own task. The payload is encoded before
    /// the task starts, so encoding failures surface immediately.
    pub fn call_detached<T, R>(
        &self,
        method: &str,
        payload: &T,
    ) -> Result<JoinHandle<Result<R, DispatchError>>, DispatchError>
    where
        T: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let binding = self.binding(method)?.clone();
        let bytes = self
            .codec
            .encode(payload)
            .map_err(|e| DispatchError::Serialization {
                subject: binding.subject.clone(),
                detail: e.to_string(),
            })?;

        let client = self.clone();
        let method = method.to_string();
        Ok(tokio::spawn(async move {
            let handle = client.connection(&binding.connection).await?;
            let reply = timeout(
                binding.response_timeout,
                handle.transport.request(&binding.subject, bytes),
            )
            .await
            .map_err(|_| DispatchError::Timeout {
                subject: binding.subject.clone(),
                elapsed: binding.response_timeout,
            })?
            .map_err(|e| invocation_error(&method, binding.response_timeout, e))?;
            client
                .codec
                .decode(&reply)
                .map_err(|e| DispatchError::Serialization {
                    subject: binding.subject,
                    detail: e.to_string(),
                })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JetStreamContextConfig;
    use crate::dispatch::binding::BindingDescriptor;
    use crate::reconcile::StreamStore;
    use crate::transport::{
        ConnectionHandle, InboundMessage, MessageTransport, MockBroker, MockStreamStore,
        MockTransport,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;

    /// Transport stub that records request headers and can report the
    /// server's no-responders status.
    #[derive(Default)]
    struct RecordingTransport {
        no_responders: bool,
        headers: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<(), TransportError> {
            Ok(())
        }

        async fn publish_with_headers(
            &self,
            _subject: &str,
            _headers: Vec<(String, String)>,
            _payload: Bytes,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, TransportError> {
            self.request_with_headers(subject, Vec::new(), payload).await
        }

        async fn request_with_headers(
            &self,
            subject: &str,
            headers: Vec<(String, String)>,
            _payload: Bytes,
        ) -> Result<Bytes, TransportError> {
            if self.no_responders {
                return Err(TransportError::NoResponders {
                    subject: subject.to_string(),
                });
            }
            self.headers.lock().unwrap().extend(headers);
            Ok(Bytes::from_static(b"{}"))
        }

        async fn subscribe(
            &self,
            _subject: &str,
            _queue_group: Option<&str>,
        ) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn flush(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn jetstream_context(&self, _options: &JetStreamContextConfig) -> Arc<dyn StreamStore> {
            Arc::new(MockStreamStore::new())
        }
    }

    async fn registry_over(transport: Arc<RecordingTransport>) -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .insert(ConnectionHandle {
                name: "default".into(),
                transport,
            })
            .await;
        registry
    }

    fn spec(method: &str, subject: &str) -> ClientSpec {
        ClientSpec {
            connection: None,
            methods: vec![BindingDescriptor {
                method: method.into(),
                subject: Some(subject.into()),
                ..Default::default()
            }],
        }
    }

    async fn registry_with_default() -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .insert(ConnectionHandle {
                name: "default".into(),
                transport: Arc::new(MockTransport::new(MockBroker::new())),
            })
            .await;
        registry
    }

    #[tokio::test]
    async fn test_unknown_method_is_a_binding_error() {
        let registry = registry_with_default().await;
        let client =
            DispatchClient::new(registry, &spec("ping", "svc.ping"), &GeneralConfig::default())
                .unwrap();
        let result = client.notify("pong", &serde_json::json!({})).await;
        assert!(matches!(result, Err(DispatchError::Binding { .. })));
    }

    #[tokio::test]
    async fn test_missing_connection_is_unavailable() {
        let registry = Registry::new();
        let client =
            DispatchClient::new(registry, &spec("ping", "svc.ping"), &GeneralConfig::default())
                .unwrap();
        let result = client.notify("ping", &serde_json::json!({})).await;
        assert!(matches!(
            result,
            Err(DispatchError::Unavailable { connection }) if connection == "default"
        ));
    }

    #[tokio::test]
    async fn test_call_times_out_without_responder() {
        let registry = registry_with_default().await;
        let general = GeneralConfig {
            response_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let client = DispatchClient::new(registry, &spec("ping", "svc.ping"), &general).unwrap();

        let result: Result<serde_json::Value, _> =
            client.call("ping", &serde_json::json!({"n": 1})).await;
        assert!(matches!(result, Err(DispatchError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_no_responders_surfaces_as_timeout() {
        let transport = Arc::new(RecordingTransport {
            no_responders: true,
            ..Default::default()
        });
        let registry = registry_over(transport).await;
        let client =
            DispatchClient::new(registry, &spec("ping", "svc.ping"), &GeneralConfig::default())
                .unwrap();

        let result: Result<serde_json::Value, _> =
            client.call("ping", &serde_json::json!({})).await;
        assert!(matches!(
            result,
            Err(DispatchError::Timeout { subject, .. }) if subject == "svc.ping"
        ));
    }

    #[tokio::test]
    async fn test_dedup_id_is_attached_on_the_request_path() {
        let transport = Arc::new(RecordingTransport::default());
        let registry = registry_over(transport.clone()).await;
        let client =
            DispatchClient::new(registry, &spec("ping", "svc.ping"), &GeneralConfig::default())
                .unwrap();

        let options = CallOptions {
            dedup_id: Some("call-1".into()),
            ..Default::default()
        };
        let _: serde_json::Value = client
            .call_with("ping", &serde_json::json!({}), options)
            .await
            .unwrap();

        let seen = transport.headers.lock().unwrap().clone();
        assert_eq!(seen, vec![(DEDUP_HEADER.to_string(), "call-1".to_string())]);
    }
}
