//! Inbound dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::binding::{BindingState, ResolvedBinding};
use super::DispatchError;
use crate::bootstrap::Registry;
use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::GeneralConfig;
use crate::transport::MessageTransport;

/// Typed handler for one inbound binding.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Decoded inbound payload type.
    type Request: DeserializeOwned + Send;
    /// Reply payload type. Use `()` for pure event handlers.
    type Reply: Serialize + Send + Sync;

    /// Process one request. `Ok(Some(reply))` is published to the reply
    /// address when the sender provided one; `Ok(None)` replies nothing.
    async fn handle(
        &self,
        request: Self::Request,
    ) -> Result<Option<Self::Reply>, Box<dyn std::error::Error + Send + Sync>>;
}

struct ListenerInner {
    tasks: Vec<(String, JoinHandle<()>)>,
    transports: Vec<Arc<dyn MessageTransport>>,
}

/// Move a binding's state, honoring the legal lifecycle steps. Re-asserting
/// the current state is a no-op; anything else illegal is ignored, which
/// keeps `Failed` terminal no matter who writes.
async fn transition(
    states: &Mutex<HashMap<String, BindingState>>,
    method: &str,
    next: BindingState,
) {
    let mut states = states.lock().await;
    let current = states
        .get(method)
        .copied()
        .unwrap_or(BindingState::Unbound);
    if current == next || current.can_become(next) {
        states.insert(method.to_string(), next);
    } else {
        debug!(method, ?current, ?next, "Ignoring illegal binding state transition");
    }
}

/// Subscribes resolved bindings and feeds messages to typed handlers.
///
/// Per-message containment: a payload that fails to decode or a handler
/// error is logged and skipped; the subscription keeps running.
pub struct DispatchListener<C: PayloadCodec = JsonCodec> {
    registry: Arc<Registry>,
    codec: C,
    general: GeneralConfig,
    states: Arc<Mutex<HashMap<String, BindingState>>>,
    inner: Mutex<ListenerInner>,
}

impl DispatchListener<JsonCodec> {
    /// Listener with the default JSON codec.
    pub fn new(registry: Arc<Registry>, general: GeneralConfig) -> Self {
        Self::with_codec(registry, general, JsonCodec)
    }
}

impl<C: PayloadCodec> DispatchListener<C> {
    pub fn with_codec(registry: Arc<Registry>, general: GeneralConfig, codec: C) -> Self {
        Self {
            registry,
            codec,
            general,
            states: Arc::new(Mutex::new(HashMap::new())),
            inner: Mutex::new(ListenerInner {
                tasks: Vec::new(),
                transports: Vec::new(),
            }),
        }
    }

    /// Current lifecycle state of one binding.
    pub async fn state(&self, method: &str) -> BindingState {
        self.states
            .lock()
            .await
            .get(method)
            .copied()
            .unwrap_or(BindingState::Unbound)
    }

    async fn set_state(&self, method: &str, state: BindingState) {
        transition(&self.states, method, state).await;
    }

    /// Subscribe a binding and start dispatching to its handler.
    ///
    /// Establishment failures are terminal for the binding: its state moves
    /// to `Failed` and the error is returned for the caller to report.
    pub async fn register<H: RequestHandler>(
        &self,
        binding: &ResolvedBinding,
        handler: Arc<H>,
    ) -> Result<(), DispatchError> {
        if self.state(&binding.method).await == BindingState::Failed {
            return Err(DispatchError::Binding {
                method: binding.method.clone(),
                detail: "binding previously failed; failure is terminal".to_string(),
            });
        }
        self.set_state(&binding.method, BindingState::Resolving).await;

        let Some(handle) = self.registry.get(&binding.connection).await else {
            self.set_state(&binding.method, BindingState::Failed).await;
            return Err(DispatchError::Unavailable {
                connection: binding.connection.clone(),
            });
        };

        let subscription = match handle
            .transport
            .subscribe(&binding.subject, binding.queue_group.as_deref())
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                self.set_state(&binding.method, BindingState::Failed).await;
                return Err(DispatchError::Invocation {
                    method: binding.method.clone(),
                    detail: e.to_string(),
                });
            }
        };

        self.set_state(&binding.method, BindingState::Bound).await;
        info!(
            method = %binding.method,
            subject = %binding.subject,
            connection = %binding.connection,
            queue_group = ?binding.queue_group,
            "Binding established"
        );

        let codec = self.codec.clone();
        let states = self.states.clone();
        let transport = handle.transport.clone();
        let method = binding.method.clone();
        let subject = binding.subject.clone();
        let connection = binding.connection.clone();

        let task = tokio::spawn(async move {
            let mut subscription = subscription;
            while let Some(message) = subscription.next().await {
                transition(&states, &method, BindingState::Active).await;

                let request: H::Request = match codec.decode(&message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(
                            method = %method,
                            subject = %message.subject,
                            connection = %connection,
                            error = %e,
                            "Dropping undecodable message"
                        );
                        continue;
                    }
                };

                match handler.handle(request).await {
                    Ok(Some(reply)) => {
                        let Some(reply_subject) = &message.reply else {
                            continue;
                        };
                        let bytes = match codec.encode(&reply) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(method = %method, error = %e, "Failed to encode reply");
                                continue;
                            }
                        };
                        if let Err(e) = transport.publish(reply_subject, bytes).await {
                            warn!(method = %method, error = %e, "Failed to publish reply");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            method = %method,
                            subject = %message.subject,
                            error = %e,
                            "Handler failed; message dropped"
                        );
                    }
                }
            }
            debug!(method = %method, subject = %subject, "Subscription closed");
        });

        let mut inner = self.inner.lock().await;
        inner.tasks.push((binding.method.clone(), task));
        inner.transports.push(handle.transport);
        Ok(())
    }

    /// Flush outbound buffers within the drain budget, then stop every
    /// dispatch task.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;

        let flush_all = async {
            for transport in &inner.transports {
                if let Err(e) = transport.flush().await {
                    warn!(error = %e, "Flush during drain failed");
                }
            }
        };
        if timeout(self.general.drain_timeout, flush_all).await.is_err() {
            warn!(budget = ?self.general.drain_timeout, "Drain budget exhausted");
        }

        for (method, task) in inner.tasks.drain(..) {
            task.abort();
            debug!(method = %method, "Dispatch task stopped");
        }
        inner.transports.clear();
    }
}
