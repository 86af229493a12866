//! Transport seam.
//!
//! This module contains:
//! - `MessageTransport` trait: core publish/request/subscribe primitives
//! - `Connector` trait: opens one connection from its resolved descriptor
//! - Implementations: NATS (`async-nats`), in-memory mock
//!
//! The rest of the runtime only ever talks to these traits, so every piece
//! of bootstrap, reconciliation, and dispatch logic runs unchanged against
//! the in-memory broker in tests.

pub mod mock;
pub mod nats;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::config::{ConnectionConfig, JetStreamContextConfig};
use crate::reconcile::StreamStore;

pub use mock::{MockBroker, MockConnector, MockStreamStore, MockTransport};
pub use nats::{NatsConnector, NatsTransport};

/// Errors from transport primitives.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection establishment failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Publish failed.
    #[error("publish to '{subject}' failed: {message}")]
    Publish {
        /// Target subject.
        subject: String,
        /// Failure description.
        message: String,
    },

    /// Request failed (distinct from a timeout, which the caller applies).
    #[error("request to '{subject}' failed: {message}")]
    Request {
        /// Target subject.
        subject: String,
        /// Failure description.
        message: String,
    },

    /// The server reported that nothing is subscribed to the request
    /// subject. Dispatch treats this the same as an expired response window.
    #[error("no responders for subject '{subject}'")]
    NoResponders {
        /// Target subject.
        subject: String,
    },

    /// Subscription could not be created.
    #[error("subscribe to '{subject}' failed: {message}")]
    Subscribe {
        /// Target subject.
        subject: String,
        /// Failure description.
        message: String,
    },
}

/// One message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Reply address, when the sender expects a response.
    pub reply: Option<String>,
}

/// Header carrying the deduplication identity of a published message.
pub const DEDUP_HEADER: &str = "Nats-Msg-Id";

/// Core messaging primitives for one live connection.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Publish without expecting a reply.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Publish with message headers (e.g. the dedup-uniqueness header).
    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Send a request and await a single reply. No timeout is applied here;
    /// callers bound the wait with their resolved response timeout.
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, TransportError>;

    /// Request with message headers (e.g. the dedup-uniqueness header).
    /// Backends without header support carry the request without them.
    async fn request_with_headers(
        &self,
        subject: &str,
        _headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        self.request(subject, payload).await
    }

    /// Create one subscription, optionally queue-grouped. Messages arrive in
    /// backend order; the returned stream ends when the subscription closes.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<BoxStream<'static, InboundMessage>, TransportError>;

    /// Flush buffered outbound messages.
    async fn flush(&self) -> Result<(), TransportError>;

    /// Open a JetStream view of this connection with the given context
    /// options. Cheap; the registry caches the result per named context.
    fn jetstream_context(&self, options: &JetStreamContextConfig) -> Arc<dyn StreamStore>;
}

/// A live connection produced by a [`Connector`].
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Connection name from configuration.
    pub name: String,
    /// Core transport primitives.
    pub transport: Arc<dyn MessageTransport>,
}

impl ConnectionHandle {
    /// JetStream view with default context options.
    pub fn jetstream(&self) -> Arc<dyn StreamStore> {
        self.transport
            .jetstream_context(&JetStreamContextConfig::default())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Opens transport connections from resolved descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection. Errors are contained by the coordinator: a
    /// failure here means the connection stays absent from the registry.
    async fn connect(&self, config: &ConnectionConfig)
        -> Result<ConnectionHandle, TransportError>;
}
