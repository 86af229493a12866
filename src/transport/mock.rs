//! In-memory transport for tests.
//!
//! A [`MockBroker`] routes core messages between [`MockTransport`] handles
//! the way a server would, including queue groups and request/reply inboxes.
//! [`MockStreamStore`] models the persistent-stream surface with seedable
//! state and failure injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use super::{
    ConnectionHandle, Connector, InboundMessage, MessageTransport, TransportError, DEDUP_HEADER,
};
use crate::config::{ConnectionConfig, ConsumerSpec, JetStreamContextConfig, StreamSpec};
use crate::reconcile::{
    subject_matches, ReconcileError, StreamHandler, StreamLookup, StreamState, StreamStore,
};

struct Subscription {
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Vec<Subscription>,
    pending_replies: HashMap<String, oneshot::Sender<Bytes>>,
    round_robin: HashMap<String, usize>,
    inbox_seq: u64,
}

/// Routes messages between mock transports like a server would.
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.subscriptions.push(Subscription {
            pattern: pattern.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender,
        });
        receiver
    }

    async fn publish(&self, subject: &str, payload: Bytes, reply: Option<String>) {
        let mut state = self.state.lock().await;

        if let Some(waiter) = state.pending_replies.remove(subject) {
            let _ = waiter.send(payload);
            return;
        }

        state.subscriptions.retain(|sub| !sub.sender.is_closed());

        let message = InboundMessage {
            subject: subject.to_string(),
            payload,
            reply,
        };

        // Plain subscribers each get a copy; queue groups get one member,
        // rotated per group.
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, sub) in state.subscriptions.iter().enumerate() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups.entry(group.clone()).or_default().push(index),
                None => {
                    let _ = sub.sender.send(message.clone());
                }
            }
        }
        for (group, members) in groups {
            let turn = state.round_robin.entry(group).or_insert(0);
            let chosen = members[*turn % members.len()];
            *turn += 1;
            let _ = state.subscriptions[chosen].sender.send(message.clone());
        }
    }

    /// Publish with a fresh reply inbox and wait for the response. When no
    /// responder exists the future never resolves; callers apply their own
    /// timeout, exactly as with a live server.
    async fn request(&self, subject: &str, payload: Bytes) -> Bytes {
        let (inbox, receiver) = {
            let mut state = self.state.lock().await;
            state.inbox_seq += 1;
            let inbox = format!("_INBOX.mock.{}", state.inbox_seq);
            let (sender, receiver) = oneshot::channel();
            state.pending_replies.insert(inbox.clone(), sender);
            (inbox, receiver)
        };

        self.publish(subject, payload, Some(inbox)).await;

        match receiver.await {
            Ok(reply) => reply,
            Err(_) => futures::future::pending().await,
        }
    }
}

/// Core transport backed by a shared [`MockBroker`].
pub struct MockTransport {
    broker: Arc<MockBroker>,
    stores: std::sync::Mutex<HashMap<String, Arc<MockStreamStore>>>,
}

impl MockTransport {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        Self {
            broker,
            stores: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.broker.publish(subject, payload, None).await;
        Ok(())
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        _headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.broker.publish(subject, payload, None).await;
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        Ok(self.broker.request(subject, payload).await)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
        let receiver = self.broker.subscribe(subject, queue_group).await;
        Ok(Box::pin(futures::stream::unfold(
            receiver,
            |mut receiver| async move { receiver.recv().await.map(|msg| (msg, receiver)) },
        )))
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn jetstream_context(&self, options: &JetStreamContextConfig) -> Arc<dyn StreamStore> {
        let mut stores = self.stores.lock().unwrap();
        stores
            .entry(options.name.clone())
            .or_insert_with(|| Arc::new(MockStreamStore::default()))
            .clone()
    }
}

/// Opens mock connections, with per-name failure and delay injection.
pub struct MockConnector {
    broker: Arc<MockBroker>,
    failing: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl MockConnector {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        Self {
            broker,
            failing: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    /// Make connects for `name` fail.
    pub async fn fail_connection(&self, name: &str) {
        self.failing.lock().await.push(name.to_string());
    }

    /// Make connects for `name` take at least `delay`.
    pub async fn delay_connection(&self, name: &str, delay: Duration) {
        self.delays.lock().await.insert(name.to_string(), delay);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionHandle, TransportError> {
        if let Some(delay) = self.delays.lock().await.get(&config.name).copied() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().await.contains(&config.name) {
            return Err(TransportError::Connect(format!(
                "mock connection '{}' configured to fail",
                config.name
            )));
        }
        Ok(ConnectionHandle {
            name: config.name.clone(),
            transport: Arc::new(MockTransport::new(self.broker.clone())),
        })
    }
}

struct MockStream {
    subjects: Vec<String>,
    consumers: Vec<ConsumerSpec>,
}

type HandlerEntry = (String, String, Arc<dyn StreamHandler>);

#[derive(Default)]
struct StoreState {
    streams: HashMap<String, MockStream>,
    failing_lookups: Vec<String>,
    update_calls: usize,
    sequence: u64,
    seen_ids: HashMap<String, u64>,
    published: Vec<(String, Bytes)>,
    // (stream, filter subject, handler)
    handlers: Vec<HandlerEntry>,
}

/// Seedable in-memory persistent-stream server.
#[derive(Default)]
pub struct MockStreamStore {
    state: Mutex<StoreState>,
}

impl MockStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pre-existing stream with the given live subjects.
    pub async fn seed_stream(&self, name: &str, subjects: &[&str]) {
        let mut state = self.state.lock().await;
        state.streams.insert(
            name.to_string(),
            MockStream {
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                consumers: Vec::new(),
            },
        );
    }

    /// Seed a pre-existing consumer on a stream, creating the stream as
    /// needed.
    pub async fn seed_consumer(&self, stream: &str, spec: ConsumerSpec) {
        let mut state = self.state.lock().await;
        state
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| MockStream {
                subjects: Vec::new(),
                consumers: Vec::new(),
            })
            .consumers
            .push(spec);
    }

    /// Make lookups of `name` fail with an injected error.
    pub async fn fail_lookup_of(&self, name: &str) {
        self.state.lock().await.failing_lookups.push(name.to_string());
    }

    /// Number of subject-update calls issued so far.
    pub async fn update_calls(&self) -> usize {
        self.state.lock().await.update_calls
    }

    /// Current subjects of a stream, or `None` when absent.
    pub async fn subjects(&self, name: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .await
            .streams
            .get(name)
            .map(|stream| stream.subjects.clone())
    }

    /// Live consumer by durable name, or `None` when absent.
    pub async fn consumer(&self, stream: &str, name: &str) -> Option<ConsumerSpec> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .and_then(|s| s.consumers.iter().find(|c| c.name == name))
            .cloned()
    }

    /// Subjects and payloads accepted by [`StreamStore::publish`], in order,
    /// duplicates excluded.
    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.state.lock().await.published.clone()
    }
}

#[async_trait]
impl StreamStore for MockStreamStore {
    async fn lookup(&self, name: &str) -> StreamLookup {
        let state = self.state.lock().await;
        if state.failing_lookups.iter().any(|n| n == name) {
            return StreamLookup::Error(ReconcileError::Lookup {
                stream: name.to_string(),
                message: "injected lookup failure".to_string(),
            });
        }
        match state.streams.get(name) {
            Some(stream) => StreamLookup::Found(StreamState {
                name: name.to_string(),
                subjects: stream.subjects.clone(),
            }),
            None => StreamLookup::NotFound,
        }
    }

    async fn create(&self, spec: &StreamSpec) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;
        state.streams.insert(
            spec.name.clone(),
            MockStream {
                subjects: spec.subjects.clone(),
                consumers: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_subjects(
        &self,
        spec: &StreamSpec,
        subjects: Vec<String>,
    ) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;
        state.update_calls += 1;
        match state.streams.get_mut(&spec.name) {
            Some(stream) => {
                stream.subjects = subjects;
                Ok(())
            }
            None => Err(ReconcileError::Update {
                stream: spec.name.clone(),
                message: "stream does not exist".to_string(),
            }),
        }
    }

    async fn consumer_info(
        &self,
        stream: &str,
        name: &str,
    ) -> Result<Option<ConsumerSpec>, ReconcileError> {
        Ok(self.consumer(stream, name).await)
    }

    async fn apply_consumer(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
    ) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.streams.get_mut(stream) else {
            return Err(ReconcileError::Consumer {
                stream: stream.to_string(),
                consumer: spec.name.clone(),
                message: "stream does not exist".to_string(),
            });
        };
        match entry.consumers.iter_mut().find(|c| c.name == spec.name) {
            Some(existing) => *existing = spec.clone(),
            None => entry.consumers.push(spec.clone()),
        }
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<u64, ReconcileError> {
        let handlers: Vec<HandlerEntry>;
        let sequence;
        {
            let mut state = self.state.lock().await;

            let dedup_id = headers
                .iter()
                .find(|(key, _)| key == DEDUP_HEADER)
                .map(|(_, value)| value.clone());
            if let Some(id) = &dedup_id {
                if let Some(existing) = state.seen_ids.get(id) {
                    debug!(subject, id = %id, "Dropping duplicate publish");
                    return Ok(*existing);
                }
            }

            state.sequence += 1;
            sequence = state.sequence;
            if let Some(id) = dedup_id {
                state.seen_ids.insert(id, sequence);
            }
            state.published.push((subject.to_string(), payload.clone()));

            handlers = state
                .handlers
                .iter()
                .filter(|(stream, filter, _)| {
                    let bound = state
                        .streams
                        .get(stream)
                        .map(|s| s.subjects.iter().any(|p| subject_matches(p, subject)))
                        .unwrap_or(false);
                    bound && (filter.is_empty() || subject_matches(filter, subject))
                })
                .map(|(stream, filter, handler)| {
                    (stream.clone(), filter.clone(), handler.clone())
                })
                .collect();
        }

        // Deliver outside the lock so handlers may publish in turn.
        for (_, _, handler) in handlers {
            if let Err(e) = handler.deliver(subject, payload.clone()).await {
                debug!(subject, error = %e, "Mock handler rejected message");
            }
        }

        Ok(sequence)
    }

    async fn consume(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<(), ReconcileError> {
        self.apply_consumer(stream, spec).await?;
        self.state.lock().await.handlers.push((
            stream.to_string(),
            spec.filter_subject.clone(),
            handler,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker.clone());

        let mut first = transport.subscribe("work", Some("pool")).await.unwrap();
        let mut second = transport.subscribe("work", Some("pool")).await.unwrap();

        transport.publish("work", Bytes::from("a")).await.unwrap();
        transport.publish("work", Bytes::from("b")).await.unwrap();

        assert_eq!(first.next().await.unwrap().payload, Bytes::from("a"));
        assert_eq!(second.next().await.unwrap().payload, Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = MockBroker::new();
        let transport = Arc::new(MockTransport::new(broker.clone()));

        let responder = transport.clone();
        let mut sub = responder.subscribe("echo", None).await.unwrap();
        tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            let reply = msg.reply.unwrap();
            responder.publish(&reply, msg.payload).await.unwrap();
        });

        let reply = transport.request("echo", Bytes::from("ping")).await.unwrap();
        assert_eq!(reply, Bytes::from("ping"));
    }

    #[tokio::test]
    async fn test_request_without_responder_hangs() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker);

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            transport.request("nobody.home", Bytes::new()),
        )
        .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_store_deduplicates_by_header() {
        let store = MockStreamStore::new();
        store.seed_stream("orders", &["orders.>"]).await;

        let headers = vec![(DEDUP_HEADER.to_string(), "msg-1".to_string())];
        let first = store
            .publish("orders.created", headers.clone(), Bytes::from("x"))
            .await
            .unwrap();
        let second = store
            .publish("orders.created", headers, Bytes::from("x"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_delivers_matching_publishes() {
        struct Capture(Mutex<Vec<String>>);

        #[async_trait]
        impl StreamHandler for Capture {
            async fn deliver(
                &self,
                subject: &str,
                _payload: Bytes,
            ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                self.0.lock().await.push(subject.to_string());
                Ok(())
            }
        }

        let store = MockStreamStore::new();
        store.seed_stream("orders", &["orders.>"]).await;
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));

        let spec = ConsumerSpec {
            name: "worker".into(),
            filter_subject: "orders.created".into(),
            ..Default::default()
        };
        store.consume("orders", &spec, capture.clone()).await.unwrap();

        store
            .publish("orders.created", Vec::new(), Bytes::from("a"))
            .await
            .unwrap();
        store
            .publish("orders.deleted", Vec::new(), Bytes::from("b"))
            .await
            .unwrap();

        assert_eq!(*capture.0.lock().await, vec!["orders.created"]);
        assert!(store.consumer("orders", "worker").await.is_some());
    }
}
