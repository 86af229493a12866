//! NATS transport via `async-nats`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::context::GetStreamErrorKind;
use async_nats::jetstream::{self, stream, Context, ErrorCode};
use async_nats::{Client, ConnectOptions, HeaderMap, RequestErrorKind};
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{ConnectionHandle, Connector, InboundMessage, MessageTransport, TransportError};
use crate::config::{
    ConnectionConfig, ConsumerSpec, GeneralConfig, JetStreamContextConfig, StreamSpec,
    DEFAULT_RESPONSE_TIMEOUT,
};
use crate::config::{AckPolicy, DeliverPolicy, DiscardPolicy, ReplayPolicy, RetentionPolicy, StorageType};
use crate::reconcile::{ReconcileError, StreamHandler, StreamLookup, StreamState, StreamStore};

/// Opens NATS connections from resolved descriptors.
pub struct NatsConnector {
    general: GeneralConfig,
}

impl NatsConnector {
    /// Connector applying the given process-wide settings to every
    /// connection it opens.
    pub fn new(general: GeneralConfig) -> Self {
        Self { general }
    }

    async fn build_options(config: &ConnectionConfig) -> Result<ConnectOptions, TransportError> {
        let reconnect_wait = config.reconnect_wait;
        let name = config.name.clone();

        // The client's own request timeout is disabled: the dispatch layer
        // bounds every request with its resolved response window, which may
        // exceed the library default.
        let mut options = ConnectOptions::new()
            .name(config.name.clone())
            .request_timeout(None)
            .connection_timeout(config.connection_timeout)
            .ping_interval(config.ping_interval)
            .max_reconnects(config.max_reconnects)
            .custom_inbox_prefix(config.inbox_prefix.clone())
            .reconnect_delay_callback(move |_attempt| reconnect_wait)
            .event_callback(move |event| {
                let name = name.clone();
                async move {
                    info!(connection = %name, %event, "NATS client event");
                }
            });

        if config.no_echo {
            options = options.no_echo();
        }

        if let Some(auth) = &config.auth {
            if let (Some(user), Some(password)) = (&auth.username, &auth.password) {
                options = options.user_and_password(user.clone(), password.clone());
            }
            if let Some(token) = &auth.token {
                options = options.token(token.clone());
            }
            if let Some(path) = &auth.credentials_file {
                options = options
                    .credentials_file(path)
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
            }
        }

        if let Some(tls) = &config.tls {
            if tls.required {
                options = options.require_tls(true);
            }
            if let Some(root) = &tls.root_cert {
                options = options.add_root_certificates(PathBuf::from(root));
            }
            match (&tls.client_cert, &tls.client_key) {
                (Some(cert), Some(key)) => {
                    options =
                        options.add_client_certificate(PathBuf::from(cert), PathBuf::from(key));
                }
                (None, None) => {}
                _ => {
                    warn!(
                        connection = %config.name,
                        "Client certificate requires both cert and key; ignoring"
                    );
                }
            }
        }

        Ok(options)
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionHandle, TransportError> {
        let options = Self::build_options(config).await?;
        let client = options
            .connect(config.addresses.join(","))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(
            connection = %config.name,
            addresses = ?config.addresses,
            "Connected to NATS"
        );
        Ok(ConnectionHandle {
            name: config.name.clone(),
            transport: Arc::new(NatsTransport {
                client,
                general: self.general.clone(),
            }),
        })
    }
}

/// Core transport over one live NATS client.
pub struct NatsTransport {
    client: Client,
    general: GeneralConfig,
}

impl NatsTransport {
    /// Wrap an already-connected client, e.g. one opened by test setup.
    pub fn from_client(client: Client, general: GeneralConfig) -> Self {
        Self { client, general }
    }
}

fn header_map(headers: Vec<(String, String)>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn request_error(subject: &str, error: async_nats::RequestError) -> TransportError {
    match error.kind() {
        RequestErrorKind::NoResponders => TransportError::NoResponders {
            subject: subject.to_string(),
        },
        _ => TransportError::Request {
            subject: subject.to_string(),
            message: error.to_string(),
        },
    }
}

#[async_trait]
impl MessageTransport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.client
            .publish_with_headers(subject.to_string(), header_map(headers), payload)
            .await
            .map_err(|e| TransportError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        let reply = self
            .client
            .request(subject.to_string(), payload)
            .await
            .map_err(|e| request_error(subject, e))?;
        Ok(reply.payload)
    }

    async fn request_with_headers(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        let reply = self
            .client
            .request_with_headers(subject.to_string(), header_map(headers), payload)
            .await
            .map_err(|e| request_error(subject, e))?;
        Ok(reply.payload)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
        let subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| TransportError::Subscribe {
            subject: subject.to_string(),
            message: e.to_string(),
        })?;

        Ok(Box::pin(subscriber.map(|msg| InboundMessage {
            subject: msg.subject.to_string(),
            payload: msg.payload,
            reply: msg.reply.map(|r| r.to_string()),
        })))
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    fn jetstream_context(&self, options: &JetStreamContextConfig) -> Arc<dyn StreamStore> {
        let context = match (&options.domain, &options.prefix) {
            (Some(domain), _) => jetstream::with_domain(self.client.clone(), domain),
            (None, Some(prefix)) => jetstream::with_prefix(self.client.clone(), prefix),
            (None, None) => jetstream::new(self.client.clone()),
        };
        Arc::new(NatsStreamStore {
            context,
            request_timeout: options.request_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
            ack_timeout: self.general.ack_timeout,
            ack_retries: self.general.ack_retries,
        })
    }
}

/// JetStream-backed [`StreamStore`] for one context of one connection.
pub struct NatsStreamStore {
    context: Context,
    request_timeout: Duration,
    ack_timeout: Duration,
    ack_retries: usize,
}

fn stream_config(spec: &StreamSpec, subjects: Vec<String>) -> stream::Config {
    stream::Config {
        name: spec.name.clone(),
        subjects,
        retention: match spec.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::Workqueue => stream::RetentionPolicy::WorkQueue,
        },
        discard: match spec.discard {
            DiscardPolicy::Old => stream::DiscardPolicy::Old,
            DiscardPolicy::New => stream::DiscardPolicy::New,
        },
        storage: match spec.storage {
            StorageType::File => stream::StorageType::File,
            StorageType::Memory => stream::StorageType::Memory,
        },
        max_bytes: spec.max_bytes,
        max_messages: spec.max_messages,
        max_age: spec.max_age.unwrap_or_default(),
        num_replicas: spec.replicas,
        duplicate_window: spec.duplicate_window(),
        ..Default::default()
    }
}

fn pull_config(spec: &ConsumerSpec) -> pull::Config {
    pull::Config {
        durable_name: Some(spec.name.clone()),
        deliver_policy: match spec.deliver_policy {
            DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
            DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
            DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
            DeliverPolicy::LastPerSubject => jetstream::consumer::DeliverPolicy::LastPerSubject,
            DeliverPolicy::ByStartSequence { start_sequence } => {
                jetstream::consumer::DeliverPolicy::ByStartSequence { start_sequence }
            }
        },
        ack_policy: match spec.ack_policy {
            AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
            AckPolicy::All => jetstream::consumer::AckPolicy::All,
            AckPolicy::None => jetstream::consumer::AckPolicy::None,
        },
        replay_policy: match spec.replay_policy {
            ReplayPolicy::Instant => jetstream::consumer::ReplayPolicy::Instant,
            ReplayPolicy::Original => jetstream::consumer::ReplayPolicy::Original,
        },
        filter_subject: spec.filter_subject.clone(),
        rate_limit: spec.rate_limit,
        max_ack_pending: spec.max_ack_pending,
        max_deliver: spec.max_deliver,
        backoff: spec.backoff.clone(),
        headers_only: spec.headers_only,
        memory_storage: spec.memory_storage,
        num_replicas: spec.replicas,
        ..Default::default()
    }
}

/// Normalize a live consumer config into the declared shape so it can serve
/// as a merge base.
fn normalize_consumer(name: &str, config: &jetstream::consumer::Config) -> ConsumerSpec {
    let deliver_policy = match config.deliver_policy {
        jetstream::consumer::DeliverPolicy::All => DeliverPolicy::All,
        jetstream::consumer::DeliverPolicy::Last => DeliverPolicy::Last,
        jetstream::consumer::DeliverPolicy::New => DeliverPolicy::New,
        jetstream::consumer::DeliverPolicy::LastPerSubject => DeliverPolicy::LastPerSubject,
        jetstream::consumer::DeliverPolicy::ByStartSequence { start_sequence } => {
            DeliverPolicy::ByStartSequence { start_sequence }
        }
        jetstream::consumer::DeliverPolicy::ByStartTime { .. } => {
            warn!(
                consumer = %name,
                "Live consumer starts by time, which declared configs cannot express; \
                 treating as deliver-all for merging"
            );
            DeliverPolicy::All
        }
    };

    ConsumerSpec {
        name: name.to_string(),
        deliver_policy,
        ack_policy: match config.ack_policy {
            jetstream::consumer::AckPolicy::Explicit => AckPolicy::Explicit,
            jetstream::consumer::AckPolicy::All => AckPolicy::All,
            jetstream::consumer::AckPolicy::None => AckPolicy::None,
        },
        replay_policy: match config.replay_policy {
            jetstream::consumer::ReplayPolicy::Instant => ReplayPolicy::Instant,
            jetstream::consumer::ReplayPolicy::Original => ReplayPolicy::Original,
        },
        filter_subject: config.filter_subject.clone(),
        rate_limit: config.rate_limit,
        max_ack_pending: config.max_ack_pending,
        max_deliver: config.max_deliver,
        backoff: config.backoff.clone(),
        flow_control: config.flow_control,
        headers_only: config.headers_only,
        memory_storage: config.memory_storage,
        replicas: config.num_replicas,
    }
}

#[async_trait]
impl StreamStore for NatsStreamStore {
    async fn lookup(&self, name: &str) -> StreamLookup {
        let fetched = match timeout(self.request_timeout, self.context.get_stream(name)).await {
            Ok(result) => result,
            Err(_) => {
                return StreamLookup::Error(ReconcileError::Lookup {
                    stream: name.to_string(),
                    message: "stream info request timed out".to_string(),
                })
            }
        };

        match fetched {
            Ok(stream) => {
                let info = stream.cached_info();
                StreamLookup::Found(StreamState {
                    name: name.to_string(),
                    subjects: info.config.subjects.clone(),
                })
            }
            Err(e) => match e.kind() {
                GetStreamErrorKind::JetStream(err)
                    if err.error_code() == ErrorCode::STREAM_NOT_FOUND =>
                {
                    StreamLookup::NotFound
                }
                _ => StreamLookup::Error(ReconcileError::Lookup {
                    stream: name.to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }

    async fn create(&self, spec: &StreamSpec) -> Result<(), ReconcileError> {
        let config = stream_config(spec, spec.subjects.clone());
        timeout(self.request_timeout, self.context.create_stream(config))
            .await
            .map_err(|_| ReconcileError::Create {
                stream: spec.name.clone(),
                message: "stream create request timed out".to_string(),
            })?
            .map_err(|e| ReconcileError::Create {
                stream: spec.name.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn update_subjects(
        &self,
        spec: &StreamSpec,
        subjects: Vec<String>,
    ) -> Result<(), ReconcileError> {
        let config = stream_config(spec, subjects);
        timeout(self.request_timeout, self.context.update_stream(&config))
            .await
            .map_err(|_| ReconcileError::Update {
                stream: spec.name.clone(),
                message: "stream update request timed out".to_string(),
            })?
            .map_err(|e| ReconcileError::Update {
                stream: spec.name.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn consumer_info(
        &self,
        stream: &str,
        name: &str,
    ) -> Result<Option<ConsumerSpec>, ReconcileError> {
        // A fetch failure and absence read the same here: the merge engine
        // reports BaseNotFound either way, with the details logged.
        let fetched = timeout(self.request_timeout, async {
            let stream = self.context.get_stream(stream).await?;
            let info = stream.consumer_info(name).await?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(info)
        })
        .await;

        match fetched {
            Ok(Ok(info)) => Ok(Some(normalize_consumer(name, &info.config))),
            Ok(Err(e)) => {
                debug!(stream, consumer = name, error = %e, "Live consumer not available");
                Ok(None)
            }
            Err(_) => {
                debug!(stream, consumer = name, "Consumer info request timed out");
                Ok(None)
            }
        }
    }

    async fn apply_consumer(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
    ) -> Result<(), ReconcileError> {
        timeout(
            self.request_timeout,
            self.context
                .create_consumer_on_stream(pull_config(spec), stream),
        )
        .await
        .map_err(|_| ReconcileError::Consumer {
            stream: stream.to_string(),
            consumer: spec.name.clone(),
            message: "consumer create request timed out".to_string(),
        })?
        .map_err(|e| ReconcileError::Consumer {
            stream: stream.to_string(),
            consumer: spec.name.clone(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<u64, ReconcileError> {
        let headers = header_map(headers);

        let attempt = || async {
            timeout(self.ack_timeout, async {
                let pending = self
                    .context
                    .publish_with_headers(subject.to_string(), headers.clone(), payload.clone())
                    .await
                    .map_err(|e| e.to_string())?;
                let ack = pending.await.map_err(|e| e.to_string())?;
                Ok::<u64, String>(ack.sequence)
            })
            .await
            .map_err(|_| "acknowledgement timed out".to_string())?
        };

        attempt
            .retry(
                ConstantBuilder::default()
                    .with_delay(Duration::from_millis(250))
                    .with_max_times(self.ack_retries),
            )
            .notify(|error, _| {
                warn!(subject, %error, "Persistent publish attempt failed; retrying")
            })
            .await
            .map_err(|message| ReconcileError::Publish {
                subject: subject.to_string(),
                message,
            })
    }

    async fn consume(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<(), ReconcileError> {
        let consumer = timeout(
            self.request_timeout,
            self.context
                .create_consumer_on_stream(pull_config(spec), stream),
        )
        .await
        .map_err(|_| ReconcileError::Consumer {
            stream: stream.to_string(),
            consumer: spec.name.clone(),
            message: "consumer create request timed out".to_string(),
        })?
        .map_err(|e| ReconcileError::Consumer {
            stream: stream.to_string(),
            consumer: spec.name.clone(),
            message: e.to_string(),
        })?;

        let mut messages = consumer.messages().await.map_err(|e| ReconcileError::Consumer {
            stream: stream.to_string(),
            consumer: spec.name.clone(),
            message: e.to_string(),
        })?;

        let stream_name = stream.to_string();
        let durable = spec.name.clone();
        tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            stream = %stream_name,
                            consumer = %durable,
                            error = %e,
                            "Failed to pull next message"
                        );
                        continue;
                    }
                };

                match handler
                    .deliver(&message.subject, message.payload.clone())
                    .await
                {
                    Ok(()) => {
                        if let Err(e) = message.ack().await {
                            warn!(
                                stream = %stream_name,
                                consumer = %durable,
                                error = %e,
                                "Failed to acknowledge message"
                            );
                        }
                    }
                    Err(e) => {
                        // Left unacknowledged for redelivery per ack policy.
                        warn!(
                            stream = %stream_name,
                            consumer = %durable,
                            subject = %message.subject,
                            error = %e,
                            "Handler rejected message"
                        );
                    }
                }
            }
            debug!(
                stream = %stream_name,
                consumer = %durable,
                "Consumer delivery loop ended"
            );
        });

        Ok(())
    }
}
