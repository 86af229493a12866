//! Live NATS JetStream integration tests using testcontainers.
//!
//! Run with: cargo test --test nats_live --features container-tests -- --nocapture

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use jetbind::bootstrap::bootstrap;
use jetbind::config::{Config, ConnectionConfig, GeneralConfig, JetStreamContextConfig};
use jetbind::dispatch::{
    BindingDescriptor, ClientSpec, DispatchClient, DispatchListener, RequestHandler,
    ResolvedBinding,
};
use jetbind::reconcile::{StreamHandler, StreamLookup, StreamReconciler};
use jetbind::transport::{NatsConnector, DEDUP_HEADER};
use serde::{Deserialize, Serialize};
use serial_test::serial;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start NATS with JetStream enabled, returning the container and its URL.
async fn start_nats() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-js"]);

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host_port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    (container, format!("nats://{host}:{host_port}"))
}

fn unique(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    format!("{prefix}{nanos}")
}

fn connections_for(url: &str, extra_yaml: &str) -> HashMap<String, ConnectionConfig> {
    let yaml = format!(
        "nats:\n  addresses: [\"{url}\"]\n{extra_yaml}"
    );
    let (_, connections) = Config::from_yaml(&yaml).unwrap().resolve().unwrap();
    connections
}

#[tokio::test]
#[serial]
async fn test_bootstrap_creates_and_widens_streams() {
    let (_container, url) = start_nats().await;
    let stream = unique("orders");

    let extra = format!(
        "  streams:\n    - name: {stream}\n      subjects: [\"{stream}.created\"]\n"
    );
    let connections = connections_for(&url, &extra);
    let connector = Arc::new(NatsConnector::new(GeneralConfig::default()));

    let registry = bootstrap(connector, &connections).await;
    let store = registry
        .context("default", &JetStreamContextConfig::default())
        .await
        .expect("connection should be established");

    match store.lookup(&stream).await {
        StreamLookup::Found(state) => {
            assert_eq!(state.subjects, vec![format!("{stream}.created")]);
        }
        other => panic!("expected stream, got {other:?}"),
    }

    // Converged: a second pass issues no changes.
    let declared = &connections["default"].streams;
    let report = StreamReconciler::new(store.as_ref(), "default")
        .reconcile_all(declared)
        .await;
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.created + report.widened + report.failed, 0);

    // Widening: an added declared subject is unioned into the live set.
    let mut widened_spec = declared[0].clone();
    widened_spec.subjects.push(format!("{stream}.updated"));
    let report = StreamReconciler::new(store.as_ref(), "default")
        .reconcile_all(&[widened_spec])
        .await;
    assert_eq!(report.widened, 1);

    match store.lookup(&stream).await {
        StreamLookup::Found(state) => {
            assert_eq!(
                state.subjects,
                vec![format!("{stream}.created"), format!("{stream}.updated")]
            );
        }
        other => panic!("expected stream, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_persistent_publish_deduplicates_and_consumes() {
    struct Forward(mpsc::UnboundedSender<(String, Bytes)>);

    #[async_trait]
    impl StreamHandler for Forward {
        async fn deliver(
            &self,
            subject: &str,
            payload: Bytes,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.send((subject.to_string(), payload))?;
            Ok(())
        }
    }

    let (_container, url) = start_nats().await;
    let stream = unique("jobs");

    let extra = format!(
        "  streams:\n    - name: {stream}\n      subjects: [\"{stream}.>\"]\n  \
         consumer-configuration:\n    - stream: {stream}\n      consumers:\n        - name: worker\n"
    );
    let connections = connections_for(&url, &extra);
    let connector = Arc::new(NatsConnector::new(GeneralConfig::default()));

    let registry = bootstrap(connector, &connections).await;
    let store = registry
        .context("default", &JetStreamContextConfig::default())
        .await
        .unwrap();

    let worker = store
        .consumer_info(&stream, "worker")
        .await
        .unwrap()
        .expect("declared consumer should be materialized");

    let (sender, mut received) = mpsc::unbounded_channel();
    store
        .consume(&stream, &worker, Arc::new(Forward(sender)))
        .await
        .unwrap();

    let subject = format!("{stream}.run");
    let headers = vec![(DEDUP_HEADER.to_string(), "job-1".to_string())];
    let first = store
        .publish(&subject, headers.clone(), Bytes::from_static(b"payload"))
        .await
        .unwrap();
    let second = store
        .publish(&subject, headers, Bytes::from_static(b"payload"))
        .await
        .unwrap();
    assert_eq!(first, second, "duplicate should collapse to one sequence");

    let (got_subject, got_payload) =
        tokio::time::timeout(Duration::from_secs(10), received.recv())
            .await
            .expect("consumer should deliver")
            .unwrap();
    assert_eq!(got_subject, subject);
    assert_eq!(got_payload, Bytes::from_static(b"payload"));

    // The duplicate was dropped server-side: nothing else arrives.
    let extra_delivery =
        tokio::time::timeout(Duration::from_millis(500), received.recv()).await;
    assert!(extra_delivery.is_err());
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    name: String,
}

struct Greeter;

#[async_trait]
impl RequestHandler for Greeter {
    type Request = Greeting;
    type Reply = String;

    async fn handle(
        &self,
        request: Greeting,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Some(format!("hello, {}", request.name)))
    }
}

#[tokio::test]
#[serial]
async fn test_request_reply_over_live_transport() {
    let (_container, url) = start_nats().await;
    let connections = connections_for(&url, "");
    let general = GeneralConfig::default();
    let connector = Arc::new(NatsConnector::new(general.clone()));

    let registry = bootstrap(connector, &connections).await;
    let subject = unique("svc.greet.");

    let listener = DispatchListener::new(registry.clone(), general.clone());
    listener
        .register(
            &ResolvedBinding {
                method: "greet".into(),
                subject: subject.clone(),
                connection: "default".into(),
                queue_group: None,
                response_timeout: Duration::from_secs(5),
            },
            Arc::new(Greeter),
        )
        .await
        .unwrap();

    let client = DispatchClient::new(
        registry,
        &ClientSpec {
            connection: None,
            methods: vec![BindingDescriptor {
                method: "greet".into(),
                subject: Some(subject),
                ..Default::default()
            }],
        },
        &general,
    )
    .unwrap();

    let reply: String = client
        .call("greet", &Greeting { name: "nats".into() })
        .await
        .unwrap();
    assert_eq!(reply, "hello, nats");

    listener.shutdown().await;
}
