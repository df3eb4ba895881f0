use std::{sync::Arc, time::Duration};

use courier_broker::{
    http::{client::HttpCourierClient, server::run_server},
    BackendFactory, BackoffPolicy, BrokerError, DeliveryCoordinator, FailureLog,
};
use courier_models::core::{BrokerKind, ConnectionSettings, Properties, RetrySettings};
use reqwest::{Client, Url};
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot};

struct Harness {
    client: HttpCourierClient,
    coordinator: DeliveryCoordinator,
    factory: Arc<BackendFactory>,
    stop: Option<oneshot::Sender<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(BackendFactory::with_client(Client::new()));
        let log = FailureLog::open_at(dir.path().join("broker.log"), 3).await.unwrap();
        let coordinator = DeliveryCoordinator::new(
            factory.clone(),
            Arc::new(log),
            RetrySettings {
                drain_on_success: false,
                ..RetrySettings::default()
            },
            BackoffPolicy::default(),
        );
        coordinator
            .register(&ConnectionSettings::new("orders", BrokerKind::InMemory, Properties::new()))
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(run_server(listener, coordinator.clone(), async move {
            let _ = stopped.await;
        }));

        let base_url = Url::parse(&format!("http://{addr}/")).unwrap();
        Self {
            client: HttpCourierClient::new(base_url, Client::new()),
            coordinator,
            factory,
            stop: Some(stop),
            _dir: dir,
        }
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.coordinator.shutdown().await;
    }
}

fn props(value: serde_json::Value) -> Properties {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn send_and_receive_over_http() {
    let harness = Harness::start().await;
    let message = props(json!({ "id": 1, "body": "hello" }));
    let configuration = props(json!({ "routingKey": "orders.new" }));

    let receipts = harness
        .client
        .send("orders", &message, &configuration)
        .await
        .unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].connection_name, "orders");
    assert_eq!(receipts[0].configuration, configuration);

    let deliveries = harness
        .client
        .receive("orders", &props(json!({ "maxMessages": 10 })))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].message, message);

    let health = harness.client.health().await.unwrap();
    assert_eq!(health.pending_failures, 0);
    assert_eq!(health.connections.len(), 1);
    assert!(health.connections[0].connected);

    harness.stop().await;
}

#[tokio::test]
async fn unknown_connection_is_not_found() {
    let harness = Harness::start().await;
    assert!(matches!(
        harness.client.send("missing", &Properties::new(), &Properties::new()).await,
        Err(BrokerError::NotConfigured(name)) if name == "missing"
    ));
    assert!(matches!(
        harness.client.retry(Some("missing")).await,
        Err(BrokerError::NotConfigured(_))
    ));
    assert!(harness.client.failures(None).await.unwrap().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn failed_send_is_audited_and_retried_on_request() {
    let harness = Harness::start().await;
    let broker = harness.factory.in_memory_broker("orders");
    broker.set_available(false);
    let message = props(json!({ "id": 42 }));

    let err = harness
        .client
        .send("orders", &message, &Properties::new())
        .await
        .unwrap_err();
    match err {
        BrokerError::Transport { connection, message } => {
            assert_eq!(connection, "orders");
            assert!(message.contains("broker.log"));
        }
        other => panic!("unexpected error {other}"),
    }

    let audit = harness.client.failures(Some("orders")).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].message, message);
    assert!(harness.client.failures(Some("audit")).await.unwrap().is_empty());

    broker.set_available(true);
    harness.client.retry(None).await.unwrap();
    for _ in 0..300 {
        if harness.coordinator.pending_failures() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.coordinator.pending_failures(), 0);
    assert_eq!(broker.published(), 1);

    harness.stop().await;
}
