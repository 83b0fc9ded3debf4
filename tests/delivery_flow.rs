//! End-to-end delivery over real HTTP subscriber endpoints.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use durapub::broker::{Broker, MessageState, Topic};
use durapub::config::DeliverySettings;
use durapub::persistence::QueueStore;
use durapub::transport::HttpDeliverer;
use serde_json::json;
use tempfile::tempdir;
use tokio::net::TcpListener;

/// A subscriber endpoint whose response status can be changed at runtime.
#[derive(Clone, Default)]
struct Endpoint {
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
    last_body: Arc<std::sync::Mutex<Option<serde_json::Value>>>,
}

impl Endpoint {
    fn answer(&self, status: StatusCode) {
        self.status.store(status.as_u16(), Ordering::SeqCst);
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn receive(
    State(endpoint): State<Endpoint>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> StatusCode {
    endpoint.hits.fetch_add(1, Ordering::SeqCst);
    *endpoint.last_body.lock().unwrap() = Some(body);
    StatusCode::from_u16(endpoint.status.load(Ordering::SeqCst)).unwrap()
}

async fn spawn_endpoint(status: StatusCode) -> (String, Endpoint) {
    let endpoint = Endpoint::default();
    endpoint.answer(status);
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(endpoint.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), endpoint)
}

fn settings() -> DeliverySettings {
    DeliverySettings {
        workers: 2,
        request_timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        retry_interval_secs: 3600,
        shutdown_grace_secs: 5,
        ..DeliverySettings::default()
    }
}

fn start(store: Arc<QueueStore>) -> Broker {
    let deliverer = Arc::new(HttpDeliverer::from_settings(&settings()).unwrap());
    Broker::new(store, deliverer, &settings()).unwrap()
}

async fn wait_for_state(store: &QueueStore, id: &str, state: MessageState) {
    for _ in 0..500 {
        if store.get_message_in(id, state).unwrap().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("message {id} never reached {state}");
}

/// Waits until no attempt is running, so a retry cannot be skipped as in-flight.
async fn settle(broker: &Broker) {
    for _ in 0..500 {
        if broker.in_flight().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("delivery attempts never settled");
}

#[tokio::test]
async fn orders_scenario_fails_then_recovers_on_retry() {
    let dir = tempdir().unwrap();
    let store = Arc::new(QueueStore::open(dir.path()).unwrap());
    let (url_a, a) = spawn_endpoint(StatusCode::OK).await;
    let (url_b, b) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;

    let broker = start(store.clone());
    broker
        .registry()
        .create_topic(Topic::new("orders").allow_sender("shop"))
        .unwrap();
    broker.registry().subscribe("ORDERS", &url_a, "shop").unwrap();
    broker.registry().subscribe("ORDERS", &url_b, "shop").unwrap();

    let outcome = broker
        .publish("orders", json!({"order": 1001, "total": 12.5}), "shop")
        .unwrap();
    assert_eq!(outcome.subscriber_count(), 2);
    let id = outcome.message_id().to_string();

    wait_for_state(&store, &id, MessageState::Failed).await;
    let failed = store.get_message(&id, false).unwrap().unwrap();
    assert_eq!(failed.deliveries[0].subscription_url, url_a);
    assert!(failed.deliveries[0].delivered);
    assert_eq!(failed.deliveries[1].subscription_url, url_b);
    assert!(failed.deliveries[1].failed);
    assert!(store.get_message(&id, true).unwrap().is_none());
    assert_eq!(
        *a.last_body.lock().unwrap(),
        Some(json!({"order": 1001, "total": 12.5}))
    );

    b.answer(StatusCode::OK);
    settle(&broker).await;
    let report = broker.retry_now().await;
    assert_eq!(report.completed, 1);

    let done = store.get_message_in(&id, MessageState::Done).unwrap().unwrap();
    assert!(done.deliveries.iter().all(|d| d.delivered));
    assert!(store.get_message(&id, false).unwrap().is_none());
    assert_eq!(a.hits(), 1);
    assert_eq!(b.hits(), 2);

    let topic = broker.registry().get_topic("orders").unwrap();
    assert_eq!(topic.subscriptions[1].failed_deliveries, 1);
    assert!(topic.subscriptions[1].last_successful_delivery.is_some());

    broker.shutdown().await;
}

#[tokio::test]
async fn failed_messages_survive_restart() {
    let dir = tempdir().unwrap();
    let (url, endpoint) = spawn_endpoint(StatusCode::SERVICE_UNAVAILABLE).await;

    let id = {
        let store = Arc::new(QueueStore::open(dir.path()).unwrap());
        let broker = start(store.clone());
        broker
            .registry()
            .create_topic(Topic::new("audit").allow_sender("svc"))
            .unwrap();
        broker.registry().subscribe("audit", &url, "svc").unwrap();
        let id = broker
            .publish("audit", json!({"event": "login"}), "svc")
            .unwrap()
            .message_id()
            .to_string();
        wait_for_state(&store, &id, MessageState::Failed).await;
        broker.shutdown().await;
        id
    };

    endpoint.answer(StatusCode::OK);
    let store = Arc::new(QueueStore::open(dir.path()).unwrap());
    let broker = start(store.clone());
    let report = broker.retry_now().await;

    assert_eq!(report.completed, 1);
    wait_for_state(&store, &id, MessageState::Done).await;
    assert_eq!(endpoint.hits(), 2);
    broker.shutdown().await;
}

#[tokio::test]
async fn unreachable_subscriber_marks_delivery_failed() {
    let dir = tempdir().unwrap();
    let store = Arc::new(QueueStore::open(dir.path()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://{}/hook", listener.local_addr().unwrap());
    drop(listener);

    let broker = start(store.clone());
    broker
        .registry()
        .create_topic(Topic::new("metrics").allow_sender("svc"))
        .unwrap();
    broker.registry().subscribe("metrics", &dead, "svc").unwrap();

    let outcome = broker.publish("metrics", json!({"cpu": 0.4}), "svc").unwrap();
    wait_for_state(&store, outcome.message_id(), MessageState::Failed).await;

    let failed = store.get_message(outcome.message_id(), false).unwrap().unwrap();
    assert!(failed.deliveries[0].failed);
    assert!(!failed.deliveries[0].delivered);
    broker.shutdown().await;
}
