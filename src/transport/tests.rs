use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use tokio::net::TcpListener;

use super::{Deliver, HttpDeliverer};
use crate::utils::DeliveryError;

type Captured = Arc<Mutex<Vec<(Option<String>, String)>>>;

/// Starts a subscriber endpoint answering every POST with `status`.
async fn spawn_subscriber(status: StatusCode, delay: Duration) -> (String, Captured) {
    let captured: Captured = Arc::default();
    let sink = captured.clone();
    let app = Router::new().route(
        "/hook",
        post(move |headers: HeaderMap, body: String| {
            let sink = sink.clone();
            async move {
                tokio::time::sleep(delay).await;
                let content_type = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                sink.lock().unwrap().push((content_type, body));
                status
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), captured)
}

fn deliverer() -> HttpDeliverer {
    HttpDeliverer::new(Duration::from_millis(500), Duration::from_millis(500)).unwrap()
}

#[tokio::test]
async fn test_post_raw_payload_as_json() {
    let (url, captured) = spawn_subscriber(StatusCode::OK, Duration::ZERO).await;

    deliverer()
        .deliver(&url, br#"{"order":42}"#)
        .await
        .expect("200 is a successful delivery");

    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].0.as_deref(), Some("application/json"));
    assert_eq!(captured[0].1, r#"{"order":42}"#);
}

#[tokio::test]
async fn test_only_status_200_counts_as_success() {
    for status in [StatusCode::CREATED, StatusCode::NO_CONTENT, StatusCode::INTERNAL_SERVER_ERROR] {
        let (url, _) = spawn_subscriber(status, Duration::ZERO).await;
        let err = deliverer().deliver(&url, b"{}").await.unwrap_err();
        assert!(
            matches!(err, DeliveryError::Status(code) if code == status.as_u16()),
            "unexpected error for {status}: {err}"
        );
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = deliverer()
        .deliver(&format!("http://{addr}/hook"), b"{}")
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Transport(_)));
}

#[tokio::test]
async fn test_slow_endpoint_hits_request_timeout() {
    let (url, _) = spawn_subscriber(StatusCode::OK, Duration::from_secs(5)).await;
    let deliverer =
        HttpDeliverer::new(Duration::from_millis(100), Duration::from_millis(100)).unwrap();

    let err = deliverer.deliver(&url, b"{}").await.unwrap_err();
    match err {
        DeliveryError::Transport(e) => assert!(e.is_timeout()),
        other => panic!("expected timeout, got {other}"),
    }
}
