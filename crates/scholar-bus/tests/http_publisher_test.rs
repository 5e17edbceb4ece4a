use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use scholar_bus::{
    Envelope, HttpPublisher, PublishError, Publisher, EVENT_TYPE_PROPERTY, MESSAGE_ID_PROPERTY,
    PUBLISHED_AT_PROPERTY,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Capture {
    status: StatusCode,
    requests: Arc<Mutex<Vec<(HeaderMap, String)>>>,
}

async fn record(State(capture): State<Capture>, headers: HeaderMap, body: String) -> StatusCode {
    capture
        .requests
        .lock()
        .expect("capture lock")
        .push((headers, body));
    capture.status
}

async fn spawn_endpoint(status: StatusCode) -> (String, Capture) {
    let capture = Capture {
        status,
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/events", post(record))
        .with_state(capture.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = listener.local_addr().expect("should have local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    (format!("http://{addr}/events"), capture)
}

#[tokio::test]
async fn publishes_body_and_routing_headers() {
    let (endpoint, capture) = spawn_endpoint(StatusCode::ACCEPTED).await;
    let publisher =
        HttpPublisher::new(endpoint, Duration::from_secs(5)).expect("client should build");

    let envelope = Envelope::new(
        "3f1c1d9e-0000-4000-8000-000000000001",
        "StudentEnrolledEvent",
        "{\"studentId\":\"s-1\"}",
        Utc::now(),
    );
    publisher
        .publish(&envelope, &CancellationToken::new())
        .await
        .expect("publish should succeed");

    let requests = capture.requests.lock().expect("capture lock");
    assert_eq!(requests.len(), 1);
    let (headers, body) = &requests[0];
    assert_eq!(body, "{\"studentId\":\"s-1\"}");
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(headers[EVENT_TYPE_PROPERTY], "StudentEnrolledEvent");
    assert_eq!(
        headers[MESSAGE_ID_PROPERTY],
        "3f1c1d9e-0000-4000-8000-000000000001"
    );
    assert!(headers.contains_key(PUBLISHED_AT_PROPERTY));
}

#[tokio::test]
async fn non_success_status_is_rejected() {
    let (endpoint, _capture) = spawn_endpoint(StatusCode::SERVICE_UNAVAILABLE).await;
    let publisher =
        HttpPublisher::new(endpoint, Duration::from_secs(5)).expect("client should build");

    let envelope = Envelope::new("m-1", "StudentEnrolledEvent", "{}", Utc::now());
    let err = publisher
        .publish(&envelope, &CancellationToken::new())
        .await
        .expect_err("503 should fail the publish");
    assert!(matches!(err, PublishError::Rejected { status: 503 }));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind");
    let addr = listener.local_addr().expect("should have local addr");
    drop(listener);

    let publisher = HttpPublisher::new(format!("http://{addr}/events"), Duration::from_secs(2))
        .expect("client should build");
    let envelope = Envelope::new("m-1", "StudentEnrolledEvent", "{}", Utc::now());
    let err = publisher
        .publish(&envelope, &CancellationToken::new())
        .await
        .expect_err("closed port should fail");
    assert!(matches!(err, PublishError::Transport(_)));
}
