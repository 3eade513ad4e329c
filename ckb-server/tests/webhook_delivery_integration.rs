//! End-to-end: register a webhook against a real local HTTP receiver,
//! emit an event, and confirm the signed delivery arrives with the
//! expected headers and HMAC signature.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Router;
use ckb_protocol::model::{Event, EventKind, WebhookFormat};
use ckb_protocol::signing::sign_payload;
use ckb_server::webhooks::{WebhookManager, WebhookManagerConfig};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct Received {
    headers: Mutex<Option<HeaderMap>>,
    body: Mutex<Option<String>>,
}

async fn capture(State(received): State<Arc<Received>>, headers: HeaderMap, body: String) -> &'static str {
    *received.headers.lock().unwrap() = Some(headers);
    *received.body.lock().unwrap() = Some(body);
    "ok"
}

#[tokio::test]
async fn emitted_event_is_delivered_and_signed() {
    let received = Arc::new(Received::default());
    let router = Router::new().route("/hook", post(capture)).with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let dir = TempDir::new().unwrap();
    let manager = Arc::new(
        WebhookManager::open(&dir.path().join("webhooks.db"), WebhookManagerConfig::default()).unwrap(),
    );

    let secret = "test-secret".to_string();
    let mut events = HashSet::new();
    events.insert(EventKind::RefreshCompleted);
    manager
        .register_webhook(
            "local-test",
            &format!("http://{addr}/hook"),
            Some(secret.clone()),
            events,
            WebhookFormat::Json,
            vec![],
        )
        .unwrap();

    let event = Event {
        id: "evt-1".to_string(),
        kind: EventKind::RefreshCompleted,
        timestamp: chrono::Utc::now(),
        source: "test".to_string(),
        data: serde_json::json!({"repo": "/tmp/repo"}),
    };
    let queued = manager.emit(event).await.unwrap();
    assert_eq!(queued, 1);

    // emit() only launches the delivery attempt on its own task; wait for it
    // to land rather than assuming it already has once emit() returns.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while received.body.lock().unwrap().is_none() {
        if std::time::Instant::now() >= deadline {
            panic!("webhook delivery did not arrive within the deadline");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let headers = received.headers.lock().unwrap().clone().expect("request should have arrived");
    let body = received.body.lock().unwrap().clone().expect("body should have been captured");

    assert_eq!(headers.get("x-ckb-event-type").unwrap(), "refresh_completed");
    let expected_sig = sign_payload(body.as_bytes(), &secret);
    assert_eq!(headers.get("x-ckb-signature-256").unwrap(), expected_sig.as_str());
}
