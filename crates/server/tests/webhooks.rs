//! End-to-end tests of webhook delivery.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use repub_server::datastore::DataStore;

mod support;

use support::{package_tarball, publish, spawn_server, wait_for};

#[derive(Clone, Default)]
struct Receiver {
    requests: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
}

impl Receiver {
    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn take_first(&self) -> (HeaderMap, Vec<u8>) {
        self.requests.lock().unwrap().first().cloned().unwrap()
    }
}

async fn receive(State(receiver): State<Receiver>, headers: HeaderMap, body: Bytes) {
    receiver
        .requests
        .lock()
        .unwrap()
        .push((headers, body.to_vec()));
}

async fn spawn_receiver() -> (Receiver, SocketAddr) {
    let receiver = Receiver::default();
    let router = Router::new()
        .route("/hook", post(receive))
        .with_state(receiver.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (receiver, addr)
}

fn expected_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn publish_delivers_a_signed_webhook() {
    let (receiver, receiver_addr) = spawn_receiver().await;
    let server = spawn_server(|_| {}).await.unwrap();
    let admin = server.token("admin@example.com", &["admin"]).await;

    let response = server
        .client
        .post(format!("{}/admin/api/webhooks", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({
            "url": format!("http://{receiver_addr}/hook"),
            "secret": "s",
            "events": ["package.published"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let webhook: serde_json::Value = response.json().await.unwrap();
    assert_eq!(webhook["has_secret"], true);

    let token = server.token("dev@example.com", &["publish:all"]).await;
    publish(&server, &token, package_tarball("foo", "1.0.1"))
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let delivered = wait_for(Duration::from_secs(5), || {
        let receiver = receiver.clone();
        async move { receiver.count() >= 1 }
    })
    .await;
    assert!(delivered, "webhook was never delivered");

    let (headers, body) = receiver.take_first();
    assert_eq!(
        headers.get("x-repub-event").unwrap().to_str().unwrap(),
        "package.published"
    );
    assert!(headers.contains_key("x-repub-delivery-id"));
    // The signature covers the exact bytes delivered.
    assert_eq!(
        headers.get("x-repub-signature").unwrap().to_str().unwrap(),
        expected_signature("s", &body)
    );

    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["event"], "package.published");
    assert_eq!(payload["package"], "foo");
    assert_eq!(payload["version"], "1.0.1");
    assert!(payload["sha256"].is_string());

    // The delivery log recorded the successful attempt.
    let deliveries: serde_json::Value = server
        .client
        .get(format!(
            "{}/admin/api/webhooks/{}/deliveries",
            server.base_url(),
            webhook["id"]
        ))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deliveries[0]["success"], true);
    assert_eq!(deliveries[0]["status_code"], 200);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn unsubscribed_events_are_not_delivered() {
    let (receiver, receiver_addr) = spawn_receiver().await;
    let server = spawn_server(|_| {}).await.unwrap();
    let admin = server.token("admin@example.com", &["admin"]).await;

    server
        .client
        .post(format!("{}/admin/api/webhooks", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({
            "url": format!("http://{receiver_addr}/hook"),
            "events": ["package.deleted"],
        }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let token = server.token("dev@example.com", &["publish:all"]).await;
    publish(&server, &token, package_tarball("foo", "1.0.0"))
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // Give the dispatcher a moment; nothing should arrive.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(receiver.count(), 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_endpoint_sends_a_synthetic_event() {
    let (receiver, receiver_addr) = spawn_receiver().await;
    let server = spawn_server(|_| {}).await.unwrap();
    let admin = server.token("admin@example.com", &["admin"]).await;

    let webhook: serde_json::Value = server
        .client
        .post(format!("{}/admin/api/webhooks", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({
            "url": format!("http://{receiver_addr}/hook"),
            "events": ["package.published"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = server
        .client
        .post(format!(
            "{}/admin/api/webhooks/{}/test",
            server.base_url(),
            webhook["id"]
        ))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let delivered = wait_for(Duration::from_secs(5), || {
        let receiver = receiver.clone();
        async move { receiver.count() >= 1 }
    })
    .await;
    assert!(delivered);

    let (headers, body) = receiver.take_first();
    assert_eq!(
        headers.get("x-repub-event").unwrap().to_str().unwrap(),
        "webhook.test"
    );
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["event"], "webhook.test");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_webhooks_are_disabled_at_the_threshold() {
    // Reserve a port and close it so deliveries fail fast.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let server = spawn_server(|_| {}).await.unwrap();
    server
        .store
        .set_config("webhook_failure_threshold", "1")
        .await
        .unwrap();
    let admin = server.token("admin@example.com", &["admin"]).await;

    let webhook: serde_json::Value = server
        .client
        .post(format!("{}/admin/api/webhooks", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({
            "url": format!("http://{dead_addr}/hook"),
            "events": ["*"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let webhook_id = webhook["id"].as_i64().unwrap();

    let token = server.token("dev@example.com", &["publish:all"]).await;
    publish(&server, &token, package_tarball("foo", "1.0.0"))
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let disabled = wait_for(Duration::from_secs(5), || {
        let store = server.store.clone();
        async move {
            !store
                .get_webhook(webhook_id)
                .await
                .unwrap()
                .unwrap()
                .is_active
        }
    })
    .await;
    assert!(disabled, "webhook was not auto-disabled");

    let failed = server
        .store
        .get_webhook(webhook_id)
        .await
        .unwrap()
        .unwrap();
    assert!(failed.failure_count >= 1);

    server.shutdown().await.unwrap();
}
