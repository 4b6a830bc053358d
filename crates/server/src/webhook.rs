//! At-least-once webhook delivery.
//!
//! Events are queued onto an in-process channel; a worker fans each event out
//! to the subscribed webhooks and spawns one delivery task per webhook.
//! Deliveries retry with backoff, every attempt is recorded, and webhooks
//! that keep failing are disabled. On shutdown the dispatcher drains for a
//! bounded grace period; anything still undelivered at forced exit is lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use repub_api::{DELIVERY_ID_HEADER_NAME, EVENT_HEADER_NAME, SIGNATURE_HEADER_NAME};

use crate::config::site;
use crate::datastore::{DataStore, NewActivity, NewWebhookDelivery, Webhook};

pub const EVENT_PACKAGE_PUBLISHED: &str = "package.published";
pub const EVENT_PACKAGE_DELETED: &str = "package.deleted";
pub const EVENT_PACKAGE_RETRACTED: &str = "package.retracted";
pub const EVENT_PACKAGE_DOWNLOADED: &str = "package.downloaded";
pub const EVENT_USER_CREATED: &str = "user.created";
pub const EVENT_WEBHOOK_TEST: &str = "webhook.test";

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_SECONDS: [u64; 5] = [1, 5, 30, 120, 600];
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Computes the `X-Repub-Signature` value for a delivery body.
///
/// Receivers verify against the exact bytes delivered; there is no
/// canonicalisation step on either side.
pub fn signature(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

struct QueuedEvent {
    event_type: String,
    payload: serde_json::Value,
    /// A specific webhook id for synthetic test deliveries; `None` fans out
    /// to every subscribed webhook.
    target: Option<i64>,
}

/// A cloneable handle used to enqueue events.
#[derive(Clone)]
pub struct WebhookDispatcher {
    tx: mpsc::UnboundedSender<QueuedEvent>,
}

/// Owns the worker; await `shutdown` to drain.
pub struct WebhookDispatcherHandle {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl WebhookDispatcher {
    /// Starts the dispatcher worker.
    pub fn start(store: Arc<dyn DataStore>) -> (Self, WebhookDispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(store, rx, cancel.clone()));
        (Self { tx }, WebhookDispatcherHandle { cancel, worker })
    }

    /// Enqueues an event for every webhook subscribed to its type.
    pub fn dispatch(&self, event_type: &str, payload: serde_json::Value) {
        let _ = self.tx.send(QueuedEvent {
            event_type: event_type.to_string(),
            payload,
            target: None,
        });
    }

    /// Enqueues a synthetic event for one webhook regardless of its
    /// subscriptions.
    pub fn dispatch_to(&self, webhook_id: i64, event_type: &str, payload: serde_json::Value) {
        let _ = self.tx.send(QueuedEvent {
            event_type: event_type.to_string(),
            payload,
            target: Some(webhook_id),
        });
    }
}

impl WebhookDispatcherHandle {
    /// Stops accepting events and drains in-flight deliveries for up to the
    /// grace period.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.worker.await {
            tracing::warn!("webhook worker task failed: {e}");
        }
    }
}

async fn run_worker(
    store: Arc<dyn DataStore>,
    mut rx: mpsc::UnboundedReceiver<QueuedEvent>,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();
    let http = match reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .build()
    {
        Ok(http) => http,
        Err(e) => {
            tracing::error!("failed to build webhook HTTP client: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => handle_event(&store, &http, &tracker, &cancel, event).await,
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Anything already queued still gets its first attempt during the drain.
    rx.close();
    while let Ok(event) = rx.try_recv() {
        handle_event(&store, &http, &tracker, &cancel, event).await;
    }

    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("webhook drain grace period expired; undelivered events were dropped");
    }
}

async fn handle_event(
    store: &Arc<dyn DataStore>,
    http: &reqwest::Client,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    event: QueuedEvent,
) {
    let mut body = serde_json::Map::new();
    body.insert(
        "event".to_string(),
        serde_json::Value::String(event.event_type.clone()),
    );
    if let serde_json::Value::Object(payload) = event.payload {
        body.extend(payload);
    }
    let body = match serde_json::to_vec(&serde_json::Value::Object(body)) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("failed to encode webhook body: {e}");
            return;
        }
    };

    let recipients: Vec<Webhook> = match event.target {
        Some(id) => match store.get_webhook(id).await {
            Ok(Some(webhook)) => vec![webhook],
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("failed to load webhook {id}: {e}");
                Vec::new()
            }
        },
        None => match store.list_webhooks(true).await {
            Ok(webhooks) => webhooks
                .into_iter()
                .filter(|w| w.subscribes_to(&event.event_type))
                .collect(),
            Err(e) => {
                tracing::error!("failed to list webhooks: {e}");
                Vec::new()
            }
        },
    };

    for webhook in recipients {
        let store = Arc::clone(store);
        let http = http.clone();
        let cancel = cancel.clone();
        let event_type = event.event_type.clone();
        let body = body.clone();
        tracker.spawn(async move {
            deliver(store, http, cancel, webhook, event_type, body).await;
        });
    }
}

async fn deliver(
    store: Arc<dyn DataStore>,
    http: reqwest::Client,
    cancel: CancellationToken,
    webhook: Webhook,
    event_type: String,
    body: Vec<u8>,
) {
    let delivery_id = Uuid::new_v4().to_string();
    let threshold = site::webhook_failure_threshold(store.as_ref()).await;

    for attempt in 1..=MAX_ATTEMPTS {
        let started = Instant::now();
        let mut request = http
            .post(&webhook.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER_NAME, &event_type)
            .header(DELIVERY_ID_HEADER_NAME, &delivery_id);
        if let Some(secret) = &webhook.secret {
            request = request.header(SIGNATURE_HEADER_NAME, signature(secret, &body));
        }

        let result = request.body(body.clone()).send().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let (status_code, success, error) = match &result {
            Ok(response) if response.status().is_success() => {
                (Some(response.status().as_u16()), true, None)
            }
            Ok(response) => (
                Some(response.status().as_u16()),
                false,
                Some(format!("received status {}", response.status())),
            ),
            Err(e) => (None, false, Some(e.to_string())),
        };

        if let Err(e) = store
            .insert_webhook_delivery(NewWebhookDelivery {
                webhook_id: webhook.id,
                event_type: event_type.clone(),
                delivered_at: Utc::now(),
                status_code,
                duration_ms,
                error: error.clone(),
                success,
            })
            .await
        {
            tracing::error!("failed to record webhook delivery: {e}");
        }

        let failure_count = match store
            .record_webhook_attempt(webhook.id, success, Utc::now())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("failed to record webhook attempt: {e}");
                return;
            }
        };

        if success {
            return;
        }
        tracing::debug!(
            "delivery {delivery_id} to webhook {id} failed (attempt {attempt}/{MAX_ATTEMPTS}): \
             {error}",
            id = webhook.id,
            error = error.as_deref().unwrap_or("unknown"),
        );

        if failure_count >= threshold {
            if let Err(e) = store.set_webhook_active(webhook.id, false).await {
                tracing::error!("failed to disable webhook {id}: {e}", id = webhook.id);
            }
            let mut activity =
                NewActivity::system("webhook_disabled", "webhook", webhook.id.to_string());
            activity.metadata = serde_json::json!({ "failure_count": failure_count });
            if let Err(e) = store.log_activity(activity).await {
                tracing::error!("failed to log webhook disable: {e}");
            }
            tracing::warn!(
                "webhook {id} disabled after {failure_count} consecutive failures",
                id = webhook.id
            );
            return;
        }

        if attempt < MAX_ATTEMPTS {
            let base_ms = BACKOFF_SECONDS[(attempt - 1) as usize] * 1000;
            let jitter = rand::thread_rng().gen_range(0..=base_ms / 10);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(base_ms + jitter)) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}
