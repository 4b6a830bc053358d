//! End-to-end tests of the upstream proxy-cache.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::future::join_all;
use sha2::{Digest, Sha256};

use repub_server::blobstore::BlobStore;
use repub_server::datastore::DataStore;

mod support;

use support::{package_tarball, publish, spawn_server, wait_for};

struct Upstream {
    listing_hits: AtomicUsize,
    archive_hits: AtomicUsize,
    archive: Vec<u8>,
    archive_sha256: String,
    base_url: std::sync::Mutex<String>,
}

impl Upstream {
    fn listing(&self, name: &str) -> serde_json::Value {
        let base = self.base_url.lock().unwrap().clone();
        serde_json::json!({
            "name": name,
            "latest": {
                "version": "2.0.0",
                "archive_url": format!("{base}/archives/{name}/2.0.0.tar.gz"),
                "archive_sha256": self.archive_sha256,
                "pubspec": {"name": name, "version": "2.0.0", "description": "from upstream"},
            },
            "versions": [{
                "version": "2.0.0",
                "archive_url": format!("{base}/archives/{name}/2.0.0.tar.gz"),
                "archive_sha256": self.archive_sha256,
                "pubspec": {"name": name, "version": "2.0.0", "description": "from upstream"},
            }],
        })
    }
}

async fn upstream_listing(
    State(upstream): State<Arc<Upstream>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    upstream.listing_hits.fetch_add(1, Ordering::SeqCst);
    if name == "bar" {
        axum::Json(upstream.listing(&name)).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn upstream_archive(State(upstream): State<Arc<Upstream>>) -> impl IntoResponse {
    upstream.archive_hits.fetch_add(1, Ordering::SeqCst);
    upstream.archive.clone()
}

/// Spawns a fake upstream registry serving one package, `bar@2.0.0`.
async fn spawn_upstream() -> (Arc<Upstream>, SocketAddr) {
    let archive = package_tarball("bar", "2.0.0");
    let upstream = Arc::new(Upstream {
        listing_hits: AtomicUsize::new(0),
        archive_hits: AtomicUsize::new(0),
        archive_sha256: hex::encode(Sha256::digest(&archive)),
        archive,
        base_url: std::sync::Mutex::new(String::new()),
    });

    let router = Router::new()
        .route("/api/packages/:name", get(upstream_listing))
        .route("/archives/:name/:file", get(upstream_archive))
        .with_state(upstream.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    *upstream.base_url.lock().unwrap() = format!("http://{addr}");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    (upstream, addr)
}

#[tokio::test]
async fn miss_then_hit_materialises_the_archive_once() {
    let (upstream, upstream_addr) = spawn_upstream().await;
    let server = spawn_server(|config| {
        config.enable_upstream_proxy = true;
        config.upstream_url = Some(format!("http://{upstream_addr}").parse().unwrap());
    })
    .await
    .unwrap();

    // Unknown locally: the listing comes from upstream and is persisted into
    // the cached namespace.
    let listing: serde_json::Value = server
        .client
        .get(format!("{}/api/packages/bar", server.base_url()))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["name"], "bar");
    assert_eq!(listing["latest"]["version"], "2.0.0");
    // Served archive URLs point at this registry, not upstream.
    assert!(listing["versions"][0]["archive_url"]
        .as_str()
        .unwrap()
        .starts_with(&server.base_url()));

    let package = server.store.get_package("bar").await.unwrap().unwrap();
    assert!(package.is_upstream_cache);

    // First archive request fetches upstream exactly once, verifies, stores.
    let archive_url = format!(
        "{}/api/packages/bar/versions/2.0.0/archive.tar.gz",
        server.base_url()
    );
    let bytes = server
        .client
        .get(&archive_url)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), upstream.archive.as_slice());
    assert_eq!(upstream.archive_hits.load(Ordering::SeqCst), 1);

    let version = server
        .store
        .get_package_version("bar", "2.0.0")
        .await
        .unwrap()
        .unwrap();
    assert!(server.blobs.exists(&version.archive_key).await.unwrap());

    // A second request is served from the local blob store.
    server
        .client
        .get(&archive_url)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    assert_eq!(upstream.archive_hits.load(Ordering::SeqCst), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_listing_requests_fetch_upstream_once() {
    let (upstream, upstream_addr) = spawn_upstream().await;
    let server = spawn_server(|config| {
        config.enable_upstream_proxy = true;
        config.upstream_url = Some(format!("http://{upstream_addr}").parse().unwrap());
    })
    .await
    .unwrap();

    let url = format!("{}/api/packages/bar", server.base_url());
    let requests = (0..8).map(|_| {
        let client = server.client.clone();
        let url = url.clone();
        async move { client.get(&url).send().await.unwrap().status() }
    });
    for status in join_all(requests).await {
        assert_eq!(status, 200);
    }

    assert_eq!(upstream.listing_hits.load(Ordering::SeqCst), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn cached_namespace_rejects_publishes() {
    let (_upstream, upstream_addr) = spawn_upstream().await;
    let server = spawn_server(|config| {
        config.enable_upstream_proxy = true;
        config.upstream_url = Some(format!("http://{upstream_addr}").parse().unwrap());
    })
    .await
    .unwrap();

    // Cache `bar` first.
    server
        .client
        .get(format!("{}/api/packages/bar", server.base_url()))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let token = server.token("dev@example.com", &["publish:all"]).await;
    let response = publish(&server, &token, package_tarball("bar", "3.0.0"))
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn upstream_miss_propagates_as_not_found() {
    let (_upstream, upstream_addr) = spawn_upstream().await;
    let server = spawn_server(|config| {
        config.enable_upstream_proxy = true;
        config.upstream_url = Some(format!("http://{upstream_addr}").parse().unwrap());
    })
    .await
    .unwrap();

    let response = server
        .client
        .get(format!("{}/api/packages/absent", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_upstream_is_a_bad_gateway() {
    // Reserve a port and close it so connections are refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let server = spawn_server(|config| {
        config.enable_upstream_proxy = true;
        config.upstream_url = Some(format!("http://{dead_addr}").parse().unwrap());
    })
    .await
    .unwrap();

    let response = server
        .client
        .get(format!("{}/api/packages/bar", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upstream-unavailable");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn hosted_packages_never_fall_through_to_upstream() {
    let (upstream, upstream_addr) = spawn_upstream().await;
    let server = spawn_server(|config| {
        config.enable_upstream_proxy = true;
        config.upstream_url = Some(format!("http://{upstream_addr}").parse().unwrap());
    })
    .await
    .unwrap();

    let token = server.token("dev@example.com", &["publish:all"]).await;
    publish(&server, &token, package_tarball("bar", "1.0.0"))
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // `bar` is hosted here now; upstream must not be consulted even though it
    // also knows the name.
    let listing: serde_json::Value = server
        .client
        .get(format!("{}/api/packages/bar", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["latest"]["version"], "1.0.0");
    assert_eq!(upstream.listing_hits.load(Ordering::SeqCst), 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn cache_clear_purges_the_shadow_namespace() {
    let (_upstream, upstream_addr) = spawn_upstream().await;
    let server = spawn_server(|config| {
        config.enable_upstream_proxy = true;
        config.upstream_url = Some(format!("http://{upstream_addr}").parse().unwrap());
    })
    .await
    .unwrap();

    // Cache the listing and materialise the blob.
    server
        .client
        .get(format!("{}/api/packages/bar", server.base_url()))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    server
        .client
        .get(format!(
            "{}/api/packages/bar/versions/2.0.0/archive.tar.gz",
            server.base_url()
        ))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let admin = server.token("admin@example.com", &["admin"]).await;
    let cleared: serde_json::Value = server
        .client
        .post(format!("{}/admin/api/cache/clear", server.base_url()))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["removed_packages"], 1);
    assert_eq!(cleared["removed_blobs"], 1);

    // The metadata rows are gone; blobs in the cached namespace too.
    let gone = wait_for(std::time::Duration::from_secs(2), || {
        let store = server.store.clone();
        async move { store.get_package("bar").await.unwrap().is_none() }
    })
    .await;
    assert!(gone);

    server.shutdown().await.unwrap();
}
