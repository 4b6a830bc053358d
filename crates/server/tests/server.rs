//! End-to-end tests of the publish and resolution surfaces.

use std::time::Duration;

use futures::future::join_all;
use sha2::{Digest, Sha256};

use repub_api::PUB_MEDIA_TYPE;
use repub_server::blobstore::BlobStore;
use repub_server::datastore::DataStore;

mod support;

use support::{package_tarball, publish, spawn_server, wait_for};

#[tokio::test]
async fn happy_publish_roundtrip() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;

    let archive = package_tarball("foo", "1.0.0");
    let expected_sha = hex::encode(Sha256::digest(&archive));

    let response = publish(&server, &token, archive.clone()).await.unwrap();
    assert_eq!(response.status(), 204);
    let finish_url = response
        .headers()
        .get("location")
        .expect("finalize location")
        .to_str()
        .unwrap()
        .to_string();

    // Step three reports success in the pub client's envelope.
    let finish: serde_json::Value = server
        .client
        .get(&finish_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(finish["success"]["message"].is_string());

    // The listing document carries the version with our archive URL.
    let response = server
        .client
        .get(format!("{}/api/packages/foo", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        PUB_MEDIA_TYPE
    );
    let listing: serde_json::Value = response.json().await.unwrap();
    assert_eq!(listing["name"], "foo");
    assert_eq!(listing["latest"]["version"], "1.0.0");
    assert_eq!(listing["versions"][0]["version"], "1.0.0");
    assert_eq!(listing["versions"][0]["archive_sha256"], expected_sha);
    let archive_url = listing["versions"][0]["archive_url"].as_str().unwrap();

    // The archive downloads byte-identical.
    let bytes = server
        .client
        .get(archive_url)
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), archive.as_slice());

    // The metadata row and blob both exist with the right digest.
    let version = server
        .store
        .get_package_version("foo", "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version.archive_sha256, expected_sha);
    assert!(server
        .blobs
        .exists(&version.archive_key)
        .await
        .unwrap());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn identical_republish_is_idempotent() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;
    let archive = package_tarball("foo", "1.0.0");

    assert_eq!(
        publish(&server, &token, archive.clone())
            .await
            .unwrap()
            .status(),
        204
    );
    let first = server
        .store
        .get_package_version("foo", "1.0.0")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(publish(&server, &token, archive).await.unwrap().status(), 204);
    let second = server
        .store
        .get_package_version("foo", "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.published_at, second.published_at);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn conflicting_publish_is_rejected_and_state_unchanged() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;

    let original = package_tarball("foo", "1.0.0");
    let original_sha = hex::encode(Sha256::digest(&original));
    assert_eq!(
        publish(&server, &token, original).await.unwrap().status(),
        204
    );

    let conflicting = support::tarball(&[
        ("pubspec.yaml", b"name: foo\nversion: 1.0.0\n".as_slice()),
        ("lib/other.dart", b"// different contents\n".as_slice()),
    ]);
    let response = publish(&server, &token, conflicting).await.unwrap();
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "version-exists");

    let version = server
        .store
        .get_package_version("foo", "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version.archive_sha256, original_sha);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_identical_publishes_produce_one_side_effect() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;
    let archive = package_tarball("foo", "1.0.0");

    let publishes = (0..4).map(|_| publish(&server, &token, archive.clone()));
    for result in join_all(publishes).await {
        assert_eq!(result.unwrap().status(), 204);
    }

    // Exactly one publish recorded an activity entry.
    let entries = server.store.recent_activity(50, None).await.unwrap();
    let published = entries
        .iter()
        .filter(|e| e.activity_type == "package_published")
        .count();
    assert_eq!(published, 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn publish_requires_a_covering_scope() {
    let server = spawn_server(|_| {}).await.unwrap();

    // No token at all: the session endpoint refuses.
    let response = server
        .client
        .get(format!("{}/api/packages/versions/new", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // A token scoped to another package opens a session but cannot finish.
    let token = server.token("dev@example.com", &["publish:pkg:other"]).await;
    let response = publish(&server, &token, package_tarball("foo", "1.0.0"))
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");

    // The correctly scoped token succeeds.
    let token = server.token("dev2@example.com", &["publish:pkg:foo"]).await;
    assert_eq!(
        publish(&server, &token, package_tarball("foo", "1.0.0"))
            .await
            .unwrap()
            .status(),
        204
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_archives_are_rejected_and_terminate_the_session() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;

    let session: serde_json::Value = server
        .client
        .get(format!("{}/api/packages/versions/new", server.base_url()))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let upload_url = session["url"].as_str().unwrap().to_string();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"not a tarball".to_vec()).file_name("package.tar.gz"),
    );
    let response = server
        .client
        .post(&upload_url)
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 415);

    // The session is terminal now; a retry reports expiry.
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(package_tarball("foo", "1.0.0"))
            .file_name("package.tar.gz"),
    );
    let response = server
        .client
        .post(&upload_url)
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 410);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upload-expired");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn retraction_marks_the_listing_without_deleting() {
    let server = spawn_server(|_| {}).await.unwrap();
    let publisher = server.token("dev@example.com", &["publish:all"]).await;
    let admin = server.token("admin@example.com", &["admin"]).await;

    publish(&server, &publisher, package_tarball("foo", "1.0.0"))
        .await
        .unwrap();

    let response = server
        .client
        .post(format!(
            "{}/admin/api/packages/foo/versions/1.0.0/retract",
            server.base_url()
        ))
        .bearer_auth(&admin)
        .json(&serde_json::json!({ "message": "security" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let listing: serde_json::Value = server
        .client
        .get(format!("{}/api/packages/foo", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["versions"][0]["retracted"], true);
    assert_eq!(listing["versions"][0]["retractionMessage"], "security");
    // Retraction does not delete: the only version is still `latest`.
    assert_eq!(listing["latest"]["version"], "1.0.0");

    // Unretraction restores every field.
    let response = server
        .client
        .post(format!(
            "{}/admin/api/packages/foo/versions/1.0.0/unretract",
            server.base_url()
        ))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    let version = server
        .store
        .get_package_version("foo", "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert!(!version.is_retracted);
    assert!(version.retracted_at.is_none());
    assert!(version.retraction_message.is_none());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn deleting_a_package_removes_all_versions() {
    let server = spawn_server(|_| {}).await.unwrap();
    let publisher = server.token("dev@example.com", &["publish:all"]).await;
    let admin = server.token("admin@example.com", &["admin"]).await;

    publish(&server, &publisher, package_tarball("foo", "1.0.0"))
        .await
        .unwrap();
    publish(&server, &publisher, package_tarball("foo", "1.1.0"))
        .await
        .unwrap();

    let response = server
        .client
        .delete(format!("{}/admin/api/packages/foo", server.base_url()))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["versions_deleted"], 2);

    assert!(server.store.get_package("foo").await.unwrap().is_none());
    assert!(server
        .store
        .get_package_versions("foo")
        .await
        .unwrap()
        .is_empty());

    let response = server
        .client
        .get(format!("{}/api/packages/foo", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn search_matches_name_substrings() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;

    for name in ["http_client", "http_server", "yaml_edit"] {
        publish(&server, &token, package_tarball(name, "1.0.0"))
            .await
            .unwrap();
    }

    let result: serde_json::Value = server
        .client
        .get(format!(
            "{}/api/packages/search?q=HTTP",
            server.base_url()
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["total"], 2);
    assert_eq!(result["page"], 1);
    assert_eq!(result["packages"].as_array().unwrap().len(), 2);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn download_auth_gates_archives_when_enabled() {
    let server = spawn_server(|config| config.require_download_auth = true)
        .await
        .unwrap();
    let publisher = server.token("dev@example.com", &["publish:all"]).await;
    publish(&server, &publisher, package_tarball("foo", "1.0.0"))
        .await
        .unwrap();

    let archive_url = format!(
        "{}/api/packages/foo/versions/1.0.0/archive.tar.gz",
        server.base_url()
    );

    let response = server.client.get(&archive_url).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let reader = server.token("reader@example.com", &["read:all"]).await;
    let response = server
        .client
        .get(&archive_url)
        .bearer_auth(&reader)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // A publish-only token cannot download.
    let response = server
        .client
        .get(&archive_url)
        .bearer_auth(&publisher)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn downloads_are_counted_eventually() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;
    publish(&server, &token, package_tarball("foo", "1.0.0"))
        .await
        .unwrap();

    let archive_url = format!(
        "{}/api/packages/foo/versions/1.0.0/archive.tar.gz",
        server.base_url()
    );
    for _ in 0..3 {
        server
            .client
            .get(&archive_url)
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap();
    }

    // Counts flush on shutdown at the latest.
    let store = server.store.clone();
    server.shutdown().await.unwrap();
    let counted = wait_for(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .get_package_version("foo", "1.0.0")
                .await
                .unwrap()
                .unwrap()
                .download_count
                == 3
        }
    })
    .await;
    assert!(counted, "download counts were not flushed");
}

#[tokio::test]
async fn rate_limiting_returns_429_with_retry_after() {
    let server = spawn_server(|config| config.rate_limit_requests = 5)
        .await
        .unwrap();

    let url = format!("{}/api/packages/absent", server.base_url());
    let mut limited = None;
    for _ in 0..30 {
        let response = server.client.get(&url).send().await.unwrap();
        if response.status() == 429 {
            limited = Some(response);
            break;
        }
    }
    let response = limited.expect("rate limit never tripped");
    assert!(response.headers().contains_key("retry-after"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "rate-limited");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn token_self_service_via_the_admin_api() {
    let server = spawn_server(|_| {}).await.unwrap();
    let admin = server.token("admin@example.com", &["admin"]).await;

    // Admin mints a token for a fresh user.
    let created_user: serde_json::Value = server
        .client
        .post(format!("{}/admin/api/users", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({
            "email": "newdev@example.com",
            "password": "correct horse battery staple",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = server
        .client
        .post(format!("{}/admin/api/tokens", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({
            "user_id": created_user["id"],
            "label": "ci",
            "scopes": ["publish:pkg:foo"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    let raw = body["token"].as_str().unwrap().to_string();
    assert!(raw.len() >= 40);

    // The minted token works for its package and cannot broaden itself.
    assert_eq!(
        publish(&server, &raw, package_tarball("foo", "1.0.0"))
            .await
            .unwrap()
            .status(),
        204
    );
    let response = server
        .client
        .post(format!("{}/admin/api/tokens", server.base_url()))
        .bearer_auth(&raw)
        .json(&serde_json::json!({
            "label": "escalated",
            "scopes": ["publish:all"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Self-service listing only shows the caller's tokens.
    let listed: serde_json::Value = server
        .client
        .get(format!("{}/admin/api/tokens", server.base_url()))
        .bearer_auth(&raw)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["label"], "ci");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn admin_surface_requires_the_admin_scope() {
    let server = spawn_server(|_| {}).await.unwrap();

    let response = server
        .client
        .get(format!("{}/admin/api/stats", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let token = server.token("dev@example.com", &["publish:all"]).await;
    let response = server
        .client
        .get(format!("{}/admin/api/stats", server.base_url()))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let admin = server.token("admin@example.com", &["admin"]).await;
    let stats: serde_json::Value = server
        .client
        .get(format!("{}/admin/api/stats", server.base_url()))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats["hosted_packages"].is_number());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn environment_only_config_keys_are_rejected() {
    let server = spawn_server(|_| {}).await.unwrap();
    let admin = server.token("admin@example.com", &["admin"]).await;

    let response = server
        .client
        .post(format!("{}/admin/api/config", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({ "key": "base_url", "value": "http://x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .post(format!("{}/admin/api/config", server.base_url()))
        .bearer_auth(&admin)
        .json(&serde_json::json!({ "key": "max_upload_size_mb", "value": "10" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert_eq!(
        server
            .store
            .get_config("max_upload_size_mb")
            .await
            .unwrap()
            .as_deref(),
        Some("10")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn blob_gc_removes_only_orphans() {
    let server = spawn_server(|_| {}).await.unwrap();
    let token = server.token("dev@example.com", &["publish:all"]).await;
    let admin = server.token("admin@example.com", &["admin"]).await;

    publish(&server, &token, package_tarball("foo", "1.0.0"))
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // A conflicting publish leaves its content-addressed blob behind.
    let conflicting = support::tarball(&[
        ("pubspec.yaml", b"name: foo\nversion: 1.0.0\n".as_slice()),
        ("lib/extra.dart", b"// other bytes\n".as_slice()),
    ]);
    assert_eq!(
        publish(&server, &token, conflicting).await.unwrap().status(),
        409
    );

    let result: serde_json::Value = server
        .client
        .post(format!("{}/admin/api/blobs/gc", server.base_url()))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["scanned"], 2);
    assert_eq!(result["removed"], 1);

    // The referenced archive still downloads.
    let response = server
        .client
        .get(format!(
            "{}/api/packages/foo/versions/1.0.0/archive.tar.gz",
            server.base_url()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn health_reports_the_backend() {
    let server = spawn_server(|_| {}).await.unwrap();
    let health: serde_json::Value = server
        .client
        .get(format!("{}/healthz", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["type"], "embedded");

    server.shutdown().await.unwrap();
}
