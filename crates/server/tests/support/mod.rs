//! Shared helpers for the end-to-end tests: a server on an ephemeral port
//! backed by a tempdir SQLite store and local blob store.

#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;

use repub_server::blobstore::LocalBlobStore;
use repub_server::datastore::{DataStore, SqliteDataStore};
use repub_server::token::TokenService;
use repub_server::{Server, ServerConfig, ServerHandle};

pub struct TestServer {
    pub handle: Option<ServerHandle>,
    pub store: Arc<SqliteDataStore>,
    pub blobs: Arc<LocalBlobStore>,
    pub client: reqwest::Client,
    root: tempfile::TempDir,
}

impl TestServer {
    pub fn base_url(&self) -> String {
        self.handle.as_ref().expect("server running").base_url()
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.root.path().join("blobs")
    }

    pub fn store_dyn(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    /// Creates a user plus token with the given scopes, returning the raw
    /// token value.
    pub async fn token(&self, email: &str, scopes: &[&str]) -> String {
        let user = match self.store.get_user_by_email(email).await.unwrap() {
            Some(user) => user,
            None => self.store.create_user(email, "test-hash").await.unwrap(),
        };
        let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
        let tokens = TokenService::new(self.store_dyn());
        let (raw, _) = tokens
            .create(user.id, "test", &scopes, None, 0)
            .await
            .unwrap();
        raw
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

/// Spawns a server, letting the caller adjust the configuration first.
pub async fn spawn_server(configure: impl FnOnce(&mut ServerConfig)) -> Result<TestServer> {
    let root = tempfile::tempdir()?;

    let mut config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse::<SocketAddr>()?,
        base_url: String::new(),
        database_url: root.path().join("repub.db").to_string_lossy().into_owned(),
        data_dir: root.path().to_path_buf(),
        upstream_url: None,
        enable_upstream_proxy: false,
        require_publish_auth: true,
        require_download_auth: false,
        signed_url_ttl: Duration::from_secs(300),
        rate_limit_requests: 1000,
        rate_limit_window: Duration::from_secs(60),
    };
    configure(&mut config);

    let store = Arc::new(SqliteDataStore::open(root.path().join("repub.db"))?);
    store.migrate().await?;
    let blobs = Arc::new(LocalBlobStore::new(root.path().join("blobs")));

    let handle = Server::new(config)
        .with_data_store(store.clone())
        .with_blob_store(blobs.clone())
        .start()
        .await?;

    Ok(TestServer {
        handle: Some(handle),
        store,
        blobs,
        client: reqwest::Client::new(),
        root,
    })
}

/// Builds a gzipped tarball from `(path, contents)` pairs.
pub fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// A minimal valid package archive.
pub fn package_tarball(name: &str, version: &str) -> Vec<u8> {
    let pubspec = format!("name: {name}\nversion: {version}\n");
    tarball(&[
        ("pubspec.yaml", pubspec.as_bytes()),
        ("lib/main.dart", b"void main() {}\n"),
    ])
}

/// Runs the two-step publish flow, returning the step-two response.
pub async fn publish(
    server: &TestServer,
    token: &str,
    archive: Vec<u8>,
) -> Result<reqwest::Response> {
    let session: serde_json::Value = server
        .client
        .get(format!("{}/api/packages/versions/new", server.base_url()))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let upload_url = session["url"].as_str().expect("upload url").to_string();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(archive).file_name("package.tar.gz"),
    );
    Ok(server
        .client
        .post(upload_url)
        .bearer_auth(token)
        .multipart(form)
        .send()
        .await?)
}

/// Polls `check` until it returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
