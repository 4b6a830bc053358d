//! The repub registry server.
//!
//! [`Server`] wires the metadata store, blob store, token service, webhook
//! dispatcher, download accounting, and (optionally) the upstream
//! proxy-cache into one axum application.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::http::Request;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, Span};

pub mod api;
pub mod archive;
pub mod backup;
pub mod blobstore;
pub mod config;
pub mod datastore;
pub mod downloads;
pub mod proxy;
pub mod services;
pub mod singleflight;
pub mod storage_config;
pub mod token;
pub mod webhook;

pub use config::ServerConfig;

use api::{RateLimitLayer, RateLimiter};
use blobstore::BlobStore;
use datastore::{DataStore, SqliteDataStore};
use downloads::DownloadCounter;
use proxy::ProxyCache;
use services::RegistryService;
use storage_config::ServerLock;
use token::TokenService;
use webhook::{WebhookDispatcher, WebhookDispatcherHandle};

/// Opens the metadata store described by the configuration's database URL.
pub async fn open_data_store(config: &ServerConfig) -> Result<Arc<dyn DataStore>> {
    let url = &config.database_url;
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        #[cfg(feature = "postgres")]
        {
            let store = datastore::PostgresDataStore::new(url)
                .context("failed to connect to PostgreSQL")?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "postgres"))]
        bail!("this binary was built without the `postgres` feature");
    }

    let path = std::path::Path::new(url.strip_prefix("sqlite:").unwrap_or(url));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create `{}`", parent.display()))?;
    }
    let store = SqliteDataStore::open(path)
        .with_context(|| format!("failed to open database `{}`", path.display()))?;
    Ok(Arc::new(store))
}

/// The configured, not-yet-started server.
pub struct Server {
    config: ServerConfig,
    store: Option<Arc<dyn DataStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            store: None,
            blobs: None,
        }
    }

    /// Overrides the metadata store; used by tests.
    pub fn with_data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the blob store; used by tests.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Binds the listen address and starts serving in the background.
    pub async fn start(self) -> Result<ServerHandle> {
        let mut config = self.config;

        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory `{}`", config.data_dir.display())
        })?;
        let lock = ServerLock::acquire(&config.lock_file_path())
            .context("another instance appears to be running")?;

        // Bound first so an ephemeral listen port can back the base URL.
        let listener = tokio::net::TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let addr = listener.local_addr()?;
        if config.base_url.is_empty() {
            config.base_url = format!("http://{addr}");
        }

        let store = match self.store {
            Some(store) => store,
            None => open_data_store(&config).await?,
        };
        let applied = store.migrate().await.context("failed to apply migrations")?;
        if applied > 0 {
            tracing::info!("applied {applied} schema migration(s)");
        }

        let blobs = match self.blobs {
            Some(blobs) => blobs,
            None => {
                let active =
                    storage_config::load_active(store.as_ref(), &config.default_blob_dir())
                        .await
                        .context("failed to load the active storage config")?;
                storage_config::build_blob_store(&active)
                    .await
                    .context("failed to build the blob store")?
            }
        };
        blobs
            .ensure_ready()
            .await
            .context("blob store is not ready")?;

        let proxy = match (config.enable_upstream_proxy, &config.upstream_url) {
            (true, Some(upstream)) => {
                let ttl = config::site::upstream_listing_ttl(store.as_ref()).await;
                Some(
                    ProxyCache::new(Arc::clone(&store), Arc::clone(&blobs), upstream.clone(), ttl)
                        .context("failed to initialise the upstream proxy")?,
                )
            }
            _ => None,
        };

        let cancel = CancellationToken::new();
        let downloads = DownloadCounter::new();
        let flusher = downloads.start_flusher(Arc::clone(&store), cancel.clone());
        let (dispatcher, dispatcher_handle) = WebhookDispatcher::start(Arc::clone(&store));
        let tokens = TokenService::new(Arc::clone(&store));

        let service = RegistryService::new(
            config.clone(),
            store,
            blobs,
            tokens,
            dispatcher,
            downloads,
            proxy,
        );

        let general = RateLimiter::new(config.rate_limit_requests, config.rate_limit_window);
        let strict = RateLimiter::new(
            (config.rate_limit_requests / 5).max(5),
            config.rate_limit_window,
        );
        let router = api::create_router(service, RateLimitLayer::new(strict))
            .layer(RateLimitLayer::new(general))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_request(|request: &Request<axum::body::Body>, _span: &Span| {
                        tracing::debug!("{} {}", request.method(), request.uri().path())
                    })
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            );

        tracing::info!("listening on {addr}");

        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(serve_cancel.cancelled_owned())
            .await
            .context("server error")
        });

        Ok(ServerHandle {
            addr,
            cancel,
            task,
            flusher,
            dispatcher_handle: Some(dispatcher_handle),
            _lock: lock,
        })
    }

    /// Runs until `shutdown` resolves, then drains and exits.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let handle = self.start().await?;
        shutdown.await;
        tracing::info!("starting shutdown");
        handle.shutdown().await?;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// A running server. Dropping the handle stops accepting connections;
/// call [`ServerHandle::shutdown`] for an orderly drain.
pub struct ServerHandle {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
    flusher: JoinHandle<()>,
    dispatcher_handle: Option<WebhookDispatcherHandle>,
    _lock: ServerLock,
}

impl ServerHandle {
    /// The base URL requests can be made against.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stops the listener, flushes download counts, and drains the webhook
    /// dispatcher within its grace period.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        (&mut self.task).await.context("server task panicked")??;
        (&mut self.flusher).await.ok();
        if let Some(dispatcher) = self.dispatcher_handle.take() {
            dispatcher.shutdown().await;
        }
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
