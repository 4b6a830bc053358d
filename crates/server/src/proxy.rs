//! The upstream proxy-cache.
//!
//! On a miss for a package this registry does not host, the cache fetches the
//! upstream version listing, persists the metadata into the cached namespace,
//! and materialises archives on first download. Listings are refreshed
//! stale-while-revalidate; all upstream work is deduplicated per key.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use repub_api::listing::VersionListing;
use repub_api::PUB_MEDIA_TYPE;

use crate::blobstore::{archive_key, ArchiveNamespace, BlobStore};
use crate::datastore::{DataStore, DataStoreError, NewActivity, NewPackageVersion};
use crate::services::select_latest;
use crate::singleflight::SingleFlight;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("package was not found upstream")]
    NotFound,

    #[error("upstream registry unavailable: {0}")]
    Unavailable(String),

    #[error("upstream archive for {package}@{version} does not match its recorded sha256")]
    HashMismatch { package: String, version: String },

    #[error("proxy internal error: {0}")]
    Internal(String),
}

impl From<DataStoreError> for ProxyError {
    fn from(e: DataStoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// A thin HTTP client for the configured upstream registry.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base: Url,
}

impl UpstreamClient {
    pub fn new(base: Url) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
        Ok(Self { http, base })
    }

    pub async fn fetch_listing(&self, name: &str) -> Result<VersionListing, ProxyError> {
        let url = self
            .base
            .join(&format!("api/packages/{name}"))
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, PUB_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProxyError::NotFound);
        }
        if !response.status().is_success() {
            return Err(ProxyError::Unavailable(format!(
                "upstream returned {status}",
                status = response.status()
            )));
        }
        response
            .json::<VersionListing>()
            .await
            .map_err(|e| ProxyError::Unavailable(format!("invalid upstream listing: {e}")))
    }

    pub async fn fetch_archive(&self, url: &str) -> Result<Bytes, ProxyError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProxyError::NotFound);
        }
        if !response.status().is_success() {
            return Err(ProxyError::Unavailable(format!(
                "upstream returned {status}",
                status = response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))
    }
}

struct ProxyInner {
    store: Arc<dyn DataStore>,
    blobs: Arc<dyn BlobStore>,
    client: UpstreamClient,
    listing_ttl: Duration,
    /// Package name → when its listing was last persisted.
    fetched_at: Mutex<HashMap<String, Instant>>,
    /// Keys with a background refresh in flight.
    refreshing: Mutex<HashSet<String>>,
    listing_flight: SingleFlight<Result<(), ProxyError>>,
    blob_flight: SingleFlight<Result<Bytes, ProxyError>>,
}

/// The read-through cache in front of the upstream registry.
#[derive(Clone)]
pub struct ProxyCache {
    inner: Arc<ProxyInner>,
}

impl ProxyCache {
    pub fn new(
        store: Arc<dyn DataStore>,
        blobs: Arc<dyn BlobStore>,
        upstream_url: Url,
        listing_ttl: Duration,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            inner: Arc::new(ProxyInner {
                store,
                blobs,
                client: UpstreamClient::new(upstream_url)?,
                listing_ttl,
                fetched_at: Mutex::new(HashMap::new()),
                refreshing: Mutex::new(HashSet::new()),
                listing_flight: SingleFlight::new(),
                blob_flight: SingleFlight::new(),
            }),
        })
    }

    /// Makes sure the metadata store holds a usable listing for `name`.
    ///
    /// Fresh listings return immediately. Stale ones return immediately too
    /// while a single background refresh brings them up to date. A full miss
    /// blocks on one deduplicated upstream fetch.
    pub async fn ensure_listing(&self, name: &str) -> Result<(), ProxyError> {
        let fresh = {
            let fetched_at = lock(&self.inner.fetched_at);
            fetched_at
                .get(name)
                .map(|at| at.elapsed() < self.inner.listing_ttl)
        };

        match fresh {
            Some(true) => Ok(()),
            Some(false) => {
                self.spawn_refresh(name);
                Ok(())
            }
            None => {
                // Nothing in this process's cache; rows from a previous run
                // still count as a stale copy.
                let known = self.inner.store.get_package(name).await?.is_some();
                if known {
                    self.spawn_refresh(name);
                    return Ok(());
                }

                let inner = Arc::clone(&self.inner);
                let key = format!("listing:{name}");
                let name = name.to_string();
                self.inner
                    .listing_flight
                    .run(&key, async move { fetch_and_persist(&inner, &name).await })
                    .await
                    .unwrap_or_else(|| {
                        Err(ProxyError::Internal(
                            "listing fetch task failed".to_string(),
                        ))
                    })
            }
        }
    }

    /// Returns the archive bytes for a cached version, materialising the blob
    /// from upstream on first use.
    pub async fn get_archive(&self, name: &str, version: &str) -> Result<Bytes, ProxyError> {
        let row = self
            .inner
            .store
            .get_package_version(name, version)
            .await?
            .ok_or(ProxyError::NotFound)?;

        match self.inner.blobs.exists(&row.archive_key).await {
            Ok(true) => {
                return self
                    .inner
                    .blobs
                    .get_archive(&row.archive_key)
                    .await
                    .map_err(|e| ProxyError::Internal(e.to_string()));
            }
            Ok(false) => {}
            Err(e) => return Err(ProxyError::Internal(e.to_string())),
        }

        let inner = Arc::clone(&self.inner);
        let key = format!("blob:{name}:{version}");
        let name = name.to_string();
        let version = version.to_string();
        self.inner
            .blob_flight
            .run(&key, async move {
                materialise_archive(&inner, &name, &version).await
            })
            .await
            .unwrap_or_else(|| Err(ProxyError::Internal("archive fetch task failed".to_string())))
    }

    fn spawn_refresh(&self, name: &str) {
        {
            let mut refreshing = lock(&self.inner.refreshing);
            if !refreshing.insert(name.to_string()) {
                return;
            }
        }

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            // Sharing the foreground fetch key means a refresh that races a
            // first-time fetch attaches to it instead of hitting upstream a
            // second time.
            let key = format!("listing:{name}");
            let work = {
                let inner = Arc::clone(&inner);
                let name = name.clone();
                async move {
                    // A fetch that finished while this task was queued makes
                    // the refresh redundant.
                    let fresh = lock(&inner.fetched_at)
                        .get(&name)
                        .is_some_and(|at| at.elapsed() < inner.listing_ttl);
                    if fresh {
                        return Ok(());
                    }
                    fetch_and_persist(&inner, &name).await
                }
            };
            match inner.listing_flight.run(&key, work).await {
                Some(Err(e)) => tracing::warn!("background refresh of `{name}` failed: {e}"),
                None => tracing::warn!("background refresh of `{name}` died"),
                Some(Ok(())) => {}
            }
            lock(&inner.refreshing).remove(&name);
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fetches the upstream listing and persists any versions we do not have.
async fn fetch_and_persist(inner: &ProxyInner, name: &str) -> Result<(), ProxyError> {
    let doc = inner.client.fetch_listing(name).await?;

    for entry in &doc.versions {
        if inner.store.version_exists(name, &entry.version).await? {
            continue;
        }
        let Some(sha256) = entry.archive_sha256.as_deref() else {
            tracing::warn!(
                "upstream listing for `{name}` omits archive_sha256 for {version}; skipping",
                version = entry.version
            );
            continue;
        };

        let new = NewPackageVersion {
            package_name: name.to_string(),
            version: entry.version.clone(),
            pubspec: entry.pubspec.clone(),
            archive_key: archive_key(name, &entry.version, sha256, ArchiveNamespace::Cached),
            archive_sha256: sha256.to_string(),
            upstream_archive_url: Some(entry.archive_url.clone()),
            is_upstream_cache: true,
            description: entry
                .pubspec
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string),
        };
        match inner.store.upsert_package_version(new).await {
            Ok(_) => {}
            Err(DataStoreError::VersionConflict { package, version }) => {
                // A cached version never re-binds to a new archive.
                tracing::warn!(
                    "upstream changed the archive hash of {package}@{version}; keeping ours"
                );
                inner
                    .store
                    .log_activity(NewActivity::system(
                        "upstream_hash_mismatch",
                        "package_version",
                        format!("{package}@{version}"),
                    ))
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Nothing persisted (every upstream entry was unusable): report a miss
    // rather than leaving a phantom package behind.
    if inner.store.get_package(name).await?.is_none() {
        return Err(ProxyError::NotFound);
    }

    if doc.is_discontinued {
        inner
            .store
            .discontinue_package(name, doc.replaced_by.as_deref())
            .await?;
    }

    let versions = inner.store.get_package_versions(name).await?;
    let latest = select_latest(&versions).map(|v| v.version.clone());
    let description = latest
        .as_deref()
        .and_then(|l| versions.iter().find(|v| v.version == l))
        .and_then(|v| v.pubspec.get("description"))
        .and_then(|d| d.as_str())
        .map(str::to_string);
    inner
        .store
        .update_package_denorm(name, latest.as_deref(), description.as_deref())
        .await?;

    lock(&inner.fetched_at).insert(name.to_string(), Instant::now());
    Ok(())
}

/// Downloads, verifies, and stores a cached archive.
async fn materialise_archive(
    inner: &ProxyInner,
    name: &str,
    version: &str,
) -> Result<Bytes, ProxyError> {
    let row = inner
        .store
        .get_package_version(name, version)
        .await?
        .ok_or(ProxyError::NotFound)?;
    let url = row.upstream_archive_url.as_deref().ok_or_else(|| {
        ProxyError::Internal(format!("{name}@{version} has no upstream archive URL"))
    })?;

    let bytes = inner.client.fetch_archive(url).await?;

    let digest = hex::encode(Sha256::digest(&bytes));
    if digest != row.archive_sha256 {
        inner
            .store
            .log_activity(NewActivity::system(
                "upstream_hash_mismatch",
                "package_version",
                format!("{name}@{version}"),
            ))
            .await?;
        return Err(ProxyError::HashMismatch {
            package: name.to_string(),
            version: version.to_string(),
        });
    }

    inner
        .blobs
        .put_archive(&row.archive_key, &bytes)
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    Ok(bytes)
}
