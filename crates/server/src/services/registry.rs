//! The composition of the registry's long-lived services.

use std::sync::Arc;

use repub_api::listing::{VersionEntry, VersionListing};

use super::select_latest;
use crate::blobstore::{download_url, BlobStore};
use crate::config::ServerConfig;
use crate::datastore::{DataStore, DataStoreError, NewActivity, PackageVersion};
use crate::downloads::DownloadCounter;
use crate::proxy::ProxyCache;
use crate::token::TokenService;
use crate::webhook::WebhookDispatcher;

struct Inner {
    config: ServerConfig,
    store: Arc<dyn DataStore>,
    blobs: Arc<dyn BlobStore>,
    tokens: TokenService,
    dispatcher: WebhookDispatcher,
    downloads: Arc<DownloadCounter>,
    proxy: Option<ProxyCache>,
}

/// A cloneable handle over everything the HTTP handlers need.
#[derive(Clone)]
pub struct RegistryService {
    inner: Arc<Inner>,
}

impl RegistryService {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DataStore>,
        blobs: Arc<dyn BlobStore>,
        tokens: TokenService,
        dispatcher: WebhookDispatcher,
        downloads: Arc<DownloadCounter>,
        proxy: Option<ProxyCache>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                blobs,
                tokens,
                dispatcher,
                downloads,
                proxy,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.inner.store
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.inner.blobs
    }

    pub fn tokens(&self) -> &TokenService {
        &self.inner.tokens
    }

    pub fn dispatcher(&self) -> &WebhookDispatcher {
        &self.inner.dispatcher
    }

    pub fn downloads(&self) -> &Arc<DownloadCounter> {
        &self.inner.downloads
    }

    pub fn proxy(&self) -> Option<&ProxyCache> {
        self.inner.proxy.as_ref()
    }

    /// Renders one stored version as a listing entry.
    pub fn version_entry(&self, version: &PackageVersion) -> VersionEntry {
        VersionEntry {
            version: version.version.clone(),
            archive_url: download_url(&self.inner.config.base_url, &version.archive_key),
            archive_sha256: Some(version.archive_sha256.clone()),
            pubspec: version.pubspec.clone(),
            retracted: version.is_retracted,
            retraction_message: version.retraction_message.clone(),
        }
    }

    /// Builds the version-listing document for a package, if it exists.
    pub async fn version_listing(
        &self,
        name: &str,
    ) -> Result<Option<VersionListing>, DataStoreError> {
        let Some(package) = self.inner.store.get_package(name).await? else {
            return Ok(None);
        };
        let versions = self.inner.store.get_package_versions(name).await?;
        let latest = select_latest(&versions).map(|v| self.version_entry(v));

        Ok(Some(VersionListing {
            name: package.name,
            latest,
            versions: versions.iter().map(|v| self.version_entry(v)).collect(),
            is_discontinued: package.is_discontinued,
            replaced_by: package.replaced_by,
        }))
    }

    /// Refreshes the package's denormalised latest version and description.
    pub async fn recompute_denorm(&self, name: &str) -> Result<(), DataStoreError> {
        let versions = self.inner.store.get_package_versions(name).await?;
        let latest = select_latest(&versions);
        let description = latest
            .and_then(|v| v.pubspec.get("description"))
            .and_then(|d| d.as_str());
        self.inner
            .store
            .update_package_denorm(name, latest.map(|v| v.version.as_str()), description)
            .await
    }

    /// Records an activity, logging instead of failing the request on error.
    pub async fn log_activity(&self, activity: NewActivity) {
        if let Err(e) = self.inner.store.log_activity(activity).await {
            tracing::error!("failed to record activity: {e}");
        }
    }
}
