//! The staged storage configuration.
//!
//! Two rows in the metadata store describe the blob backend: `active` is what
//! the running process loaded at startup, `pending` is edited live through
//! the admin API. Promotion of pending to active is an offline operation
//! guarded by the server's lock file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use thiserror::Error;

pub use repub_api::admin::StorageBackendConfig;

use crate::blobstore::{BlobStore, LocalBlobStore};
use crate::datastore::{DataStore, DataStoreError};

pub const SLOT_ACTIVE: &str = "active";
pub const SLOT_PENDING: &str = "pending";

#[derive(Debug, Error)]
pub enum StorageConfigError {
    #[error(transparent)]
    Store(#[from] DataStoreError),

    #[error("invalid storage config encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid storage config: {0}")]
    Invalid(String),

    #[error("storage backend not supported by this build: {0}")]
    Unsupported(String),

    #[error("the server appears to be running (lock file `{}` is held)", .0.display())]
    ServerRunning(PathBuf),

    #[error("failed to work with the lock file: {0}")]
    Lock(std::io::Error),
}

/// Reads a slot; a JSON `null` counts as absent.
pub async fn read_slot(
    store: &dyn DataStore,
    slot: &str,
) -> Result<Option<StorageBackendConfig>, StorageConfigError> {
    match store.get_storage_config(slot).await? {
        None => Ok(None),
        Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StorageConfigError::Invalid(e.to_string())),
    }
}

/// Loads the active config, seeding a local-filesystem default on first run.
pub async fn load_active(
    store: &dyn DataStore,
    default_blob_dir: &Path,
) -> Result<StorageBackendConfig, StorageConfigError> {
    if let Some(active) = read_slot(store, SLOT_ACTIVE).await? {
        return Ok(active);
    }
    let default = StorageBackendConfig::Local {
        path: default_blob_dir.to_string_lossy().into_owned(),
    };
    store
        .set_storage_config(SLOT_ACTIVE, &serde_json::to_value(&default)?)
        .await?;
    Ok(default)
}

/// Writes the pending slot.
pub async fn write_pending(
    store: &dyn DataStore,
    config: &StorageBackendConfig,
) -> Result<(), StorageConfigError> {
    store
        .set_storage_config(SLOT_PENDING, &serde_json::to_value(config)?)
        .await?;
    Ok(())
}

/// Promotes pending to active, clearing pending.
///
/// Returns the new active config, or `None` when nothing was pending. The
/// caller is responsible for checking the server lock first.
pub async fn activate_pending(
    store: &dyn DataStore,
) -> Result<Option<StorageBackendConfig>, StorageConfigError> {
    let Some(pending) = read_slot(store, SLOT_PENDING).await? else {
        return Ok(None);
    };
    store
        .set_storage_config(SLOT_ACTIVE, &serde_json::to_value(&pending)?)
        .await?;
    store
        .set_storage_config(SLOT_PENDING, &serde_json::Value::Null)
        .await?;
    Ok(Some(pending))
}

/// Builds the blob store described by a config.
pub async fn build_blob_store(
    config: &StorageBackendConfig,
) -> Result<Arc<dyn BlobStore>, StorageConfigError> {
    match config {
        StorageBackendConfig::Local { path } => Ok(Arc::new(LocalBlobStore::new(path.clone()))),
        #[cfg(feature = "s3")]
        StorageBackendConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => Ok(Arc::new(
            crate::blobstore::S3BlobStore::new(
                bucket.clone(),
                region.clone(),
                endpoint.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
            )
            .await,
        )),
        #[cfg(not(feature = "s3"))]
        StorageBackendConfig::S3 { .. } => Err(StorageConfigError::Unsupported(
            "this binary was built without the `s3` feature".to_string(),
        )),
    }
}

/// An exclusive lock marking a running server instance.
///
/// The lock is advisory via `flock`; the file also records the PID for
/// operators. Dropping the lock releases and removes the file.
pub struct ServerLock {
    file: std::fs::File,
    path: PathBuf,
}

impl ServerLock {
    /// Acquires the lock, failing if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self, StorageConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StorageConfigError::Lock)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(StorageConfigError::Lock)?;
        file.try_lock_exclusive()
            .map_err(|_| StorageConfigError::ServerRunning(path.to_path_buf()))?;
        file.set_len(0).map_err(StorageConfigError::Lock)?;
        writeln!(file, "{}", std::process::id()).map_err(StorageConfigError::Lock)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Whether some process currently holds the lock.
    pub fn is_held(path: &Path) -> bool {
        let Ok(file) = OpenOptions::new().read(true).open(path) else {
            return false;
        };
        if file.try_lock_shared().is_ok() {
            let _ = fs2::FileExt::unlock(&file);
            false
        } else {
            true
        }
    }
}

impl Drop for ServerLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}
