use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use super::{validate_key, BlobStore, BlobStoreError};

/// A blob store over a local directory.
///
/// Writes land in a temp file first and are renamed into place, so readers
/// never observe a partial blob. The directory must not be shared between
/// active server instances.
#[derive(Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn transient(e: std::io::Error) -> BlobStoreError {
        BlobStoreError::Transient(e.to_string())
    }
}

async fn collect_keys(
    root: &Path,
    dir: PathBuf,
    keys: &mut Vec<String>,
) -> Result<(), std::io::Error> {
    let mut stack = vec![dir];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                if let Some(key) = rel.to_str() {
                    keys.push(key.replace(std::path::MAIN_SEPARATOR, "/"));
                }
            }
        }
    }
    Ok(())
}

#[axum::async_trait]
impl BlobStore for LocalBlobStore {
    async fn ensure_ready(&self) -> Result<(), BlobStoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(Self::transient)
    }

    async fn put_archive(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Self::transient)?;
        }

        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await.map_err(Self::transient)?;
        match tokio::fs::rename(&tmp, &path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tokio::fs::remove_file(&tmp).await.ok();
                Err(Self::transient(e))
            }
        }
    }

    async fn get_archive(&self, key: &str) -> Result<Bytes, BlobStoreError> {
        let path = self.blob_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(Self::transient(e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        let path = self.blob_path(key)?;
        tokio::fs::try_exists(&path).await.map_err(Self::transient)
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.blob_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::transient(e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            validate_key(prefix)?;
            self.root.join(prefix)
        };
        let mut keys = Vec::new();
        collect_keys(&self.root, start, &mut keys)
            .await
            .map_err(Self::transient)?;
        keys.retain(|k| !k.starts_with(".tmp-"));
        Ok(keys)
    }

    async fn presigned_get_url(
        &self,
        _key: &str,
        _ttl: Duration,
    ) -> Result<Option<String>, BlobStoreError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::{archive_key, ArchiveNamespace};

    async fn store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.ensure_ready().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_dir, store) = store().await;
        let key = archive_key("foo", "1.0.0", &"ab".repeat(32), ArchiveNamespace::Hosted);

        assert!(!store.exists(&key).await.unwrap());
        store.put_archive(&key, b"tarball bytes").await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(
            store.get_archive(&key).await.unwrap().as_ref(),
            b"tarball bytes"
        );
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_dir, store) = store().await;
        let result = store.get_archive("hosted-packages/x/1.0.0/a.tar.gz").await;
        assert!(matches!(result, Err(BlobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store().await;
        let key = archive_key("foo", "1.0.0", &"ab".repeat(32), ArchiveNamespace::Hosted);
        store.put_archive(&key, b"x").await.unwrap();
        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_with_identical_content_is_a_noop() {
        let (_dir, store) = store().await;
        let key = archive_key("foo", "1.0.0", &"ab".repeat(32), ArchiveNamespace::Hosted);
        store.put_archive(&key, b"same").await.unwrap();
        store.put_archive(&key, b"same").await.unwrap();
        assert_eq!(store.get_archive(&key).await.unwrap().as_ref(), b"same");
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix() {
        let (_dir, store) = store().await;
        let hosted = archive_key("foo", "1.0.0", &"ab".repeat(32), ArchiveNamespace::Hosted);
        let cached = archive_key("bar", "2.0.0", &"cd".repeat(32), ArchiveNamespace::Cached);
        store.put_archive(&hosted, b"a").await.unwrap();
        store.put_archive(&cached, b"b").await.unwrap();

        let mut all = store.list_keys("").await.unwrap();
        all.sort();
        assert_eq!(all.len(), 2);

        let cached_only = store.list_keys("cached-packages").await.unwrap();
        assert_eq!(cached_only, vec![cached]);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.get_archive("../outside").await,
            Err(BlobStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put_archive("a/../../b", b"x").await,
            Err(BlobStoreError::InvalidKey(_))
        ));
    }
}
