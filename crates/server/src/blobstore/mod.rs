use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

pub use local::LocalBlobStore;
#[cfg(feature = "s3")]
pub use s3::S3BlobStore;

/// Key prefix for archives published into this registry.
pub const HOSTED_PREFIX: &str = "hosted-packages";

/// Key prefix for archives mirrored from the upstream registry.
pub const CACHED_PREFIX: &str = "cached-packages";

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob `{0}` was not found")]
    NotFound(String),

    #[error("invalid blob key `{0}`")]
    InvalidKey(String),

    /// I/O and backend failures; the caller may retry.
    #[error("blob store transient error: {0}")]
    Transient(String),
}

/// Which namespace an archive belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveNamespace {
    /// Authoritative packages published into this registry.
    Hosted,
    /// Read-through mirrors of upstream packages.
    Cached,
}

impl ArchiveNamespace {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Hosted => HOSTED_PREFIX,
            Self::Cached => CACHED_PREFIX,
        }
    }
}

/// Derives the deterministic blob key for an archive.
///
/// The output is byte-identical across calls so it can be re-derived on the
/// read path without consulting the store.
pub fn archive_key(name: &str, version: &str, sha256: &str, namespace: ArchiveNamespace) -> String {
    format!(
        "{prefix}/{name}/{version}/{sha256}.tar.gz",
        prefix = namespace.prefix()
    )
}

/// Parses an archive key back into `(namespace, name, version)`.
pub fn parse_archive_key(key: &str) -> Option<(ArchiveNamespace, &str, &str)> {
    let (prefix, rest) = key.split_once('/')?;
    let namespace = match prefix {
        HOSTED_PREFIX => ArchiveNamespace::Hosted,
        CACHED_PREFIX => ArchiveNamespace::Cached,
        _ => return None,
    };
    let mut parts = rest.split('/');
    let name = parts.next()?;
    let version = parts.next()?;
    let file = parts.next()?;
    if parts.next().is_some() || !file.ends_with(".tar.gz") {
        return None;
    }
    Some((namespace, name, version))
}

/// Renders the public download URL for a blob key.
///
/// Archive keys resolve to the registry's canonical archive endpoint; any
/// other key resolves to the fallback blob endpoint served by the same
/// process.
pub fn download_url(base_url: &str, key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match parse_archive_key(key) {
        Some((_, name, version)) => {
            format!("{base}/api/packages/{name}/versions/{version}/archive.tar.gz")
        }
        None => format!("{base}/api/blobs/{key}"),
    }
}

/// Rejects keys that could escape the store's namespace.
pub fn validate_key(key: &str) -> Result<(), BlobStoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(BlobStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Implemented by blob stores.
#[axum::async_trait]
pub trait BlobStore: Send + Sync {
    /// Initialises the backing namespace. Idempotent.
    async fn ensure_ready(&self) -> Result<(), BlobStoreError>;

    /// Writes a blob atomically. Overwrites are permitted; callers guarantee
    /// identical content for an existing key.
    async fn put_archive(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError>;

    async fn get_archive(&self, key: &str) -> Result<Bytes, BlobStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError>;

    /// Removes a blob; succeeds when absent.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

    /// Every key under `prefix`, in no particular order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError>;

    /// A time-limited direct download URL, for stores that can sign one.
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

    #[test]
    fn archive_keys_are_deterministic() {
        let sha = "ab".repeat(32);
        let key = archive_key("foo", "1.0.0", &sha, ArchiveNamespace::Hosted);
        assert_eq!(key, format!("hosted-packages/foo/1.0.0/{sha}.tar.gz"));
        assert_eq!(
            key,
            archive_key("foo", "1.0.0", &sha, ArchiveNamespace::Hosted)
        );

        let cached = archive_key("bar", "2.0.0-beta.1", &sha, ArchiveNamespace::Cached);
        assert_eq!(cached, format!("cached-packages/bar/2.0.0-beta.1/{sha}.tar.gz"));
    }

    #[test]
    fn parse_round_trips_derived_keys() {
        let sha = "cd".repeat(32);
        let key = archive_key("foo", "1.2.3", &sha, ArchiveNamespace::Cached);
        let (ns, name, version) = parse_archive_key(&key).unwrap();
        assert_eq!(ns, ArchiveNamespace::Cached);
        assert_eq!(name, "foo");
        assert_eq!(version, "1.2.3");

        assert!(parse_archive_key("something/else").is_none());
        assert!(parse_archive_key("hosted-packages/foo/1.0.0/extra/a.tar.gz").is_none());
    }

    #[test]
    fn archive_keys_resolve_to_the_canonical_endpoint() {
        let sha = "ef".repeat(32);
        let key = archive_key("foo", "1.0.0", &sha, ArchiveNamespace::Hosted);
        assert_eq!(
            download_url("https://pub.example/", &key),
            "https://pub.example/api/packages/foo/versions/1.0.0/archive.tar.gz"
        );
    }

    #[test]
    fn other_keys_resolve_to_the_fallback_endpoint() {
        assert_eq!(
            download_url("https://pub.example", "misc/report.json"),
            "https://pub.example/api/blobs/misc/report.json"
        );
    }

    #[test]
    fn traversal_keys_are_rejected() {
        assert!(validate_key("hosted-packages/foo/1.0.0/a.tar.gz").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/./b").is_err());
        assert!(validate_key("").is_err());
    }
}
