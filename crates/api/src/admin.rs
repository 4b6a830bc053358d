//! Types for the admin API consumed by external consoles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The pagination envelope shared by every paged response.
///
/// `page` is 1-based; `total_pages` is at least 1 even when `total` is 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Total matching rows.
    pub total: u64,
    /// The requested page (1-based).
    pub page: u32,
    /// The requested page size.
    pub limit: u32,
    /// Total pages at this limit.
    pub total_pages: u64,
    /// Whether a previous page exists.
    pub has_prev_page: bool,
    /// Whether a next page exists.
    pub has_next_page: bool,
}

impl Pagination {
    /// Computes the envelope for a page over `total` rows.
    pub fn new(total: u64, page: u32, limit: u32) -> Self {
        let total_pages = if total == 0 {
            1
        } else {
            total.div_ceil(limit.max(1) as u64)
        };
        Self {
            total,
            page,
            limit,
            total_pages,
            has_prev_page: page > 1,
            has_next_page: (page as u64) < total_pages,
        }
    }
}

/// A package row in listings and search results.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageSummary {
    /// The package name.
    pub name: String,
    /// Description denormalised from the latest non-retracted version.
    pub description: Option<String>,
    /// Whether the package is discontinued.
    pub is_discontinued: bool,
    /// The suggested replacement, if discontinued.
    pub replaced_by: Option<String>,
    /// Whether the package lives in the cached (upstream shadow) namespace.
    pub is_upstream_cache: bool,
    /// The latest version string, if any versions exist.
    pub latest: Option<String>,
    /// Number of versions.
    pub version_count: u64,
    /// Sum of per-version download counts.
    pub download_count: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// A page of packages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageList {
    /// The packages on this page.
    pub packages: Vec<PackageSummary>,
    /// The pagination envelope.
    #[serde(flatten)]
    pub pagination: Pagination,
}

/// A version row in the package detail response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionSummary {
    /// The version string.
    pub version: String,
    /// The lowercase hex SHA-256 of the archive.
    pub archive_sha256: String,
    /// When the version was published.
    pub published_at: DateTime<Utc>,
    /// Whether the version is retracted.
    pub is_retracted: bool,
    /// The optional retraction message.
    pub retraction_message: Option<String>,
    /// Downloads recorded for this version.
    pub download_count: u64,
}

/// The full package detail response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageDetail {
    /// The package summary.
    #[serde(flatten)]
    pub package: PackageSummary,
    /// All versions, oldest first.
    pub versions: Vec<VersionSummary>,
}

/// Request body for discontinuing a package.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscontinueRequest {
    /// The suggested replacement package, if any.
    #[serde(default)]
    pub replaced_by: Option<String>,
}

/// Request body for retracting a version.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetractRequest {
    /// The optional message shown to resolvers.
    #[serde(default)]
    pub message: Option<String>,
}

/// A registry user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserSummary {
    /// The user id.
    pub id: i64,
    /// The unique email address.
    pub email: String,
    /// Whether the account is active.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful login, if any.
    pub last_login_at: Option<DateTime<Utc>>,
}

/// A page of users.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserList {
    /// The users on this page.
    pub users: Vec<UserSummary>,
    /// The pagination envelope.
    #[serde(flatten)]
    pub pagination: Pagination,
}

/// Request body for creating a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateUserRequest {
    /// The unique email address.
    pub email: String,
    /// The plaintext password; stored only as an Argon2id hash.
    pub password: String,
}

/// An administrative console user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminUserSummary {
    /// The admin user id.
    pub id: i64,
    /// The unique username.
    pub username: String,
    /// Whether a password change is required at next login.
    pub must_change_password: bool,
    /// Number of recorded logins.
    pub login_count: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful login, if any.
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Request body for creating an admin user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateAdminUserRequest {
    /// The unique username.
    pub username: String,
    /// The plaintext password; stored only as an Argon2id hash.
    pub password: String,
    /// Whether to force a password change at next login.
    #[serde(default)]
    pub must_change_password: bool,
}

/// Request body for creating a token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    /// The owning user; defaults to the caller.
    #[serde(default)]
    pub user_id: Option<i64>,
    /// The label, unique per user.
    pub label: String,
    /// The scope strings to attach.
    pub scopes: Vec<String>,
    /// The optional expiry; bounded by `token_max_ttl_days`.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The response to token creation.
///
/// `token` is the raw bearer value and appears only here, exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    /// The raw token value.
    pub token: String,
    /// The created token's metadata.
    #[serde(flatten)]
    pub summary: TokenSummary,
}

/// A token row (the raw value is never included).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenSummary {
    /// The token id.
    pub id: i64,
    /// The owning user id.
    pub user_id: i64,
    /// The label, unique per user.
    pub label: String,
    /// The attached scope strings.
    pub scopes: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry, if bounded.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last authenticated use, coalesced to minute granularity.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Request body for creating a webhook.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateWebhookRequest {
    /// The delivery URL (http or https).
    pub url: String,
    /// Event type strings, or the wildcard `*`.
    pub events: Vec<String>,
    /// The optional HMAC secret.
    #[serde(default)]
    pub secret: Option<String>,
    /// Whether the webhook starts active.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// A webhook row (the secret is never included).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookSummary {
    /// The webhook id.
    pub id: i64,
    /// The delivery URL.
    pub url: String,
    /// Subscribed event types.
    pub events: Vec<String>,
    /// Whether a signing secret is configured.
    pub has_secret: bool,
    /// Whether deliveries are enabled.
    pub is_active: bool,
    /// Consecutive-failure counter.
    pub failure_count: u64,
    /// Time of the most recent delivery attempt.
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// A webhook delivery attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliverySummary {
    /// The delivery id.
    pub id: i64,
    /// The event type delivered.
    pub event_type: String,
    /// When the attempt completed.
    pub delivered_at: DateTime<Utc>,
    /// The response status, when a response was received.
    pub status_code: Option<u16>,
    /// Wall time of the attempt in milliseconds.
    pub duration_ms: u64,
    /// The error, when the attempt failed without a 2xx.
    pub error: Option<String>,
    /// Whether the attempt received a 2xx.
    pub success: bool,
}

/// An activity log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// The entry id.
    pub id: i64,
    /// The activity type, e.g. `package_published`.
    pub activity_type: String,
    /// Who acted: `user`, `admin`, `anonymous`, or `system`.
    pub actor_type: String,
    /// The acting user id, when known.
    pub actor_id: Option<i64>,
    /// The acting user email, when known.
    pub actor_email: Option<String>,
    /// The target kind, e.g. `package`.
    pub target_type: Option<String>,
    /// The target identifier, e.g. `foo@1.0.0`.
    pub target_id: Option<String>,
    /// Free-form JSON metadata.
    pub metadata: serde_json::Value,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
}

/// The registry stats response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Packages in the hosted (authoritative) namespace.
    pub hosted_packages: u64,
    /// Packages in the cached (upstream shadow) namespace.
    pub cached_packages: u64,
    /// Total package versions.
    pub package_versions: u64,
    /// Registered users.
    pub users: u64,
    /// Configured webhooks.
    pub webhooks: u64,
    /// Sum of all download counts.
    pub total_downloads: u64,
}

/// One site-config entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// The key.
    pub key: String,
    /// The string value.
    pub value: String,
}

/// A blob-storage backend configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    /// Local filesystem storage.
    Local {
        /// The base directory for blobs.
        path: String,
    },
    /// S3-compatible object storage.
    S3 {
        /// The bucket name.
        bucket: String,
        /// The region.
        region: String,
        /// A custom endpoint for S3-compatible providers.
        #[serde(default)]
        endpoint: Option<String>,
        /// The access key id.
        access_key_id: String,
        /// The secret access key.
        secret_access_key: String,
    },
}

/// The staged storage configuration: the running snapshot plus the editable one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfigPair {
    /// The snapshot the running process was started with.
    pub active: StorageBackendConfig,
    /// The editable snapshot promoted at next activation, if any.
    pub pending: Option<StorageBackendConfig>,
}

/// The response to `POST /admin/api/cache/clear`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheClearResponse {
    /// Cached packages removed from the metadata store.
    pub removed_packages: u64,
    /// Blobs removed from the cached namespace.
    pub removed_blobs: u64,
}

/// The response to the orphan-blob GC pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobGcResponse {
    /// Blobs examined.
    pub scanned: u64,
    /// Orphan blobs removed.
    pub removed: u64,
}

/// The datastore health response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok` or an error description.
    pub status: String,
    /// The backend type: `embedded` or `sql`.
    #[serde(rename = "type")]
    pub db_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pagination_of_empty_set_has_one_page() {
        let p = Pagination::new(0, 1, 20);
        assert_eq!(p.total_pages, 1);
        assert!(!p.has_prev_page);
        assert!(!p.has_next_page);
    }

    #[test]
    fn pagination_rounds_up() {
        let p = Pagination::new(41, 2, 20);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_prev_page);
        assert!(p.has_next_page);
        let last = Pagination::new(41, 3, 20);
        assert!(!last.has_next_page);
    }

    #[test]
    fn storage_backend_tags() {
        let local = StorageBackendConfig::Local {
            path: "data/blobs".to_string(),
        };
        let json = serde_json::to_value(&local).unwrap();
        assert_eq!(json["backend"], "local");
        let back: StorageBackendConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, local);
    }
}
