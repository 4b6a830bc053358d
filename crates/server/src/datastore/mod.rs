use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backup::{BackupData, ImportCounts};

mod sql;
mod sqlite;

#[cfg(feature = "postgres")]
mod postgres;

pub use sql::split_statements;
pub use sqlite::SqliteDataStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDataStore;

/// One schema revision. Revisions are append-only and applied in declaration
/// order; `id` is recorded in `schema_migrations`.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub id: &'static str,
    pub sql: &'static str,
}

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("package `{0}` was not found")]
    PackageNotFound(String),

    #[error("version `{version}` of package `{package}` was not found")]
    VersionNotFound { package: String, version: String },

    #[error("version `{version}` of package `{package}` already exists with a different archive")]
    VersionConflict { package: String, version: String },

    #[error("package `{0}` cannot move between the hosted and cached namespaces")]
    PackageKindConflict(String),

    #[error("user `{0}` already exists")]
    UserExists(String),

    #[error("admin user `{0}` already exists")]
    AdminUserExists(String),

    #[error("a token labelled `{0}` already exists for this user")]
    TokenLabelExists(String),

    #[error("upload session `{0}` was not found")]
    SessionNotFound(String),

    #[error("webhook `{0}` was not found")]
    WebhookNotFound(i64),

    #[error("unsupported backup format version {0}")]
    UnsupportedBackupVersion(u32),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("a connection could not be established to the PostgreSQL server: {0}")]
    ConnectionPool(#[from] deadpool_postgres::PoolError),

    #[error("datastore internal error: {0}")]
    Internal(String),
}

/// A package row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub description: Option<String>,
    pub is_discontinued: bool,
    pub replaced_by: Option<String>,
    pub is_upstream_cache: bool,
    /// Denormalised latest version, maintained by the registry service.
    pub latest_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A package version row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageVersion {
    pub package_name: String,
    pub version: String,
    /// The manifest as canonical JSON.
    pub pubspec: serde_json::Value,
    pub archive_key: String,
    pub archive_sha256: String,
    /// Where the archive lives upstream, for cached versions whose blob has
    /// not been materialised yet.
    pub upstream_archive_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub is_retracted: bool,
    pub retracted_at: Option<DateTime<Utc>>,
    pub retraction_message: Option<String>,
    pub download_count: u64,
}

/// The input to `upsert_package_version`.
#[derive(Debug, Clone)]
pub struct NewPackageVersion {
    pub package_name: String,
    pub version: String,
    pub pubspec: serde_json::Value,
    pub archive_key: String,
    pub archive_sha256: String,
    pub upstream_archive_url: Option<String>,
    /// Which namespace the package belongs to when it has to be created.
    pub is_upstream_cache: bool,
    pub description: Option<String>,
}

/// The result of `upsert_package_version`.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// False when the identical version already existed (idempotent re-publish).
    pub created: bool,
    pub version: PackageVersion,
}

/// Aggregates attached to a package in listings.
#[derive(Debug, Clone)]
pub struct PackageWithStats {
    pub package: Package,
    pub version_count: u64,
    pub download_count: u64,
}

/// One page of packages plus the total row count.
#[derive(Debug, Clone)]
pub struct PackagePage {
    pub packages: Vec<PackageWithStats>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUser {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub must_change_password: bool,
    pub login_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: i64,
    pub user_id: i64,
    pub label: String,
    /// Lowercase hex SHA-256 of the raw token. The raw value is never stored.
    pub token_hash: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Upload session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Completed,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub user_id: Option<i64>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub is_active: bool,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Webhook {
    /// Whether this webhook subscribes to `event_type`.
    ///
    /// The wildcard `*` matches every event except `package.downloaded`,
    /// which must be named explicitly.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        if self.events.iter().any(|e| e == event_type) {
            return true;
        }
        event_type != crate::webhook::EVENT_PACKAGE_DOWNLOADED
            && self.events.iter().any(|e| e == "*")
    }
}

#[derive(Debug, Clone)]
pub struct NewWebhookDelivery {
    pub webhook_id: i64,
    pub event_type: String,
    pub delivered_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event_type: String,
    pub delivered_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub success: bool,
}

/// Who performed an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Admin,
    Anonymous,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Anonymous => "anonymous",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "anonymous" => Some(Self::Anonymous),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub activity_type: String,
    pub actor_type: ActorType,
    pub actor_id: Option<i64>,
    pub actor_email: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewActivity {
    /// A system activity with a target and no actor.
    pub fn system(activity_type: &str, target_type: &str, target_id: impl Into<String>) -> Self {
        Self {
            activity_type: activity_type.to_string(),
            actor_type: ActorType::System,
            actor_id: None,
            actor_email: None,
            target_type: Some(target_type.to_string()),
            target_id: Some(target_id.into()),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub activity_type: String,
    pub actor_type: ActorType,
    pub actor_id: Option<i64>,
    pub actor_email: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Registry-wide aggregates for the stats endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub hosted_packages: u64,
    pub cached_packages: u64,
    pub package_versions: u64,
    pub users: u64,
    pub webhooks: u64,
    pub total_downloads: u64,
}

/// The result of the datastore health check.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub status: String,
    /// `embedded` or `sql`.
    pub db_type: &'static str,
}

/// Implemented by metadata stores.
///
/// Both backends behave identically; the store is the single source of truth
/// for durable state and every cross-cutting mutation happens inside one of
/// its transactions.
#[axum::async_trait]
pub trait DataStore: Send + Sync {
    /// Applies any pending schema migrations, returning the number applied.
    async fn migrate(&self) -> Result<u32, DataStoreError>;

    /// Reports backend health.
    async fn health(&self) -> HealthStatus;

    // ── packages ───────────────────────────────────────────────────────

    async fn get_package(&self, name: &str) -> Result<Option<Package>, DataStoreError>;

    /// Atomically creates the package row if missing, confirms the namespace
    /// kind, and creates (or confirms-identical) the version row.
    ///
    /// Concurrent upserts for the same `(package, version)` are serialised:
    /// all but one fail with `VersionConflict` when the sha256 differs, and
    /// succeed as no-ops otherwise.
    async fn upsert_package_version(
        &self,
        new: NewPackageVersion,
    ) -> Result<UpsertOutcome, DataStoreError>;

    async fn version_exists(&self, name: &str, version: &str) -> Result<bool, DataStoreError>;

    async fn get_package_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PackageVersion>, DataStoreError>;

    /// All versions of a package, oldest publish first.
    async fn get_package_versions(
        &self,
        name: &str,
    ) -> Result<Vec<PackageVersion>, DataStoreError>;

    async fn list_packages(&self, page: u32, limit: u32) -> Result<PackagePage, DataStoreError>;

    async fn list_packages_by_type(
        &self,
        is_upstream_cache: bool,
        page: u32,
        limit: u32,
    ) -> Result<PackagePage, DataStoreError>;

    /// Case-insensitive substring match on the package name.
    async fn search_packages(
        &self,
        query: &str,
        page: u32,
        limit: u32,
    ) -> Result<PackagePage, DataStoreError>;

    /// Deletes a package and all of its versions, returning the number of
    /// versions removed.
    async fn delete_package(&self, name: &str) -> Result<u64, DataStoreError>;

    async fn discontinue_package(
        &self,
        name: &str,
        replaced_by: Option<&str>,
    ) -> Result<(), DataStoreError>;

    async fn retract_version(
        &self,
        name: &str,
        version: &str,
        message: Option<&str>,
    ) -> Result<(), DataStoreError>;

    async fn unretract_version(&self, name: &str, version: &str) -> Result<(), DataStoreError>;

    /// Applies a batch of coalesced download increments.
    async fn increment_download_counts(
        &self,
        counts: &[(String, String, u64)],
    ) -> Result<(), DataStoreError>;

    /// Refreshes the denormalised `latest_version` and `description` columns.
    async fn update_package_denorm(
        &self,
        name: &str,
        latest_version: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), DataStoreError>;

    /// Removes every cached-namespace package, returning the count removed.
    async fn clear_cached_packages(&self) -> Result<u64, DataStoreError>;

    /// Every archive key referenced by a version row.
    async fn all_archive_keys(&self) -> Result<Vec<String>, DataStoreError>;

    async fn stats(&self) -> Result<StoreStats, DataStoreError>;

    // ── users ──────────────────────────────────────────────────────────

    async fn create_user(&self, email: &str, password_hash: &str)
        -> Result<User, DataStoreError>;

    async fn get_user(&self, id: i64) -> Result<Option<User>, DataStoreError>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DataStoreError>;

    async fn list_users(&self, page: u32, limit: u32)
        -> Result<(Vec<User>, u64), DataStoreError>;

    async fn delete_user(&self, id: i64) -> Result<bool, DataStoreError>;

    // ── admin users ────────────────────────────────────────────────────

    async fn create_admin_user(
        &self,
        username: &str,
        password_hash: &str,
        must_change_password: bool,
    ) -> Result<AdminUser, DataStoreError>;

    async fn list_admin_users(&self) -> Result<Vec<AdminUser>, DataStoreError>;

    async fn delete_admin_user(&self, id: i64) -> Result<bool, DataStoreError>;

    // ── tokens ─────────────────────────────────────────────────────────

    async fn create_token(
        &self,
        user_id: i64,
        label: &str,
        token_hash: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AuthToken, DataStoreError>;

    /// Tokens for one user, or all tokens when `user_id` is `None`.
    async fn list_tokens(&self, user_id: Option<i64>)
        -> Result<Vec<AuthToken>, DataStoreError>;

    async fn get_token(&self, id: i64) -> Result<Option<AuthToken>, DataStoreError>;

    async fn get_token_by_hash(&self, hash: &str)
        -> Result<Option<AuthToken>, DataStoreError>;

    async fn delete_token(&self, id: i64) -> Result<bool, DataStoreError>;

    /// Updates `last_used_at`. Callers coalesce; the store just writes.
    async fn touch_token(&self, hash: &str, at: DateTime<Utc>) -> Result<(), DataStoreError>;

    // ── upload sessions ────────────────────────────────────────────────

    async fn create_upload_session(
        &self,
        id: &str,
        user_id: Option<i64>,
        expires_at: DateTime<Utc>,
    ) -> Result<UploadSession, DataStoreError>;

    async fn get_upload_session(
        &self,
        id: &str,
    ) -> Result<Option<UploadSession>, DataStoreError>;

    /// Transitions an open session to `completed`; false if it was not open.
    async fn complete_upload_session(&self, id: &str) -> Result<bool, DataStoreError>;

    /// Marks a session terminally failed so retries report expiry.
    async fn expire_upload_session(&self, id: &str) -> Result<(), DataStoreError>;

    /// Removes sessions whose `expires_at` is before `now`.
    async fn cleanup_expired_sessions(&self, now: DateTime<Utc>)
        -> Result<u64, DataStoreError>;

    // ── webhooks ───────────────────────────────────────────────────────

    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook, DataStoreError>;

    async fn get_webhook(&self, id: i64) -> Result<Option<Webhook>, DataStoreError>;

    async fn list_webhooks(&self, active_only: bool) -> Result<Vec<Webhook>, DataStoreError>;

    async fn delete_webhook(&self, id: i64) -> Result<bool, DataStoreError>;

    async fn set_webhook_active(&self, id: i64, active: bool) -> Result<bool, DataStoreError>;

    /// Records the outcome of a delivery attempt on the webhook row: resets
    /// the failure count on success, increments it on failure, stamps
    /// `last_triggered_at`, and returns the new failure count.
    async fn record_webhook_attempt(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<u64, DataStoreError>;

    async fn insert_webhook_delivery(
        &self,
        delivery: NewWebhookDelivery,
    ) -> Result<(), DataStoreError>;

    async fn list_webhook_deliveries(
        &self,
        webhook_id: i64,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DataStoreError>;

    // ── activity ───────────────────────────────────────────────────────

    async fn log_activity(&self, activity: NewActivity) -> Result<(), DataStoreError>;

    /// Most recent entries first; `before` pages backwards through time.
    async fn recent_activity(
        &self,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Activity>, DataStoreError>;

    // ── site config ────────────────────────────────────────────────────

    async fn get_config(&self, key: &str) -> Result<Option<String>, DataStoreError>;

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DataStoreError>;

    async fn all_config(&self) -> Result<Vec<(String, String)>, DataStoreError>;

    // ── staged storage config ──────────────────────────────────────────

    async fn get_storage_config(
        &self,
        slot: &str,
    ) -> Result<Option<serde_json::Value>, DataStoreError>;

    async fn set_storage_config(
        &self,
        slot: &str,
        value: &serde_json::Value,
    ) -> Result<(), DataStoreError>;

    // ── backup ─────────────────────────────────────────────────────────

    /// Exports every persistent table. Blobs are not included.
    async fn export_backup(&self) -> Result<BackupData, DataStoreError>;

    /// Imports a backup; with `dry_run` it only counts.
    async fn import_backup(
        &self,
        data: &BackupData,
        dry_run: bool,
    ) -> Result<ImportCounts, DataStoreError>;
}
