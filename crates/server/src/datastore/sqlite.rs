//! The embedded single-file metadata store.
//!
//! All calls run on one connection behind a mutex, hopping to the blocking
//! pool. The single connection also serialises concurrent
//! `upsert_package_version` calls, which is what gives the embedded backend
//! its race-freedom for identical concurrent publishes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::sql::split_statements;
use super::{
    Activity, ActorType, AdminUser, AuthToken, DataStore, DataStoreError, HealthStatus,
    Migration, NewActivity, NewPackageVersion, NewWebhook, NewWebhookDelivery, Package,
    PackagePage, PackageVersion, PackageWithStats, SessionState, StoreStats, UploadSession,
    UpsertOutcome, User, Webhook, WebhookDelivery,
};
use crate::backup::{BackupData, ImportCounts};

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_packages_users",
        sql: r#"
CREATE TABLE packages (
    name TEXT PRIMARY KEY,
    description TEXT,
    is_discontinued INTEGER NOT NULL DEFAULT 0,
    replaced_by TEXT,
    is_upstream_cache INTEGER NOT NULL DEFAULT 0,
    latest_version TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE package_versions (
    package_name TEXT NOT NULL REFERENCES packages(name) ON DELETE CASCADE,
    version TEXT NOT NULL,
    pubspec TEXT NOT NULL,
    archive_key TEXT NOT NULL,
    archive_sha256 TEXT NOT NULL,
    upstream_archive_url TEXT,
    published_at TEXT NOT NULL,
    is_retracted INTEGER NOT NULL DEFAULT 0,
    retracted_at TEXT,
    retraction_message TEXT,
    download_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (package_name, version)
);

CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_login_at TEXT
);

CREATE TABLE admin_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    must_change_password INTEGER NOT NULL DEFAULT 0,
    login_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_login_at TEXT
);

CREATE TABLE auth_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    label TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    scopes TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    last_used_at TEXT,
    UNIQUE (user_id, label)
);

CREATE TABLE upload_sessions (
    id TEXT PRIMARY KEY,
    user_id INTEGER,
    state TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE site_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE storage_config (
    slot TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
    },
    Migration {
        id: "0002_webhooks_activity",
        sql: r#"
CREATE TABLE webhooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    events TEXT NOT NULL,
    secret TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    failure_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_triggered_at TEXT
);

CREATE TABLE webhook_deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id INTEGER NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    delivered_at TEXT NOT NULL,
    status_code INTEGER,
    duration_ms INTEGER NOT NULL,
    error TEXT,
    success INTEGER NOT NULL
);

CREATE TABLE activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    activity_type TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    actor_id INTEGER,
    actor_email TEXT,
    target_type TEXT,
    target_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
"#,
    },
    Migration {
        id: "0003_indexes",
        sql: r#"
CREATE INDEX idx_package_versions_published
    ON package_versions (package_name, published_at);
CREATE INDEX idx_activity_log_created ON activity_log (created_at DESC);
CREATE INDEX idx_webhook_deliveries_webhook
    ON webhook_deliveries (webhook_id, delivered_at DESC);
"#,
    },
];

/// The embedded metadata store, backed by a single SQLite file.
///
/// Local-filesystem deployments must not share the file between active
/// server instances.
pub struct SqliteDataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DataStoreError> {
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    /// Opens a transient in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, DataStoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, DataStoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, DataStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DataStoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| DataStoreError::Internal("connection mutex poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| DataStoreError::Internal(format!("blocking task failed: {e}")))?
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn get_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn get_string_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

const PACKAGE_COLUMNS: &str = "name, description, is_discontinued, replaced_by, \
     is_upstream_cache, latest_version, created_at, updated_at";

const PREFIXED_PACKAGE_COLUMNS: &str = "p.name, p.description, p.is_discontinued, \
     p.replaced_by, p.is_upstream_cache, p.latest_version, p.created_at, p.updated_at";

fn package_from_row(row: &Row<'_>) -> rusqlite::Result<Package> {
    Ok(Package {
        name: row.get(0)?,
        description: row.get(1)?,
        is_discontinued: row.get(2)?,
        replaced_by: row.get(3)?,
        is_upstream_cache: row.get(4)?,
        latest_version: row.get(5)?,
        created_at: get_ts(row, 6)?,
        updated_at: get_ts(row, 7)?,
    })
}

const VERSION_COLUMNS: &str = "package_name, version, pubspec, archive_key, archive_sha256, \
     upstream_archive_url, published_at, is_retracted, retracted_at, retraction_message, \
     download_count";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<PackageVersion> {
    Ok(PackageVersion {
        package_name: row.get(0)?,
        version: row.get(1)?,
        pubspec: get_json(row, 2)?,
        archive_key: row.get(3)?,
        archive_sha256: row.get(4)?,
        upstream_archive_url: row.get(5)?,
        published_at: get_ts(row, 6)?,
        is_retracted: row.get(7)?,
        retracted_at: get_opt_ts(row, 8)?,
        retraction_message: row.get(9)?,
        download_count: row.get(10)?,
    })
}

const USER_COLUMNS: &str = "id, email, password_hash, is_active, created_at, last_login_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        is_active: row.get(3)?,
        created_at: get_ts(row, 4)?,
        last_login_at: get_opt_ts(row, 5)?,
    })
}

const ADMIN_USER_COLUMNS: &str =
    "id, username, password_hash, must_change_password, login_count, created_at, last_login_at";

fn admin_user_from_row(row: &Row<'_>) -> rusqlite::Result<AdminUser> {
    Ok(AdminUser {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        must_change_password: row.get(3)?,
        login_count: row.get(4)?,
        created_at: get_ts(row, 5)?,
        last_login_at: get_opt_ts(row, 6)?,
    })
}

const TOKEN_COLUMNS: &str =
    "id, user_id, label, token_hash, scopes, created_at, expires_at, last_used_at";

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<AuthToken> {
    Ok(AuthToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        label: row.get(2)?,
        token_hash: row.get(3)?,
        scopes: get_string_list(row, 4)?,
        created_at: get_ts(row, 5)?,
        expires_at: get_opt_ts(row, 6)?,
        last_used_at: get_opt_ts(row, 7)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<UploadSession> {
    let state: String = row.get(2)?;
    Ok(UploadSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        state: SessionState::parse(&state).ok_or_else(|| {
            conversion_err(2, std::io::Error::new(std::io::ErrorKind::InvalidData, state))
        })?,
        created_at: get_ts(row, 3)?,
        expires_at: get_ts(row, 4)?,
    })
}

const WEBHOOK_COLUMNS: &str =
    "id, url, events, secret, is_active, failure_count, created_at, last_triggered_at";

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<Webhook> {
    Ok(Webhook {
        id: row.get(0)?,
        url: row.get(1)?,
        events: get_string_list(row, 2)?,
        secret: row.get(3)?,
        is_active: row.get(4)?,
        failure_count: row.get(5)?,
        created_at: get_ts(row, 6)?,
        last_triggered_at: get_opt_ts(row, 7)?,
    })
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookDelivery> {
    let status: Option<i64> = row.get(4)?;
    Ok(WebhookDelivery {
        id: row.get(0)?,
        webhook_id: row.get(1)?,
        event_type: row.get(2)?,
        delivered_at: get_ts(row, 3)?,
        status_code: status.map(|s| s as u16),
        duration_ms: row.get(5)?,
        error: row.get(6)?,
        success: row.get(7)?,
    })
}

const ACTIVITY_COLUMNS: &str = "id, activity_type, actor_type, actor_id, actor_email, \
     target_type, target_id, metadata, created_at";

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    let actor: String = row.get(2)?;
    Ok(Activity {
        id: row.get(0)?,
        activity_type: row.get(1)?,
        actor_type: ActorType::parse(&actor).ok_or_else(|| {
            conversion_err(2, std::io::Error::new(std::io::ErrorKind::InvalidData, actor))
        })?,
        actor_id: row.get(3)?,
        actor_email: row.get(4)?,
        target_type: row.get(5)?,
        target_id: row.get(6)?,
        metadata: get_json(row, 7)?,
        created_at: get_ts(row, 8)?,
    })
}

/// Pages over the `packages` table with optional filtering.
fn query_packages(
    conn: &Connection,
    where_clause: &str,
    filter_params: &[&dyn rusqlite::ToSql],
    page: u32,
    limit: u32,
) -> Result<PackagePage, DataStoreError> {
    let total: u64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM packages p {where_clause}"),
        filter_params,
        |row| row.get(0),
    )?;

    let limit = limit.max(1);
    let offset = (page.max(1) as u64 - 1) * limit as u64;
    let sql = format!(
        "SELECT {PREFIXED_PACKAGE_COLUMNS}, \
             (SELECT COUNT(*) FROM package_versions v WHERE v.package_name = p.name), \
             (SELECT COALESCE(SUM(v.download_count), 0) \
                FROM package_versions v WHERE v.package_name = p.name) \
         FROM packages p {where_clause} \
         ORDER BY p.name LIMIT {limit} OFFSET {offset}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let packages = stmt
        .query_map(filter_params, |row| {
            Ok(PackageWithStats {
                package: package_from_row(row)?,
                version_count: row.get(8)?,
                download_count: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(PackagePage { packages, total })
}

#[axum::async_trait]
impl DataStore for SqliteDataStore {
    async fn migrate(&self) -> Result<u32, DataStoreError> {
        self.call(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (\
                     id TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
                [],
            )?;

            let applied: HashSet<String> = tx
                .prepare("SELECT id FROM schema_migrations")?
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;

            let mut count = 0;
            for migration in MIGRATIONS {
                if applied.contains(migration.id) {
                    continue;
                }
                for statement in split_statements(migration.sql) {
                    tx.execute(&statement, [])?;
                }
                tx.execute(
                    "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                    params![migration.id, ts(&Utc::now())],
                )?;
                count += 1;
            }

            tx.commit()?;
            Ok(count)
        })
        .await
    }

    async fn health(&self) -> HealthStatus {
        let result = self
            .call(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(Into::into)
            })
            .await;
        HealthStatus {
            status: match result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
            db_type: "embedded",
        }
    }

    async fn get_package(&self, name: &str) -> Result<Option<Package>, DataStoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE name = ?1"),
                params![name],
                package_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn upsert_package_version(
        &self,
        new: NewPackageVersion,
    ) -> Result<UpsertOutcome, DataStoreError> {
        self.call(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing_kind: Option<bool> = tx
                .query_row(
                    "SELECT is_upstream_cache FROM packages WHERE name = ?1",
                    params![new.package_name],
                    |row| row.get(0),
                )
                .optional()?;

            match existing_kind {
                None => {
                    tx.execute(
                        "INSERT INTO packages \
                             (name, description, is_upstream_cache, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![
                            new.package_name,
                            new.description,
                            new.is_upstream_cache,
                            ts(&now)
                        ],
                    )?;
                }
                Some(kind) if kind != new.is_upstream_cache => {
                    return Err(DataStoreError::PackageKindConflict(new.package_name));
                }
                Some(_) => {}
            }

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {VERSION_COLUMNS} FROM package_versions \
                         WHERE package_name = ?1 AND version = ?2"
                    ),
                    params![new.package_name, new.version],
                    version_from_row,
                )
                .optional()?;

            if let Some(version) = existing {
                return if version.archive_sha256 == new.archive_sha256 {
                    tx.commit()?;
                    Ok(UpsertOutcome {
                        created: false,
                        version,
                    })
                } else {
                    Err(DataStoreError::VersionConflict {
                        package: new.package_name,
                        version: new.version,
                    })
                };
            }

            tx.execute(
                "INSERT INTO package_versions \
                     (package_name, version, pubspec, archive_key, archive_sha256, \
                      upstream_archive_url, published_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.package_name,
                    new.version,
                    serde_json::to_string(&new.pubspec)?,
                    new.archive_key,
                    new.archive_sha256,
                    new.upstream_archive_url,
                    ts(&now)
                ],
            )?;
            tx.execute(
                "UPDATE packages SET updated_at = ?2 WHERE name = ?1",
                params![new.package_name, ts(&now)],
            )?;

            tx.commit()?;
            Ok(UpsertOutcome {
                created: true,
                version: PackageVersion {
                    package_name: new.package_name,
                    version: new.version,
                    pubspec: new.pubspec,
                    archive_key: new.archive_key,
                    archive_sha256: new.archive_sha256,
                    upstream_archive_url: new.upstream_archive_url,
                    published_at: now,
                    is_retracted: false,
                    retracted_at: None,
                    retraction_message: None,
                    download_count: 0,
                },
            })
        })
        .await
    }

    async fn version_exists(&self, name: &str, version: &str) -> Result<bool, DataStoreError> {
        let (name, version) = (name.to_string(), version.to_string());
        self.call(move |conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM package_versions WHERE package_name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn get_package_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PackageVersion>, DataStoreError> {
        let (name, version) = (name.to_string(), version.to_string());
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM package_versions \
                     WHERE package_name = ?1 AND version = ?2"
                ),
                params![name, version],
                version_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn get_package_versions(
        &self,
        name: &str,
    ) -> Result<Vec<PackageVersion>, DataStoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VERSION_COLUMNS} FROM package_versions \
                 WHERE package_name = ?1 ORDER BY published_at, version"
            ))?;
            let versions = stmt
                .query_map(params![name], version_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(versions)
        })
        .await
    }

    async fn list_packages(&self, page: u32, limit: u32) -> Result<PackagePage, DataStoreError> {
        self.call(move |conn| query_packages(conn, "", &[], page, limit))
            .await
    }

    async fn list_packages_by_type(
        &self,
        is_upstream_cache: bool,
        page: u32,
        limit: u32,
    ) -> Result<PackagePage, DataStoreError> {
        self.call(move |conn| {
            query_packages(
                conn,
                "WHERE p.is_upstream_cache = ?1",
                &[&is_upstream_cache],
                page,
                limit,
            )
        })
        .await
    }

    async fn search_packages(
        &self,
        query: &str,
        page: u32,
        limit: u32,
    ) -> Result<PackagePage, DataStoreError> {
        let query = query.to_lowercase();
        self.call(move |conn| {
            query_packages(
                conn,
                "WHERE instr(lower(p.name), ?1) > 0",
                &[&query],
                page,
                limit,
            )
        })
        .await
    }

    async fn delete_package(&self, name: &str) -> Result<u64, DataStoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let versions: u64 = tx.query_row(
                "SELECT COUNT(*) FROM package_versions WHERE package_name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            let removed = tx.execute("DELETE FROM packages WHERE name = ?1", params![name])?;
            if removed == 0 {
                return Err(DataStoreError::PackageNotFound(name));
            }
            tx.commit()?;
            Ok(versions)
        })
        .await
    }

    async fn discontinue_package(
        &self,
        name: &str,
        replaced_by: Option<&str>,
    ) -> Result<(), DataStoreError> {
        let name = name.to_string();
        let replaced_by = replaced_by.map(str::to_string);
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE packages SET is_discontinued = 1, replaced_by = ?2, updated_at = ?3 \
                 WHERE name = ?1",
                params![name, replaced_by, ts(&Utc::now())],
            )?;
            if changed == 0 {
                return Err(DataStoreError::PackageNotFound(name));
            }
            Ok(())
        })
        .await
    }

    async fn retract_version(
        &self,
        name: &str,
        version: &str,
        message: Option<&str>,
    ) -> Result<(), DataStoreError> {
        let (name, version) = (name.to_string(), version.to_string());
        let message = message.map(str::to_string);
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE package_versions \
                 SET is_retracted = 1, retracted_at = ?3, retraction_message = ?4 \
                 WHERE package_name = ?1 AND version = ?2",
                params![name, version, ts(&Utc::now()), message],
            )?;
            if changed == 0 {
                return Err(DataStoreError::VersionNotFound {
                    package: name,
                    version,
                });
            }
            Ok(())
        })
        .await
    }

    async fn unretract_version(&self, name: &str, version: &str) -> Result<(), DataStoreError> {
        let (name, version) = (name.to_string(), version.to_string());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE package_versions \
                 SET is_retracted = 0, retracted_at = NULL, retraction_message = NULL \
                 WHERE package_name = ?1 AND version = ?2",
                params![name, version],
            )?;
            if changed == 0 {
                return Err(DataStoreError::VersionNotFound {
                    package: name,
                    version,
                });
            }
            Ok(())
        })
        .await
    }

    async fn increment_download_counts(
        &self,
        counts: &[(String, String, u64)],
    ) -> Result<(), DataStoreError> {
        let counts = counts.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for (name, version, n) in &counts {
                tx.execute(
                    "UPDATE package_versions SET download_count = download_count + ?3 \
                     WHERE package_name = ?1 AND version = ?2",
                    params![name, version, *n as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_package_denorm(
        &self,
        name: &str,
        latest_version: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), DataStoreError> {
        let name = name.to_string();
        let latest_version = latest_version.map(str::to_string);
        let description = description.map(str::to_string);
        self.call(move |conn| {
            conn.execute(
                "UPDATE packages SET latest_version = ?2, description = ?3 WHERE name = ?1",
                params![name, latest_version, description],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_cached_packages(&self) -> Result<u64, DataStoreError> {
        self.call(|conn| {
            let removed =
                conn.execute("DELETE FROM packages WHERE is_upstream_cache = 1", [])?;
            Ok(removed as u64)
        })
        .await
    }

    async fn all_archive_keys(&self) -> Result<Vec<String>, DataStoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT archive_key FROM package_versions")?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, DataStoreError> {
        self.call(|conn| {
            let count = |sql: &str| -> rusqlite::Result<u64> {
                conn.query_row(sql, [], |row| row.get(0))
            };
            Ok(StoreStats {
                hosted_packages: count(
                    "SELECT COUNT(*) FROM packages WHERE is_upstream_cache = 0",
                )?,
                cached_packages: count(
                    "SELECT COUNT(*) FROM packages WHERE is_upstream_cache = 1",
                )?,
                package_versions: count("SELECT COUNT(*) FROM package_versions")?,
                users: count("SELECT COUNT(*) FROM users")?,
                webhooks: count("SELECT COUNT(*) FROM webhooks")?,
                total_downloads: count(
                    "SELECT COALESCE(SUM(download_count), 0) FROM package_versions",
                )?,
            })
        })
        .await
    }

    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<User, DataStoreError> {
        let (email, password_hash) = (email.to_string(), password_hash.to_string());
        self.call(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO users (email, password_hash, created_at) VALUES (?1, ?2, ?3)",
                params![email, password_hash, ts(&now)],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DataStoreError::UserExists(email.clone())
                } else {
                    e.into()
                }
            })?;
            Ok(User {
                id: conn.last_insert_rowid(),
                email,
                password_hash,
                is_active: true,
                created_at: now,
                last_login_at: None,
            })
        })
        .await
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, DataStoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DataStoreError> {
        let email = email.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                user_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn list_users(
        &self,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<User>, u64), DataStoreError> {
        self.call(move |conn| {
            let total: u64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
            let limit = limit.max(1);
            let offset = (page.max(1) as u64 - 1) * limit as u64;
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT {limit} OFFSET {offset}"
            ))?;
            let users = stmt
                .query_map([], user_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((users, total))
        })
        .await
    }

    async fn delete_user(&self, id: i64) -> Result<bool, DataStoreError> {
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn create_admin_user(
        &self,
        username: &str,
        password_hash: &str,
        must_change_password: bool,
    ) -> Result<AdminUser, DataStoreError> {
        let (username, password_hash) = (username.to_string(), password_hash.to_string());
        self.call(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO admin_users \
                     (username, password_hash, must_change_password, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![username, password_hash, must_change_password, ts(&now)],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DataStoreError::AdminUserExists(username.clone())
                } else {
                    e.into()
                }
            })?;
            Ok(AdminUser {
                id: conn.last_insert_rowid(),
                username,
                password_hash,
                must_change_password,
                login_count: 0,
                created_at: now,
                last_login_at: None,
            })
        })
        .await
    }

    async fn list_admin_users(&self) -> Result<Vec<AdminUser>, DataStoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ADMIN_USER_COLUMNS} FROM admin_users ORDER BY id"
            ))?;
            let users = stmt
                .query_map([], admin_user_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    async fn delete_admin_user(&self, id: i64) -> Result<bool, DataStoreError> {
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM admin_users WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn create_token(
        &self,
        user_id: i64,
        label: &str,
        token_hash: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AuthToken, DataStoreError> {
        let label = label.to_string();
        let token_hash = token_hash.to_string();
        let scopes = scopes.to_vec();
        self.call(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO auth_tokens \
                     (user_id, label, token_hash, scopes, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    label,
                    token_hash,
                    serde_json::to_string(&scopes)?,
                    ts(&now),
                    opt_ts(&expires_at)
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DataStoreError::TokenLabelExists(label.clone())
                } else {
                    e.into()
                }
            })?;
            Ok(AuthToken {
                id: conn.last_insert_rowid(),
                user_id,
                label,
                token_hash,
                scopes,
                created_at: now,
                expires_at,
                last_used_at: None,
            })
        })
        .await
    }

    async fn list_tokens(
        &self,
        user_id: Option<i64>,
    ) -> Result<Vec<AuthToken>, DataStoreError> {
        self.call(move |conn| {
            let tokens = match user_id {
                Some(id) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TOKEN_COLUMNS} FROM auth_tokens WHERE user_id = ?1 ORDER BY id"
                    ))?;
                    let tokens = stmt
                        .query_map(params![id], token_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    tokens
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TOKEN_COLUMNS} FROM auth_tokens ORDER BY id"
                    ))?;
                    let tokens = stmt
                        .query_map([], token_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    tokens
                }
            };
            Ok(tokens)
        })
        .await
    }

    async fn get_token(&self, id: i64) -> Result<Option<AuthToken>, DataStoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM auth_tokens WHERE id = ?1"),
                params![id],
                token_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn get_token_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<AuthToken>, DataStoreError> {
        let hash = hash.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM auth_tokens WHERE token_hash = ?1"),
                params![hash],
                token_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn delete_token(&self, id: i64) -> Result<bool, DataStoreError> {
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM auth_tokens WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn touch_token(&self, hash: &str, at: DateTime<Utc>) -> Result<(), DataStoreError> {
        let hash = hash.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE auth_tokens SET last_used_at = ?2 WHERE token_hash = ?1",
                params![hash, ts(&at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn create_upload_session(
        &self,
        id: &str,
        user_id: Option<i64>,
        expires_at: DateTime<Utc>,
    ) -> Result<UploadSession, DataStoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO upload_sessions (id, user_id, state, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    user_id,
                    SessionState::Open.as_str(),
                    ts(&now),
                    ts(&expires_at)
                ],
            )?;
            Ok(UploadSession {
                id,
                user_id,
                state: SessionState::Open,
                created_at: now,
                expires_at,
            })
        })
        .await
    }

    async fn get_upload_session(
        &self,
        id: &str,
    ) -> Result<Option<UploadSession>, DataStoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, user_id, state, created_at, expires_at \
                 FROM upload_sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn complete_upload_session(&self, id: &str) -> Result<bool, DataStoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE upload_sessions SET state = 'completed' \
                 WHERE id = ?1 AND state = 'open'",
                params![id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn expire_upload_session(&self, id: &str) -> Result<(), DataStoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE upload_sessions SET state = 'expired' WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    async fn cleanup_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DataStoreError> {
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM upload_sessions WHERE expires_at < ?1",
                params![ts(&now)],
            )?;
            Ok(removed as u64)
        })
        .await
    }

    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook, DataStoreError> {
        self.call(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO webhooks (url, events, secret, is_active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.url,
                    serde_json::to_string(&new.events)?,
                    new.secret,
                    new.is_active,
                    ts(&now)
                ],
            )?;
            Ok(Webhook {
                id: conn.last_insert_rowid(),
                url: new.url,
                events: new.events,
                secret: new.secret,
                is_active: new.is_active,
                failure_count: 0,
                created_at: now,
                last_triggered_at: None,
            })
        })
        .await
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<Webhook>, DataStoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?1"),
                params![id],
                webhook_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn list_webhooks(&self, active_only: bool) -> Result<Vec<Webhook>, DataStoreError> {
        self.call(move |conn| {
            let sql = if active_only {
                format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE is_active = 1 ORDER BY id")
            } else {
                format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks ORDER BY id")
            };
            let mut stmt = conn.prepare(&sql)?;
            let webhooks = stmt
                .query_map([], webhook_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(webhooks)
        })
        .await
    }

    async fn delete_webhook(&self, id: i64) -> Result<bool, DataStoreError> {
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM webhooks WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn set_webhook_active(&self, id: i64, active: bool) -> Result<bool, DataStoreError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE webhooks SET is_active = ?2 WHERE id = ?1",
                params![id, active],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn record_webhook_attempt(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<u64, DataStoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = if success {
                tx.execute(
                    "UPDATE webhooks SET failure_count = 0, last_triggered_at = ?2 \
                     WHERE id = ?1",
                    params![id, ts(&at)],
                )?
            } else {
                tx.execute(
                    "UPDATE webhooks \
                     SET failure_count = failure_count + 1, last_triggered_at = ?2 \
                     WHERE id = ?1",
                    params![id, ts(&at)],
                )?
            };
            if changed == 0 {
                return Err(DataStoreError::WebhookNotFound(id));
            }
            let count: u64 = tx.query_row(
                "SELECT failure_count FROM webhooks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(count)
        })
        .await
    }

    async fn insert_webhook_delivery(
        &self,
        delivery: NewWebhookDelivery,
    ) -> Result<(), DataStoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO webhook_deliveries \
                     (webhook_id, event_type, delivered_at, status_code, duration_ms, \
                      error, success) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    delivery.webhook_id,
                    delivery.event_type,
                    ts(&delivery.delivered_at),
                    delivery.status_code.map(|s| s as i64),
                    delivery.duration_ms as i64,
                    delivery.error,
                    delivery.success
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_webhook_deliveries(
        &self,
        webhook_id: i64,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DataStoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, webhook_id, event_type, delivered_at, status_code, duration_ms, \
                        error, success \
                 FROM webhook_deliveries WHERE webhook_id = ?1 \
                 ORDER BY delivered_at DESC, id DESC LIMIT ?2",
            )?;
            let deliveries = stmt
                .query_map(params![webhook_id, limit], delivery_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(deliveries)
        })
        .await
    }

    async fn log_activity(&self, activity: NewActivity) -> Result<(), DataStoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO activity_log \
                     (activity_type, actor_type, actor_id, actor_email, target_type, \
                      target_id, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    activity.activity_type,
                    activity.actor_type.as_str(),
                    activity.actor_id,
                    activity.actor_email,
                    activity.target_type,
                    activity.target_id,
                    serde_json::to_string(&activity.metadata)?,
                    ts(&Utc::now())
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent_activity(
        &self,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Activity>, DataStoreError> {
        self.call(move |conn| {
            let entries = match before {
                Some(before) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {ACTIVITY_COLUMNS} FROM activity_log \
                         WHERE created_at < ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
                    ))?;
                    let entries = stmt
                        .query_map(params![ts(&before), limit], activity_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    entries
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {ACTIVITY_COLUMNS} FROM activity_log \
                         ORDER BY created_at DESC, id DESC LIMIT ?1"
                    ))?;
                    let entries = stmt
                        .query_map(params![limit], activity_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    entries
                }
            };
            Ok(entries)
        })
        .await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, DataStoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT value FROM site_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DataStoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO site_config (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn all_config(&self) -> Result<Vec<(String, String)>, DataStoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM site_config ORDER BY key")?;
            let entries = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn get_storage_config(
        &self,
        slot: &str,
    ) -> Result<Option<serde_json::Value>, DataStoreError> {
        let slot = slot.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT value FROM storage_config WHERE slot = ?1",
                params![slot],
                |row| get_json(row, 0),
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn set_storage_config(
        &self,
        slot: &str,
        value: &serde_json::Value,
    ) -> Result<(), DataStoreError> {
        let slot = slot.to_string();
        let value = serde_json::to_string(value)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO storage_config (slot, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(slot) DO UPDATE \
                     SET value = excluded.value, updated_at = excluded.updated_at",
                params![slot, value, ts(&Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn export_backup(&self) -> Result<BackupData, DataStoreError> {
        self.call(|conn| {
            fn collect<T>(
                conn: &Connection,
                sql: &str,
                f: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
            ) -> Result<Vec<T>, DataStoreError> {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map([], f)?.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            }

            Ok(BackupData {
                packages: collect(
                    conn,
                    &format!("SELECT {PACKAGE_COLUMNS} FROM packages ORDER BY name"),
                    package_from_row,
                )?,
                package_versions: collect(
                    conn,
                    &format!(
                        "SELECT {VERSION_COLUMNS} FROM package_versions \
                         ORDER BY package_name, version"
                    ),
                    version_from_row,
                )?,
                users: collect(
                    conn,
                    &format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"),
                    user_from_row,
                )?,
                admin_users: collect(
                    conn,
                    &format!("SELECT {ADMIN_USER_COLUMNS} FROM admin_users ORDER BY id"),
                    admin_user_from_row,
                )?,
                auth_tokens: collect(
                    conn,
                    &format!("SELECT {TOKEN_COLUMNS} FROM auth_tokens ORDER BY id"),
                    token_from_row,
                )?,
                activity_log: collect(
                    conn,
                    &format!("SELECT {ACTIVITY_COLUMNS} FROM activity_log ORDER BY id"),
                    activity_from_row,
                )?,
            })
        })
        .await
    }

    async fn import_backup(
        &self,
        data: &BackupData,
        dry_run: bool,
    ) -> Result<ImportCounts, DataStoreError> {
        let counts = ImportCounts::of(data);
        if dry_run {
            return Ok(counts);
        }

        let data = data.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            for p in &data.packages {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO packages ({PACKAGE_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                    ),
                    params![
                        p.name,
                        p.description,
                        p.is_discontinued,
                        p.replaced_by,
                        p.is_upstream_cache,
                        p.latest_version,
                        ts(&p.created_at),
                        ts(&p.updated_at)
                    ],
                )?;
            }
            for v in &data.package_versions {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO package_versions ({VERSION_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                    ),
                    params![
                        v.package_name,
                        v.version,
                        serde_json::to_string(&v.pubspec)?,
                        v.archive_key,
                        v.archive_sha256,
                        v.upstream_archive_url,
                        ts(&v.published_at),
                        v.is_retracted,
                        opt_ts(&v.retracted_at),
                        v.retraction_message,
                        v.download_count as i64
                    ],
                )?;
            }
            for u in &data.users {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO users ({USER_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    params![
                        u.id,
                        u.email,
                        u.password_hash,
                        u.is_active,
                        ts(&u.created_at),
                        opt_ts(&u.last_login_at)
                    ],
                )?;
            }
            for a in &data.admin_users {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO admin_users ({ADMIN_USER_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                    ),
                    params![
                        a.id,
                        a.username,
                        a.password_hash,
                        a.must_change_password,
                        a.login_count as i64,
                        ts(&a.created_at),
                        opt_ts(&a.last_login_at)
                    ],
                )?;
            }
            for t in &data.auth_tokens {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO auth_tokens ({TOKEN_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                    ),
                    params![
                        t.id,
                        t.user_id,
                        t.label,
                        t.token_hash,
                        serde_json::to_string(&t.scopes)?,
                        ts(&t.created_at),
                        opt_ts(&t.expires_at),
                        opt_ts(&t.last_used_at)
                    ],
                )?;
            }
            for entry in &data.activity_log {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO activity_log ({ACTIVITY_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                    ),
                    params![
                        entry.id,
                        entry.activity_type,
                        entry.actor_type.as_str(),
                        entry.actor_id,
                        entry.actor_email,
                        entry.target_type,
                        entry.target_id,
                        serde_json::to_string(&entry.metadata)?,
                        ts(&entry.created_at)
                    ],
                )?;
            }

            tx.commit()?;
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteDataStore {
        let store = SqliteDataStore::open_in_memory().unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn new_version(name: &str, version: &str, sha: &str) -> NewPackageVersion {
        NewPackageVersion {
            package_name: name.to_string(),
            version: version.to_string(),
            pubspec: serde_json::json!({"name": name, "version": version}),
            archive_key: format!("hosted-packages/{name}/{version}/{sha}.tar.gz"),
            archive_sha256: sha.to_string(),
            upstream_archive_url: None,
            is_upstream_cache: false,
            description: Some("a package".to_string()),
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = SqliteDataStore::open_in_memory().unwrap();
        assert_eq!(store.migrate().await.unwrap(), MIGRATIONS.len() as u32);
        assert_eq!(store.migrate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_creates_then_noops_then_conflicts() {
        let store = store().await;
        let first = store
            .upsert_package_version(new_version("foo", "1.0.0", &"ab".repeat(32)))
            .await
            .unwrap();
        assert!(first.created);

        // Identical re-publish is a no-op that preserves published_at.
        let again = store
            .upsert_package_version(new_version("foo", "1.0.0", &"ab".repeat(32)))
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.version.published_at, first.version.published_at);

        let conflict = store
            .upsert_package_version(new_version("foo", "1.0.0", &"cd".repeat(32)))
            .await;
        assert!(matches!(
            conflict,
            Err(DataStoreError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn upsert_rejects_namespace_moves() {
        let store = store().await;
        store
            .upsert_package_version(new_version("foo", "1.0.0", &"ab".repeat(32)))
            .await
            .unwrap();

        let mut cached = new_version("foo", "2.0.0", &"cd".repeat(32));
        cached.is_upstream_cache = true;
        let result = store.upsert_package_version(cached).await;
        assert!(matches!(
            result,
            Err(DataStoreError::PackageKindConflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_package_cascades_versions() {
        let store = store().await;
        store
            .upsert_package_version(new_version("foo", "1.0.0", &"ab".repeat(32)))
            .await
            .unwrap();
        store
            .upsert_package_version(new_version("foo", "1.1.0", &"cd".repeat(32)))
            .await
            .unwrap();

        assert_eq!(store.delete_package("foo").await.unwrap(), 2);
        assert!(store.get_package("foo").await.unwrap().is_none());
        assert!(store
            .get_package_version("foo", "1.0.0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn retract_roundtrip_restores_all_fields() {
        let store = store().await;
        store
            .upsert_package_version(new_version("foo", "1.0.0", &"ab".repeat(32)))
            .await
            .unwrap();

        store
            .retract_version("foo", "1.0.0", Some("security"))
            .await
            .unwrap();
        let v = store
            .get_package_version("foo", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        assert!(v.is_retracted);
        assert!(v.retracted_at.is_some());
        assert_eq!(v.retraction_message.as_deref(), Some("security"));

        store.unretract_version("foo", "1.0.0").await.unwrap();
        let v = store
            .get_package_version("foo", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        assert!(!v.is_retracted);
        assert!(v.retracted_at.is_none());
        assert!(v.retraction_message.is_none());
    }

    #[tokio::test]
    async fn pages_do_not_overlap_and_cover_everything() {
        let store = store().await;
        for i in 0..7 {
            store
                .upsert_package_version(new_version(
                    &format!("pkg{i}"),
                    "1.0.0",
                    &format!("{i:02}").repeat(32),
                ))
                .await
                .unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for page in 1..=3 {
            let result = store.list_packages(page, 3).await.unwrap();
            assert_eq!(result.total, 7);
            for p in &result.packages {
                assert!(seen.insert(p.package.name.clone()), "page overlap");
            }
            total += result.packages.len();
        }
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn search_is_case_insensitive_substring() {
        let store = store().await;
        for name in ["http_client", "http_server", "yaml_edit"] {
            store
                .upsert_package_version(new_version(name, "1.0.0", &"ab".repeat(32)))
                .await
                .unwrap();
        }
        let result = store.search_packages("HTTP", 1, 10).await.unwrap();
        assert_eq!(result.total, 2);
        let result = store.search_packages("EDIT", 1, 10).await.unwrap();
        assert_eq!(result.total, 1);
        let result = store.search_packages("nope", 1, 10).await.unwrap();
        assert_eq!(result.total, 0);
    }

    #[tokio::test]
    async fn token_label_is_unique_per_user() {
        let store = store().await;
        let user = store.create_user("a@example.com", "hash").await.unwrap();
        store
            .create_token(user.id, "ci", "h1", &["publish:all".to_string()], None)
            .await
            .unwrap();
        let dup = store
            .create_token(user.id, "ci", "h2", &["publish:all".to_string()], None)
            .await;
        assert!(matches!(dup, Err(DataStoreError::TokenLabelExists(_))));
    }

    #[tokio::test]
    async fn expired_sessions_are_cleaned_up() {
        let store = store().await;
        let past = Utc::now() - chrono::Duration::minutes(20);
        let future = Utc::now() + chrono::Duration::minutes(10);
        store
            .create_upload_session("old", None, past)
            .await
            .unwrap();
        store
            .create_upload_session("new", None, future)
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired_sessions(Utc::now()).await.unwrap(), 1);
        assert!(store.get_upload_session("old").await.unwrap().is_none());
        assert!(store.get_upload_session("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backup_roundtrip_preserves_rows() {
        let store = store().await;
        store
            .upsert_package_version(new_version("foo", "1.0.0", &"ab".repeat(32)))
            .await
            .unwrap();
        let user = store.create_user("a@example.com", "hash").await.unwrap();
        store
            .create_token(user.id, "ci", "h1", &["admin".to_string()], None)
            .await
            .unwrap();

        let data = store.export_backup().await.unwrap();
        assert_eq!(data.packages.len(), 1);
        assert_eq!(data.package_versions.len(), 1);
        assert_eq!(data.users.len(), 1);
        assert_eq!(data.auth_tokens.len(), 1);

        let fresh = SqliteDataStore::open_in_memory().unwrap();
        fresh.migrate().await.unwrap();
        let counts = fresh.import_backup(&data, false).await.unwrap();
        assert_eq!(counts.packages, 1);
        assert_eq!(
            fresh
                .get_package_version("foo", "1.0.0")
                .await
                .unwrap()
                .unwrap()
                .archive_sha256,
            "ab".repeat(32)
        );

        // Dry run writes nothing.
        let empty = SqliteDataStore::open_in_memory().unwrap();
        empty.migrate().await.unwrap();
        empty.import_backup(&data, true).await.unwrap();
        assert!(empty.get_package("foo").await.unwrap().is_none());
    }
}
