//! The network SQL metadata store, backed by PostgreSQL.
//!
//! Behaviourally identical to the embedded backend. Upsert races are resolved
//! with `ON CONFLICT DO NOTHING` plus a re-read instead of a connection-wide
//! lock; migrations serialise on an advisory lock.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use super::sql::split_statements;
use super::{
    Activity, ActorType, AdminUser, AuthToken, DataStore, DataStoreError, HealthStatus,
    Migration, NewActivity, NewPackageVersion, NewWebhook, NewWebhookDelivery, Package,
    PackagePage, PackageVersion, PackageWithStats, SessionState, StoreStats, UploadSession,
    UpsertOutcome, User, Webhook, WebhookDelivery,
};
use crate::backup::{BackupData, ImportCounts};

/// Advisory lock key for the migration critical section.
const MIGRATION_LOCK_KEY: i64 = 0x7265_7075_625f_6d69; // "repub_mi"

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_packages_users",
        sql: r#"
CREATE TABLE packages (
    name TEXT PRIMARY KEY,
    description TEXT,
    is_discontinued BOOLEAN NOT NULL DEFAULT FALSE,
    replaced_by TEXT,
    is_upstream_cache BOOLEAN NOT NULL DEFAULT FALSE,
    latest_version TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE package_versions (
    package_name TEXT NOT NULL REFERENCES packages(name) ON DELETE CASCADE,
    version TEXT NOT NULL,
    pubspec JSONB NOT NULL,
    archive_key TEXT NOT NULL,
    archive_sha256 TEXT NOT NULL,
    upstream_archive_url TEXT,
    published_at TIMESTAMPTZ NOT NULL,
    is_retracted BOOLEAN NOT NULL DEFAULT FALSE,
    retracted_at TIMESTAMPTZ,
    retraction_message TEXT,
    download_count BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (package_name, version)
);

CREATE TABLE users (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL,
    last_login_at TIMESTAMPTZ
);

CREATE TABLE admin_users (
    id BIGSERIAL PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    must_change_password BOOLEAN NOT NULL DEFAULT FALSE,
    login_count BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    last_login_at TIMESTAMPTZ
);

CREATE TABLE auth_tokens (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    label TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    scopes JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ,
    last_used_at TIMESTAMPTZ,
    UNIQUE (user_id, label)
);

CREATE TABLE upload_sessions (
    id TEXT PRIMARY KEY,
    user_id BIGINT,
    state TEXT NOT NULL DEFAULT 'open',
    created_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE site_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE storage_config (
    slot TEXT PRIMARY KEY,
    value JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
"#,
    },
    Migration {
        id: "0002_webhooks_activity",
        sql: r#"
CREATE TABLE webhooks (
    id BIGSERIAL PRIMARY KEY,
    url TEXT NOT NULL,
    events JSONB NOT NULL,
    secret TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    failure_count BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    last_triggered_at TIMESTAMPTZ
);

CREATE TABLE webhook_deliveries (
    id BIGSERIAL PRIMARY KEY,
    webhook_id BIGINT NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    delivered_at TIMESTAMPTZ NOT NULL,
    status_code INTEGER,
    duration_ms BIGINT NOT NULL,
    error TEXT,
    success BOOLEAN NOT NULL
);

CREATE TABLE activity_log (
    id BIGSERIAL PRIMARY KEY,
    activity_type TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    actor_id BIGINT,
    actor_email TEXT,
    target_type TEXT,
    target_id TEXT,
    metadata JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL
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

/// The PostgreSQL metadata store.
pub struct PostgresDataStore {
    pool: Pool,
}

impl PostgresDataStore {
    /// Creates a store connecting to the given database URL.
    pub fn new(url: &str) -> Result<Self, DataStoreError> {
        let config = tokio_postgres::Config::from_str(url)
            .map_err(|e| DataStoreError::Internal(format!("invalid database URL: {e}")))?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|e| DataStoreError::Internal(format!("failed to build pool: {e}")))?;
        Ok(Self { pool })
    }
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn scopes_from_json(value: serde_json::Value) -> Result<Vec<String>, tokio_postgres::Error> {
    // The column is constrained to a JSON array of strings at write time.
    Ok(serde_json::from_value(value).unwrap_or_default())
}

const PACKAGE_COLUMNS: &str = "name, description, is_discontinued, replaced_by, \
     is_upstream_cache, latest_version, created_at, updated_at";

fn package_from_row(row: &Row) -> Result<Package, tokio_postgres::Error> {
    Ok(Package {
        name: row.try_get(0)?,
        description: row.try_get(1)?,
        is_discontinued: row.try_get(2)?,
        replaced_by: row.try_get(3)?,
        is_upstream_cache: row.try_get(4)?,
        latest_version: row.try_get(5)?,
        created_at: row.try_get(6)?,
        updated_at: row.try_get(7)?,
    })
}

const VERSION_COLUMNS: &str = "package_name, version, pubspec, archive_key, archive_sha256, \
     upstream_archive_url, published_at, is_retracted, retracted_at, retraction_message, \
     download_count";

fn version_from_row(row: &Row) -> Result<PackageVersion, tokio_postgres::Error> {
    let download_count: i64 = row.try_get(10)?;
    Ok(PackageVersion {
        package_name: row.try_get(0)?,
        version: row.try_get(1)?,
        pubspec: row.try_get(2)?,
        archive_key: row.try_get(3)?,
        archive_sha256: row.try_get(4)?,
        upstream_archive_url: row.try_get(5)?,
        published_at: row.try_get(6)?,
        is_retracted: row.try_get(7)?,
        retracted_at: row.try_get(8)?,
        retraction_message: row.try_get(9)?,
        download_count: download_count as u64,
    })
}

const USER_COLUMNS: &str = "id, email, password_hash, is_active, created_at, last_login_at";

fn user_from_row(row: &Row) -> Result<User, tokio_postgres::Error> {
    Ok(User {
        id: row.try_get(0)?,
        email: row.try_get(1)?,
        password_hash: row.try_get(2)?,
        is_active: row.try_get(3)?,
        created_at: row.try_get(4)?,
        last_login_at: row.try_get(5)?,
    })
}

const ADMIN_USER_COLUMNS: &str =
    "id, username, password_hash, must_change_password, login_count, created_at, last_login_at";

fn admin_user_from_row(row: &Row) -> Result<AdminUser, tokio_postgres::Error> {
    let login_count: i64 = row.try_get(4)?;
    Ok(AdminUser {
        id: row.try_get(0)?,
        username: row.try_get(1)?,
        password_hash: row.try_get(2)?,
        must_change_password: row.try_get(3)?,
        login_count: login_count as u64,
        created_at: row.try_get(5)?,
        last_login_at: row.try_get(6)?,
    })
}

const TOKEN_COLUMNS: &str =
    "id, user_id, label, token_hash, scopes, created_at, expires_at, last_used_at";

fn token_from_row(row: &Row) -> Result<AuthToken, tokio_postgres::Error> {
    Ok(AuthToken {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        label: row.try_get(2)?,
        token_hash: row.try_get(3)?,
        scopes: scopes_from_json(row.try_get(4)?)?,
        created_at: row.try_get(5)?,
        expires_at: row.try_get(6)?,
        last_used_at: row.try_get(7)?,
    })
}

fn session_from_row(row: &Row) -> Result<UploadSession, DataStoreError> {
    let state: String = row.try_get(2)?;
    Ok(UploadSession {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        state: SessionState::parse(&state)
            .ok_or_else(|| DataStoreError::Internal(format!("unknown session state `{state}`")))?,
        created_at: row.try_get(3)?,
        expires_at: row.try_get(4)?,
    })
}

const WEBHOOK_COLUMNS: &str =
    "id, url, events, secret, is_active, failure_count, created_at, last_triggered_at";

fn webhook_from_row(row: &Row) -> Result<Webhook, tokio_postgres::Error> {
    let failure_count: i64 = row.try_get(5)?;
    Ok(Webhook {
        id: row.try_get(0)?,
        url: row.try_get(1)?,
        events: scopes_from_json(row.try_get(2)?)?,
        secret: row.try_get(3)?,
        is_active: row.try_get(4)?,
        failure_count: failure_count as u64,
        created_at: row.try_get(6)?,
        last_triggered_at: row.try_get(7)?,
    })
}

const DELIVERY_COLUMNS: &str =
    "id, webhook_id, event_type, delivered_at, status_code, duration_ms, error, success";

fn delivery_from_row(row: &Row) -> Result<WebhookDelivery, tokio_postgres::Error> {
    let status: Option<i32> = row.try_get(4)?;
    let duration: i64 = row.try_get(5)?;
    Ok(WebhookDelivery {
        id: row.try_get(0)?,
        webhook_id: row.try_get(1)?,
        event_type: row.try_get(2)?,
        delivered_at: row.try_get(3)?,
        status_code: status.map(|s| s as u16),
        duration_ms: duration as u64,
        error: row.try_get(6)?,
        success: row.try_get(7)?,
    })
}

const ACTIVITY_COLUMNS: &str = "id, activity_type, actor_type, actor_id, actor_email, \
     target_type, target_id, metadata, created_at";

fn activity_from_row(row: &Row) -> Result<Activity, DataStoreError> {
    let actor: String = row.try_get(2)?;
    Ok(Activity {
        id: row.try_get(0)?,
        activity_type: row.try_get(1)?,
        actor_type: ActorType::parse(&actor)
            .ok_or_else(|| DataStoreError::Internal(format!("unknown actor type `{actor}`")))?,
        actor_id: row.try_get(3)?,
        actor_email: row.try_get(4)?,
        target_type: row.try_get(5)?,
        target_id: row.try_get(6)?,
        metadata: row.try_get(7)?,
        created_at: row.try_get(8)?,
    })
}

impl PostgresDataStore {
    async fn query_packages(
        &self,
        where_clause: &str,
        filter_params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        page: u32,
        limit: u32,
    ) -> Result<PackagePage, DataStoreError> {
        let client = self.pool.get().await?;

        let total: i64 = client
            .query_one(
                format!("SELECT COUNT(*) FROM packages p {where_clause}").as_str(),
                filter_params,
            )
            .await?
            .try_get(0)?;

        let limit = limit.max(1);
        let offset = (page.max(1) as u64 - 1) * limit as u64;
        let prefixed = PACKAGE_COLUMNS
            .split(", ")
            .map(|c| format!("p.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = client
            .query(
                format!(
                    "SELECT {prefixed}, \
                         (SELECT COUNT(*) FROM package_versions v \
                            WHERE v.package_name = p.name), \
                         (SELECT COALESCE(SUM(v.download_count), 0) \
                            FROM package_versions v WHERE v.package_name = p.name) \
                     FROM packages p {where_clause} \
                     ORDER BY p.name LIMIT {limit} OFFSET {offset}"
                ).as_str(),
                filter_params,
            )
            .await?;

        let mut packages = Vec::with_capacity(rows.len());
        for row in rows {
            let version_count: i64 = row.try_get(8)?;
            let download_count: i64 = row.try_get(9)?;
            packages.push(PackageWithStats {
                package: package_from_row(&row)?,
                version_count: version_count as u64,
                download_count: download_count as u64,
            });
        }

        Ok(PackagePage {
            packages,
            total: total as u64,
        })
    }
}

#[axum::async_trait]
impl DataStore for PostgresDataStore {
    async fn migrate(&self) -> Result<u32, DataStoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])
            .await?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                 id TEXT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL)",
            &[],
        )
        .await?;

        let applied: HashSet<String> = tx
            .query("SELECT id FROM schema_migrations", &[])
            .await?
            .into_iter()
            .map(|row| row.try_get(0))
            .collect::<Result<_, _>>()?;

        let mut count = 0;
        for migration in MIGRATIONS {
            if applied.contains(migration.id) {
                continue;
            }
            for statement in split_statements(migration.sql) {
                tx.execute(&statement, &[]).await?;
            }
            tx.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES ($1, $2)",
                &[&migration.id, &Utc::now()],
            )
            .await?;
            count += 1;
        }

        tx.commit().await?;
        Ok(count)
    }

    async fn health(&self) -> HealthStatus {
        let status = match self.pool.get().await {
            Ok(client) => match client.query_one("SELECT 1", &[]).await {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };
        HealthStatus {
            status,
            db_type: "sql",
        }
    }

    async fn get_package(&self, name: &str) -> Result<Option<Package>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE name = $1").as_str(),
                &[&name],
            )
            .await?;
        Ok(row.map(|r| package_from_row(&r)).transpose()?)
    }

    async fn upsert_package_version(
        &self,
        new: NewPackageVersion,
    ) -> Result<UpsertOutcome, DataStoreError> {
        let mut client = self.pool.get().await?;
        let now = Utc::now();
        let tx = client.transaction().await?;

        tx.execute(
            "INSERT INTO packages \
                 (name, description, is_upstream_cache, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) \
             ON CONFLICT (name) DO NOTHING",
            &[
                &new.package_name,
                &new.description,
                &new.is_upstream_cache,
                &now,
            ],
        )
        .await?;

        let kind: bool = tx
            .query_one(
                "SELECT is_upstream_cache FROM packages WHERE name = $1",
                &[&new.package_name],
            )
            .await?
            .try_get(0)?;
        if kind != new.is_upstream_cache {
            return Err(DataStoreError::PackageKindConflict(new.package_name));
        }

        let inserted = tx
            .execute(
                "INSERT INTO package_versions \
                     (package_name, version, pubspec, archive_key, archive_sha256, \
                      upstream_archive_url, published_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (package_name, version) DO NOTHING",
                &[
                    &new.package_name,
                    &new.version,
                    &new.pubspec,
                    &new.archive_key,
                    &new.archive_sha256,
                    &new.upstream_archive_url,
                    &now,
                ],
            )
            .await?;

        if inserted == 0 {
            let existing = tx
                .query_one(
                    format!(
                        "SELECT {VERSION_COLUMNS} FROM package_versions \
                         WHERE package_name = $1 AND version = $2"
                    ).as_str(),
                    &[&new.package_name, &new.version],
                )
                .await?;
            let existing = version_from_row(&existing)?;
            return if existing.archive_sha256 == new.archive_sha256 {
                tx.commit().await?;
                Ok(UpsertOutcome {
                    created: false,
                    version: existing,
                })
            } else {
                Err(DataStoreError::VersionConflict {
                    package: new.package_name,
                    version: new.version,
                })
            };
        }

        tx.execute(
            "UPDATE packages SET updated_at = $2 WHERE name = $1",
            &[&new.package_name, &now],
        )
        .await?;
        tx.commit().await?;

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
    }

    async fn version_exists(&self, name: &str, version: &str) -> Result<bool, DataStoreError> {
        let client = self.pool.get().await?;
        let count: i64 = client
            .query_one(
                "SELECT COUNT(*) FROM package_versions \
                 WHERE package_name = $1 AND version = $2",
                &[&name, &version],
            )
            .await?
            .try_get(0)?;
        Ok(count > 0)
    }

    async fn get_package_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PackageVersion>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!(
                    "SELECT {VERSION_COLUMNS} FROM package_versions \
                     WHERE package_name = $1 AND version = $2"
                ).as_str(),
                &[&name, &version],
            )
            .await?;
        Ok(row.map(|r| version_from_row(&r)).transpose()?)
    }

    async fn get_package_versions(
        &self,
        name: &str,
    ) -> Result<Vec<PackageVersion>, DataStoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {VERSION_COLUMNS} FROM package_versions \
                     WHERE package_name = $1 ORDER BY published_at, version"
                ).as_str(),
                &[&name],
            )
            .await?;
        rows.iter()
            .map(|r| version_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn list_packages(&self, page: u32, limit: u32) -> Result<PackagePage, DataStoreError> {
        self.query_packages("", &[], page, limit).await
    }

    async fn list_packages_by_type(
        &self,
        is_upstream_cache: bool,
        page: u32,
        limit: u32,
    ) -> Result<PackagePage, DataStoreError> {
        self.query_packages(
            "WHERE p.is_upstream_cache = $1",
            &[&is_upstream_cache],
            page,
            limit,
        )
        .await
    }

    async fn search_packages(
        &self,
        query: &str,
        page: u32,
        limit: u32,
    ) -> Result<PackagePage, DataStoreError> {
        let query = query.to_lowercase();
        self.query_packages(
            "WHERE POSITION($1 IN lower(p.name)) > 0",
            &[&query],
            page,
            limit,
        )
        .await
    }

    async fn delete_package(&self, name: &str) -> Result<u64, DataStoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let versions: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM package_versions WHERE package_name = $1",
                &[&name],
            )
            .await?
            .try_get(0)?;
        let removed = tx
            .execute("DELETE FROM packages WHERE name = $1", &[&name])
            .await?;
        if removed == 0 {
            return Err(DataStoreError::PackageNotFound(name.to_string()));
        }
        tx.commit().await?;
        Ok(versions as u64)
    }

    async fn discontinue_package(
        &self,
        name: &str,
        replaced_by: Option<&str>,
    ) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE packages SET is_discontinued = TRUE, replaced_by = $2, updated_at = $3 \
                 WHERE name = $1",
                &[&name, &replaced_by, &Utc::now()],
            )
            .await?;
        if changed == 0 {
            return Err(DataStoreError::PackageNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn retract_version(
        &self,
        name: &str,
        version: &str,
        message: Option<&str>,
    ) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE package_versions \
                 SET is_retracted = TRUE, retracted_at = $3, retraction_message = $4 \
                 WHERE package_name = $1 AND version = $2",
                &[&name, &version, &Utc::now(), &message],
            )
            .await?;
        if changed == 0 {
            return Err(DataStoreError::VersionNotFound {
                package: name.to_string(),
                version: version.to_string(),
            });
        }
        Ok(())
    }

    async fn unretract_version(&self, name: &str, version: &str) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE package_versions \
                 SET is_retracted = FALSE, retracted_at = NULL, retraction_message = NULL \
                 WHERE package_name = $1 AND version = $2",
                &[&name, &version],
            )
            .await?;
        if changed == 0 {
            return Err(DataStoreError::VersionNotFound {
                package: name.to_string(),
                version: version.to_string(),
            });
        }
        Ok(())
    }

    async fn increment_download_counts(
        &self,
        counts: &[(String, String, u64)],
    ) -> Result<(), DataStoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        for (name, version, n) in counts {
            tx.execute(
                "UPDATE package_versions SET download_count = download_count + $3 \
                 WHERE package_name = $1 AND version = $2",
                &[name, version, &(*n as i64)],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_package_denorm(
        &self,
        name: &str,
        latest_version: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE packages SET latest_version = $2, description = $3 WHERE name = $1",
                &[&name, &latest_version, &description],
            )
            .await?;
        Ok(())
    }

    async fn clear_cached_packages(&self) -> Result<u64, DataStoreError> {
        let client = self.pool.get().await?;
        let removed = client
            .execute("DELETE FROM packages WHERE is_upstream_cache = TRUE", &[])
            .await?;
        Ok(removed)
    }

    async fn all_archive_keys(&self) -> Result<Vec<String>, DataStoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT archive_key FROM package_versions", &[])
            .await?;
        rows.iter()
            .map(|r| r.try_get(0).map_err(Into::into))
            .collect()
    }

    async fn stats(&self) -> Result<StoreStats, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT \
                     (SELECT COUNT(*) FROM packages WHERE NOT is_upstream_cache), \
                     (SELECT COUNT(*) FROM packages WHERE is_upstream_cache), \
                     (SELECT COUNT(*) FROM package_versions), \
                     (SELECT COUNT(*) FROM users), \
                     (SELECT COUNT(*) FROM webhooks), \
                     (SELECT COALESCE(SUM(download_count), 0) FROM package_versions)",
                &[],
            )
            .await?;
        let get = |idx: usize| -> Result<u64, tokio_postgres::Error> {
            row.try_get::<_, i64>(idx).map(|v| v as u64)
        };
        Ok(StoreStats {
            hosted_packages: get(0)?,
            cached_packages: get(1)?,
            package_versions: get(2)?,
            users: get(3)?,
            webhooks: get(4)?,
            total_downloads: get(5)?,
        })
    }

    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<User, DataStoreError> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        let row = client
            .query_one(
                "INSERT INTO users (email, password_hash, created_at) \
                 VALUES ($1, $2, $3) RETURNING id",
                &[&email, &password_hash, &now],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DataStoreError::UserExists(email.to_string())
                } else {
                    e.into()
                }
            })?;
        Ok(User {
            id: row.try_get(0)?,
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            is_active: true,
            created_at: now,
            last_login_at: None,
        })
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1").as_str(),
                &[&id],
            )
            .await?;
        Ok(row.map(|r| user_from_row(&r)).transpose()?)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1").as_str(),
                &[&email],
            )
            .await?;
        Ok(row.map(|r| user_from_row(&r)).transpose()?)
    }

    async fn list_users(
        &self,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<User>, u64), DataStoreError> {
        let client = self.pool.get().await?;
        let total: i64 = client
            .query_one("SELECT COUNT(*) FROM users", &[])
            .await?
            .try_get(0)?;
        let limit = limit.max(1);
        let offset = (page.max(1) as u64 - 1) * limit as u64;
        let rows = client
            .query(
                format!(
                    "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT {limit} OFFSET {offset}"
                ).as_str(),
                &[],
            )
            .await?;
        let users = rows
            .iter()
            .map(user_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((users, total as u64))
    }

    async fn delete_user(&self, id: i64) -> Result<bool, DataStoreError> {
        let client = self.pool.get().await?;
        let removed = client
            .execute("DELETE FROM users WHERE id = $1", &[&id])
            .await?;
        Ok(removed > 0)
    }

    async fn create_admin_user(
        &self,
        username: &str,
        password_hash: &str,
        must_change_password: bool,
    ) -> Result<AdminUser, DataStoreError> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        let row = client
            .query_one(
                "INSERT INTO admin_users \
                     (username, password_hash, must_change_password, created_at) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
                &[&username, &password_hash, &must_change_password, &now],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DataStoreError::AdminUserExists(username.to_string())
                } else {
                    e.into()
                }
            })?;
        Ok(AdminUser {
            id: row.try_get(0)?,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            must_change_password,
            login_count: 0,
            created_at: now,
            last_login_at: None,
        })
    }

    async fn list_admin_users(&self) -> Result<Vec<AdminUser>, DataStoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!("SELECT {ADMIN_USER_COLUMNS} FROM admin_users ORDER BY id").as_str(),
                &[],
            )
            .await?;
        rows.iter()
            .map(|r| admin_user_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn delete_admin_user(&self, id: i64) -> Result<bool, DataStoreError> {
        let client = self.pool.get().await?;
        let removed = client
            .execute("DELETE FROM admin_users WHERE id = $1", &[&id])
            .await?;
        Ok(removed > 0)
    }

    async fn create_token(
        &self,
        user_id: i64,
        label: &str,
        token_hash: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AuthToken, DataStoreError> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        let scopes_json = serde_json::to_value(scopes)?;
        let row = client
            .query_one(
                "INSERT INTO auth_tokens \
                     (user_id, label, token_hash, scopes, created_at, expires_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[&user_id, &label, &token_hash, &scopes_json, &now, &expires_at],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DataStoreError::TokenLabelExists(label.to_string())
                } else {
                    e.into()
                }
            })?;
        Ok(AuthToken {
            id: row.try_get(0)?,
            user_id,
            label: label.to_string(),
            token_hash: token_hash.to_string(),
            scopes: scopes.to_vec(),
            created_at: now,
            expires_at,
            last_used_at: None,
        })
    }

    async fn list_tokens(
        &self,
        user_id: Option<i64>,
    ) -> Result<Vec<AuthToken>, DataStoreError> {
        let client = self.pool.get().await?;
        let rows = match user_id {
            Some(id) => {
                client
                    .query(
                        format!(
                            "SELECT {TOKEN_COLUMNS} FROM auth_tokens \
                             WHERE user_id = $1 ORDER BY id"
                        ).as_str(),
                        &[&id],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        format!("SELECT {TOKEN_COLUMNS} FROM auth_tokens ORDER BY id").as_str(),
                        &[],
                    )
                    .await?
            }
        };
        rows.iter()
            .map(|r| token_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn get_token(&self, id: i64) -> Result<Option<AuthToken>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {TOKEN_COLUMNS} FROM auth_tokens WHERE id = $1").as_str(),
                &[&id],
            )
            .await?;
        Ok(row.map(|r| token_from_row(&r)).transpose()?)
    }

    async fn get_token_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<AuthToken>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {TOKEN_COLUMNS} FROM auth_tokens WHERE token_hash = $1").as_str(),
                &[&hash],
            )
            .await?;
        Ok(row.map(|r| token_from_row(&r)).transpose()?)
    }

    async fn delete_token(&self, id: i64) -> Result<bool, DataStoreError> {
        let client = self.pool.get().await?;
        let removed = client
            .execute("DELETE FROM auth_tokens WHERE id = $1", &[&id])
            .await?;
        Ok(removed > 0)
    }

    async fn touch_token(&self, hash: &str, at: DateTime<Utc>) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE auth_tokens SET last_used_at = $2 WHERE token_hash = $1",
                &[&hash, &at],
            )
            .await?;
        Ok(())
    }

    async fn create_upload_session(
        &self,
        id: &str,
        user_id: Option<i64>,
        expires_at: DateTime<Utc>,
    ) -> Result<UploadSession, DataStoreError> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        client
            .execute(
                "INSERT INTO upload_sessions (id, user_id, state, created_at, expires_at) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[&id, &user_id, &SessionState::Open.as_str(), &now, &expires_at],
            )
            .await?;
        Ok(UploadSession {
            id: id.to_string(),
            user_id,
            state: SessionState::Open,
            created_at: now,
            expires_at,
        })
    }

    async fn get_upload_session(
        &self,
        id: &str,
    ) -> Result<Option<UploadSession>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, user_id, state, created_at, expires_at \
                 FROM upload_sessions WHERE id = $1",
                &[&id],
            )
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn complete_upload_session(&self, id: &str) -> Result<bool, DataStoreError> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE upload_sessions SET state = 'completed' \
                 WHERE id = $1 AND state = 'open'",
                &[&id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn expire_upload_session(&self, id: &str) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE upload_sessions SET state = 'expired' WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(())
    }

    async fn cleanup_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DataStoreError> {
        let client = self.pool.get().await?;
        let removed = client
            .execute("DELETE FROM upload_sessions WHERE expires_at < $1", &[&now])
            .await?;
        Ok(removed)
    }

    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook, DataStoreError> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        let events_json = serde_json::to_value(&new.events)?;
        let row = client
            .query_one(
                "INSERT INTO webhooks (url, events, secret, is_active, created_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[&new.url, &events_json, &new.secret, &new.is_active, &now],
            )
            .await?;
        Ok(Webhook {
            id: row.try_get(0)?,
            url: new.url,
            events: new.events,
            secret: new.secret,
            is_active: new.is_active,
            failure_count: 0,
            created_at: now,
            last_triggered_at: None,
        })
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<Webhook>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1").as_str(),
                &[&id],
            )
            .await?;
        Ok(row.map(|r| webhook_from_row(&r)).transpose()?)
    }

    async fn list_webhooks(&self, active_only: bool) -> Result<Vec<Webhook>, DataStoreError> {
        let client = self.pool.get().await?;
        let sql = if active_only {
            format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE is_active ORDER BY id")
        } else {
            format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks ORDER BY id")
        };
        let rows = client.query(&sql, &[]).await?;
        rows.iter()
            .map(|r| webhook_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn delete_webhook(&self, id: i64) -> Result<bool, DataStoreError> {
        let client = self.pool.get().await?;
        let removed = client
            .execute("DELETE FROM webhooks WHERE id = $1", &[&id])
            .await?;
        Ok(removed > 0)
    }

    async fn set_webhook_active(&self, id: i64, active: bool) -> Result<bool, DataStoreError> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE webhooks SET is_active = $2 WHERE id = $1",
                &[&id, &active],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn record_webhook_attempt(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<u64, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE webhooks \
                 SET failure_count = CASE WHEN $2 THEN 0 ELSE failure_count + 1 END, \
                     last_triggered_at = $3 \
                 WHERE id = $1 RETURNING failure_count",
                &[&id, &success, &at],
            )
            .await?
            .ok_or(DataStoreError::WebhookNotFound(id))?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    async fn insert_webhook_delivery(
        &self,
        delivery: NewWebhookDelivery,
    ) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO webhook_deliveries \
                     (webhook_id, event_type, delivered_at, status_code, duration_ms, \
                      error, success) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &delivery.webhook_id,
                    &delivery.event_type,
                    &delivery.delivered_at,
                    &delivery.status_code.map(|s| s as i32),
                    &(delivery.duration_ms as i64),
                    &delivery.error,
                    &delivery.success,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_webhook_deliveries(
        &self,
        webhook_id: i64,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DataStoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
                     WHERE webhook_id = $1 \
                     ORDER BY delivered_at DESC, id DESC LIMIT {}",
                    limit.max(1)
                ).as_str(),
                &[&webhook_id],
            )
            .await?;
        rows.iter()
            .map(|r| delivery_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn log_activity(&self, activity: NewActivity) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO activity_log \
                     (activity_type, actor_type, actor_id, actor_email, target_type, \
                      target_id, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &activity.activity_type,
                    &activity.actor_type.as_str(),
                    &activity.actor_id,
                    &activity.actor_email,
                    &activity.target_type,
                    &activity.target_id,
                    &activity.metadata,
                    &Utc::now(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn recent_activity(
        &self,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Activity>, DataStoreError> {
        let client = self.pool.get().await?;
        let limit = limit.max(1);
        let rows = match before {
            Some(before) => {
                client
                    .query(
                        format!(
                            "SELECT {ACTIVITY_COLUMNS} FROM activity_log \
                             WHERE created_at < $1 \
                             ORDER BY created_at DESC, id DESC LIMIT {limit}"
                        ).as_str(),
                        &[&before],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        format!(
                            "SELECT {ACTIVITY_COLUMNS} FROM activity_log \
                             ORDER BY created_at DESC, id DESC LIMIT {limit}"
                        ).as_str(),
                        &[],
                    )
                    .await?
            }
        };
        rows.iter().map(activity_from_row).collect()
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT value FROM site_config WHERE key = $1", &[&key])
            .await?;
        Ok(row.map(|r| r.try_get(0)).transpose()?)
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO site_config (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                &[&key, &value],
            )
            .await?;
        Ok(())
    }

    async fn all_config(&self) -> Result<Vec<(String, String)>, DataStoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT key, value FROM site_config ORDER BY key", &[])
            .await?;
        rows.iter()
            .map(|r| Ok((r.try_get(0)?, r.try_get(1)?)))
            .collect()
    }

    async fn get_storage_config(
        &self,
        slot: &str,
    ) -> Result<Option<serde_json::Value>, DataStoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT value FROM storage_config WHERE slot = $1", &[&slot])
            .await?;
        Ok(row.map(|r| r.try_get(0)).transpose()?)
    }

    async fn set_storage_config(
        &self,
        slot: &str,
        value: &serde_json::Value,
    ) -> Result<(), DataStoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO storage_config (slot, value, updated_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (slot) DO UPDATE \
                     SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
                &[&slot, &value, &Utc::now()],
            )
            .await?;
        Ok(())
    }

    async fn export_backup(&self) -> Result<BackupData, DataStoreError> {
        let client = self.pool.get().await?;

        let packages = client
            .query(
                format!("SELECT {PACKAGE_COLUMNS} FROM packages ORDER BY name").as_str(),
                &[],
            )
            .await?
            .iter()
            .map(package_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let package_versions = client
            .query(
                format!(
                    "SELECT {VERSION_COLUMNS} FROM package_versions \
                     ORDER BY package_name, version"
                ).as_str(),
                &[],
            )
            .await?
            .iter()
            .map(version_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let users = client
            .query(format!("SELECT {USER_COLUMNS} FROM users ORDER BY id").as_str(), &[])
            .await?
            .iter()
            .map(user_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let admin_users = client
            .query(
                format!("SELECT {ADMIN_USER_COLUMNS} FROM admin_users ORDER BY id").as_str(),
                &[],
            )
            .await?
            .iter()
            .map(admin_user_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let auth_tokens = client
            .query(
                format!("SELECT {TOKEN_COLUMNS} FROM auth_tokens ORDER BY id").as_str(),
                &[],
            )
            .await?
            .iter()
            .map(token_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let activity_log = client
            .query(
                format!("SELECT {ACTIVITY_COLUMNS} FROM activity_log ORDER BY id").as_str(),
                &[],
            )
            .await?
            .iter()
            .map(activity_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BackupData {
            packages,
            package_versions,
            users,
            admin_users,
            auth_tokens,
            activity_log,
        })
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

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        for p in &data.packages {
            tx.execute(
                format!(
                    "INSERT INTO packages ({PACKAGE_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (name) DO UPDATE SET \
                         description = EXCLUDED.description, \
                         is_discontinued = EXCLUDED.is_discontinued, \
                         replaced_by = EXCLUDED.replaced_by, \
                         is_upstream_cache = EXCLUDED.is_upstream_cache, \
                         latest_version = EXCLUDED.latest_version, \
                         created_at = EXCLUDED.created_at, \
                         updated_at = EXCLUDED.updated_at"
                ).as_str(),
                &[
                    &p.name,
                    &p.description,
                    &p.is_discontinued,
                    &p.replaced_by,
                    &p.is_upstream_cache,
                    &p.latest_version,
                    &p.created_at,
                    &p.updated_at,
                ],
            )
            .await?;
        }
        for v in &data.package_versions {
            tx.execute(
                format!(
                    "INSERT INTO package_versions ({VERSION_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                     ON CONFLICT (package_name, version) DO UPDATE SET \
                         pubspec = EXCLUDED.pubspec, \
                         archive_key = EXCLUDED.archive_key, \
                         archive_sha256 = EXCLUDED.archive_sha256, \
                         upstream_archive_url = EXCLUDED.upstream_archive_url, \
                         published_at = EXCLUDED.published_at, \
                         is_retracted = EXCLUDED.is_retracted, \
                         retracted_at = EXCLUDED.retracted_at, \
                         retraction_message = EXCLUDED.retraction_message, \
                         download_count = EXCLUDED.download_count"
                ).as_str(),
                &[
                    &v.package_name,
                    &v.version,
                    &v.pubspec,
                    &v.archive_key,
                    &v.archive_sha256,
                    &v.upstream_archive_url,
                    &v.published_at,
                    &v.is_retracted,
                    &v.retracted_at,
                    &v.retraction_message,
                    &(v.download_count as i64),
                ],
            )
            .await?;
        }
        for u in &data.users {
            tx.execute(
                format!(
                    "INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
                     ON CONFLICT (id) DO UPDATE SET \
                         email = EXCLUDED.email, \
                         password_hash = EXCLUDED.password_hash, \
                         is_active = EXCLUDED.is_active, \
                         created_at = EXCLUDED.created_at, \
                         last_login_at = EXCLUDED.last_login_at"
                ).as_str(),
                &[
                    &u.id,
                    &u.email,
                    &u.password_hash,
                    &u.is_active,
                    &u.created_at,
                    &u.last_login_at,
                ],
            )
            .await?;
        }
        for a in &data.admin_users {
            tx.execute(
                format!(
                    "INSERT INTO admin_users ({ADMIN_USER_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (id) DO UPDATE SET \
                         username = EXCLUDED.username, \
                         password_hash = EXCLUDED.password_hash, \
                         must_change_password = EXCLUDED.must_change_password, \
                         login_count = EXCLUDED.login_count, \
                         created_at = EXCLUDED.created_at, \
                         last_login_at = EXCLUDED.last_login_at"
                ).as_str(),
                &[
                    &a.id,
                    &a.username,
                    &a.password_hash,
                    &a.must_change_password,
                    &(a.login_count as i64),
                    &a.created_at,
                    &a.last_login_at,
                ],
            )
            .await?;
        }
        for t in &data.auth_tokens {
            let scopes_json = serde_json::to_value(&t.scopes)?;
            tx.execute(
                format!(
                    "INSERT INTO auth_tokens ({TOKEN_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (id) DO UPDATE SET \
                         user_id = EXCLUDED.user_id, \
                         label = EXCLUDED.label, \
                         token_hash = EXCLUDED.token_hash, \
                         scopes = EXCLUDED.scopes, \
                         created_at = EXCLUDED.created_at, \
                         expires_at = EXCLUDED.expires_at, \
                         last_used_at = EXCLUDED.last_used_at"
                ).as_str(),
                &[
                    &t.id,
                    &t.user_id,
                    &t.label,
                    &t.token_hash,
                    &scopes_json,
                    &t.created_at,
                    &t.expires_at,
                    &t.last_used_at,
                ],
            )
            .await?;
        }
        for entry in &data.activity_log {
            tx.execute(
                format!(
                    "INSERT INTO activity_log ({ACTIVITY_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT (id) DO NOTHING"
                ).as_str(),
                &[
                    &entry.id,
                    &entry.activity_type,
                    &entry.actor_type.as_str(),
                    &entry.actor_id,
                    &entry.actor_email,
                    &entry.target_type,
                    &entry.target_id,
                    &entry.metadata,
                    &entry.created_at,
                ],
            )
            .await?;
        }

        // Imported rows carry explicit ids; move the sequences past them.
        for table in ["users", "admin_users", "auth_tokens", "activity_log"] {
            tx.execute(
                format!(
                    "SELECT setval(pg_get_serial_sequence('{table}', 'id'), \
                         COALESCE((SELECT MAX(id) FROM {table}), 0) + 1, false)"
                ).as_str(),
                &[],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(counts)
    }
}
