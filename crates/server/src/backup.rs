//! Export and import of the metadata store.
//!
//! A backup is one JSON document covering every persistent table. Blobs are
//! not included; replicating them is the operator's job (filesystem copy or
//! bucket replication).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datastore::{
    Activity, AdminUser, AuthToken, DataStore, DataStoreError, Package, PackageVersion, User,
};

/// The newest document format this build can write or read.
pub const FORMAT_VERSION: u32 = 1;

/// The backup document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// `embedded` or `sql`.
    pub database_type: String,
    pub data: BackupData,
}

/// The exported rows, one list per table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    pub packages: Vec<Package>,
    pub package_versions: Vec<PackageVersion>,
    pub users: Vec<User>,
    pub admin_users: Vec<AdminUser>,
    pub auth_tokens: Vec<AuthToken>,
    pub activity_log: Vec<Activity>,
}

/// Row counts reported by an import (dry-run or real).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImportCounts {
    pub packages: u64,
    pub package_versions: u64,
    pub users: u64,
    pub admin_users: u64,
    pub auth_tokens: u64,
    pub activity_log: u64,
}

impl ImportCounts {
    pub fn of(data: &BackupData) -> Self {
        Self {
            packages: data.packages.len() as u64,
            package_versions: data.package_versions.len() as u64,
            users: data.users.len() as u64,
            admin_users: data.admin_users.len() as u64,
            auth_tokens: data.auth_tokens.len() as u64,
            activity_log: data.activity_log.len() as u64,
        }
    }
}

/// Exports the full store into a document.
pub async fn export(store: &dyn DataStore) -> Result<BackupDocument, DataStoreError> {
    let data = store.export_backup().await?;
    Ok(BackupDocument {
        format_version: FORMAT_VERSION,
        created_at: Utc::now(),
        database_type: store.health().await.db_type.to_string(),
        data,
    })
}

/// Imports a document; refuses formats newer than this build understands.
pub async fn import(
    store: &dyn DataStore,
    document: &BackupDocument,
    dry_run: bool,
) -> Result<ImportCounts, DataStoreError> {
    if document.format_version > FORMAT_VERSION {
        return Err(DataStoreError::UnsupportedBackupVersion(
            document.format_version,
        ));
    }
    store.import_backup(&document.data, dry_run).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SqliteDataStore;

    #[tokio::test]
    async fn document_uses_the_wire_format() {
        let store = SqliteDataStore::open_in_memory().unwrap();
        store.migrate().await.unwrap();
        store.create_user("a@example.com", "hash").await.unwrap();

        let doc = export(&store).await.unwrap();
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["formatVersion"], 1);
        assert_eq!(json["databaseType"], "embedded");
        assert!(json["createdAt"].is_string());
        assert!(json["data"]["packages"].is_array());
        assert!(json["data"]["packageVersions"].is_array());
        assert!(json["data"]["adminUsers"].is_array());
        assert!(json["data"]["authTokens"].is_array());
        assert!(json["data"]["activityLog"].is_array());
    }

    #[tokio::test]
    async fn import_refuses_newer_formats() {
        let store = SqliteDataStore::open_in_memory().unwrap();
        store.migrate().await.unwrap();
        let mut doc = export(&store).await.unwrap();
        doc.format_version = FORMAT_VERSION + 1;
        assert!(matches!(
            import(&store, &doc, true).await,
            Err(DataStoreError::UnsupportedBackupVersion(_))
        ));
    }

    #[tokio::test]
    async fn dry_run_reports_counts_without_writing() {
        let source = SqliteDataStore::open_in_memory().unwrap();
        source.migrate().await.unwrap();
        source.create_user("a@example.com", "hash").await.unwrap();
        let doc = export(&source).await.unwrap();

        let target = SqliteDataStore::open_in_memory().unwrap();
        target.migrate().await.unwrap();
        let counts = import(&target, &doc, true).await.unwrap();
        assert_eq!(counts.users, 1);
        assert!(target
            .get_user_by_email("a@example.com")
            .await
            .unwrap()
            .is_none());
    }
}
