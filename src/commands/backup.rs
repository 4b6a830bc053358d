use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use repub_server::backup::{self, BackupDocument};

use super::open_store;

/// Exports and imports metadata backups.
///
/// Backups cover the metadata store only; blobs are replicated separately.
#[derive(Subcommand)]
pub enum BackupCommand {
    Export(BackupExportCommand),
    Import(BackupImportCommand),
}

impl BackupCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        match self {
            Self::Export(cmd) => cmd.exec().await,
            Self::Import(cmd) => cmd.exec().await,
        }
    }
}

/// Writes a backup document to a file.
#[derive(Args)]
pub struct BackupExportCommand {
    /// Where to write the backup JSON.
    pub path: PathBuf,
}

impl BackupExportCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let (_config, store) = open_store().await?;
        let document = backup::export(store.as_ref()).await?;

        let file = std::fs::File::create(&self.path)
            .with_context(|| format!("failed to create `{}`", self.path.display()))?;
        serde_json::to_writer_pretty(file, &document).context("failed to write backup")?;

        let counts = backup::ImportCounts::of(&document.data);
        println!(
            "exported {packages} package(s), {versions} version(s), {users} user(s) to `{path}`",
            packages = counts.packages,
            versions = counts.package_versions,
            users = counts.users,
            path = self.path.display()
        );
        Ok(())
    }
}

/// Restores a backup document from a file.
#[derive(Args)]
pub struct BackupImportCommand {
    /// The backup JSON to read.
    pub path: PathBuf,

    /// Validate and count rows without writing anything.
    #[clap(long)]
    pub dry_run: bool,
}

impl BackupImportCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let (_config, store) = open_store().await?;

        let raw = std::fs::read(&self.path)
            .with_context(|| format!("failed to read `{}`", self.path.display()))?;
        let document: BackupDocument =
            serde_json::from_slice(&raw).context("invalid backup document")?;

        let counts = backup::import(store.as_ref(), &document, self.dry_run).await?;
        let prefix = if self.dry_run { "would import" } else { "imported" };
        println!(
            "{prefix} {packages} package(s), {versions} version(s), {users} user(s), \
             {admins} admin user(s), {tokens} token(s), {activity} activity entr(ies)",
            packages = counts.packages,
            versions = counts.package_versions,
            users = counts.users,
            admins = counts.admin_users,
            tokens = counts.auth_tokens,
            activity = counts.activity_log,
        );
        Ok(())
    }
}
