use std::collections::HashSet;

use anyhow::{bail, Result};
use clap::Args;

use repub_server::blobstore::{CACHED_PREFIX, HOSTED_PREFIX};
use repub_server::datastore::DataStore;
use repub_server::storage_config::{self, ServerLock};

use super::open_store;

/// Removes blobs no metadata row references.
///
/// Deleting a package never deletes its blobs eagerly; this offline pass is
/// how they are reclaimed. Refuses while the server is running so an
/// in-flight publish cannot lose its freshly written archive.
#[derive(Args)]
pub struct GcCommand {
    /// Report what would be removed without deleting anything.
    #[clap(long)]
    pub dry_run: bool,
}

impl GcCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let (config, store) = open_store().await?;

        let lock_path = config.lock_file_path();
        if ServerLock::is_held(&lock_path) {
            bail!(
                "the server appears to be running (lock file `{path}` is held); \
                 stop it before collecting",
                path = lock_path.display()
            );
        }

        let active =
            storage_config::load_active(store.as_ref(), &config.default_blob_dir()).await?;
        let blobs = storage_config::build_blob_store(&active).await?;
        blobs.ensure_ready().await?;

        let referenced: HashSet<String> = store.all_archive_keys().await?.into_iter().collect();

        let mut scanned = 0u64;
        let mut removed = 0u64;
        for prefix in [HOSTED_PREFIX, CACHED_PREFIX] {
            for key in blobs.list_keys(prefix).await? {
                scanned += 1;
                if referenced.contains(&key) {
                    continue;
                }
                if self.dry_run {
                    println!("would remove {key}");
                } else {
                    blobs.delete(&key).await?;
                }
                removed += 1;
            }
        }

        let verb = if self.dry_run { "would remove" } else { "removed" };
        println!("scanned {scanned} blob(s); {verb} {removed} orphan(s)");
        Ok(())
    }
}
