use anyhow::{bail, Result};
use clap::{Args, Subcommand};

use repub_server::storage_config::{self, ServerLock};

use super::open_store;

/// Manages the staged storage configuration.
#[derive(Subcommand)]
pub enum StorageCommand {
    Activate(StorageActivateCommand),
}

impl StorageCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        match self {
            Self::Activate(cmd) => cmd.exec().await,
        }
    }
}

/// Promotes the pending storage config to active.
///
/// Refuses while a server instance holds the lock file; the new config takes
/// effect at the next `serve`.
#[derive(Args)]
pub struct StorageActivateCommand {}

impl StorageActivateCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let (config, store) = open_store().await?;

        let lock_path = config.lock_file_path();
        if ServerLock::is_held(&lock_path) {
            bail!(
                "the server appears to be running (lock file `{path}` is held); \
                 stop it before activating",
                path = lock_path.display()
            );
        }

        match storage_config::activate_pending(store.as_ref()).await? {
            Some(active) => {
                println!("activated storage config: {active:?}");
                Ok(())
            }
            None => bail!("there is no pending storage config to activate"),
        }
    }
}
