use anyhow::{Context, Result};
use clap::Args;

use repub_server::datastore::DataStore;
use repub_server::{open_data_store, ServerConfig};

/// Applies pending schema migrations and exits.
#[derive(Args)]
pub struct MigrateCommand {}

impl MigrateCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let config = ServerConfig::from_env().context("invalid configuration")?;
        let store = open_data_store(&config).await?;
        let applied = store.migrate().await?;
        if applied == 0 {
            println!("schema is up to date");
        } else {
            println!("applied {applied} migration(s)");
        }
        Ok(())
    }
}
