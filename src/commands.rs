//! Commands for the `repub` tool.

use std::sync::Arc;

use anyhow::{Context, Result};

use repub_server::datastore::DataStore;
use repub_server::{open_data_store, ServerConfig};

mod backup;
mod gc;
mod migrate;
mod serve;
mod storage;
mod token;

pub use self::backup::*;
pub use self::gc::*;
pub use self::migrate::*;
pub use self::serve::*;
pub use self::storage::*;
pub use self::token::*;

/// Reads the environment configuration and opens a migrated metadata store.
pub(crate) async fn open_store() -> Result<(ServerConfig, Arc<dyn DataStore>)> {
    let config = ServerConfig::from_env().context("invalid configuration")?;
    let store = open_data_store(&config).await?;
    store
        .migrate()
        .await
        .context("failed to apply schema migrations")?;
    Ok((config, store))
}
