use anyhow::{Context, Result};
use clap::Args;
use tokio::signal;

use repub_server::{Server, ServerConfig};

/// Starts the HTTP service.
///
/// All configuration comes from `REPUB_*` environment variables.
#[derive(Args)]
pub struct ServeCommand {}

impl ServeCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let config = ServerConfig::from_env().context("invalid configuration")?;
        tracing::debug!("config: {config:?}");
        Server::new(config).run(shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");

        tracing::info!("starting shutdown (SIGINT)");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;

        tracing::info!("starting shutdown (SIGTERM)");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
