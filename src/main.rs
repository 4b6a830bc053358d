use std::process::exit;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use repub::commands::{
    BackupCommand, GcCommand, MigrateCommand, ServeCommand, StorageCommand, TokenCommand,
};

fn version() -> &'static str {
    option_env!("CARGO_VERSION_INFO").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// The repub private package registry.
#[derive(Parser)]
#[clap(
    bin_name = "repub",
    version,
    propagate_version = true,
    arg_required_else_help = true
)]
#[command(version = version())]
enum RepubCli {
    Serve(ServeCommand),
    Migrate(MigrateCommand),
    #[clap(subcommand)]
    Token(TokenCommand),
    #[clap(subcommand)]
    Storage(StorageCommand),
    #[clap(subcommand)]
    Backup(BackupCommand),
    Gc(GcCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = match RepubCli::parse() {
        RepubCli::Serve(cmd) => cmd.exec().await,
        RepubCli::Migrate(cmd) => cmd.exec().await,
        RepubCli::Token(cmd) => cmd.exec().await,
        RepubCli::Storage(cmd) => cmd.exec().await,
        RepubCli::Backup(cmd) => cmd.exec().await,
        RepubCli::Gc(cmd) => cmd.exec().await,
    } {
        eprintln!("error: {e:?}");
        exit(1);
    }

    Ok(())
}
