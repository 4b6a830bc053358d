use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};

use repub_server::config::site;
use repub_server::datastore::DataStore;
use repub_server::token::TokenService;

use super::open_store;

/// Manages auth tokens.
#[derive(Subcommand)]
pub enum TokenCommand {
    Create(TokenCreateCommand),
    List(TokenListCommand),
    Delete(TokenDeleteCommand),
}

impl TokenCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        match self {
            Self::Create(cmd) => cmd.exec().await,
            Self::List(cmd) => cmd.exec().await,
            Self::Delete(cmd) => cmd.exec().await,
        }
    }
}

/// Creates a token for a user.
#[derive(Args)]
pub struct TokenCreateCommand {
    /// The email of the owning user; created if it does not exist.
    #[clap(long)]
    pub email: String,

    /// The token label, unique per user.
    #[clap(long)]
    pub label: String,

    /// A scope to attach; repeatable (e.g. `publish:all`, `publish:pkg:foo`,
    /// `read:all`, `admin`).
    #[clap(long = "scope", required = true)]
    pub scopes: Vec<String>,

    /// Days until the token expires; omit for no expiry.
    #[clap(long)]
    pub expires_in_days: Option<u64>,
}

impl TokenCreateCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let (_config, store) = open_store().await?;

        let user = match store.get_user_by_email(&self.email).await? {
            Some(user) => user,
            None => {
                // Operator-created accounts have no usable password until one
                // is set through the admin API.
                let placeholder = format!("!unset-{}", TokenService::generate_raw());
                store
                    .create_user(&self.email, &placeholder)
                    .await
                    .context("failed to create user")?
            }
        };

        let expires_at = self
            .expires_in_days
            .map(|days| Utc::now() + chrono::Duration::days(days as i64));
        let max_ttl_days = site::token_max_ttl_days(store.as_ref()).await;

        let tokens = TokenService::new(store);
        let (raw, token) = tokens
            .create(user.id, &self.label, &self.scopes, expires_at, max_ttl_days)
            .await?;

        println!("created token `{label}` (id {id})", label = token.label, id = token.id);
        println!();
        println!("  {raw}");
        println!();
        println!("store it now; the raw value cannot be shown again");
        Ok(())
    }
}

/// Lists tokens.
#[derive(Args)]
pub struct TokenListCommand {
    /// Limit to one user's tokens.
    #[clap(long)]
    pub email: Option<String>,
}

impl TokenListCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let (_config, store) = open_store().await?;

        let user_id = match &self.email {
            Some(email) => match store.get_user_by_email(email).await? {
                Some(user) => Some(user.id),
                None => bail!("user `{email}` was not found"),
            },
            None => None,
        };

        let tokens = store.list_tokens(user_id).await?;
        if tokens.is_empty() {
            println!("no tokens");
            return Ok(());
        }
        for token in tokens {
            let expiry = token
                .expires_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "{id}\t{label}\tuser={user}\tscopes={scopes}\texpires={expiry}",
                id = token.id,
                label = token.label,
                user = token.user_id,
                scopes = token.scopes.join(","),
            );
        }
        Ok(())
    }
}

/// Deletes a token by id.
#[derive(Args)]
pub struct TokenDeleteCommand {
    /// The token id (see `token list`).
    #[clap(long)]
    pub id: i64,
}

impl TokenDeleteCommand {
    /// Executes the command.
    pub async fn exec(self) -> Result<()> {
        let (_config, store) = open_store().await?;
        if !store.delete_token(self.id).await? {
            bail!("token {id} was not found", id = self.id);
        }
        println!("deleted token {id}", id = self.id);
        Ok(())
    }
}
