//! Process configuration.
//!
//! The server reads an immutable [`ServerConfig`] from `REPUB_*` environment
//! variables at startup. Tunables that may change at runtime live in the
//! `site_config` table instead and are read through [`site`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// The environment-derived configuration, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// The externally visible base URL, used to render archive URLs.
    pub base_url: String,
    /// A `postgres://` URL or a path to the embedded database file.
    pub database_url: String,
    /// Working directory for the embedded database, default blob storage,
    /// and the server lock file.
    pub data_dir: PathBuf,
    pub upstream_url: Option<Url>,
    pub enable_upstream_proxy: bool,
    pub require_publish_auth: bool,
    pub require_download_auth: bool,
    pub signed_url_ttl: Duration,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
}

fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: name,
                message: e.to_string(),
            })
        })
        .transpose()
}

fn bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var: name,
                message: format!("expected a boolean, got `{raw}`"),
            }),
        },
    }
}

impl ServerConfig {
    /// Reads the configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr: SocketAddr = parse_var("REPUB_LISTEN_ADDR")?
            .unwrap_or_else(|| "127.0.0.1:8080".parse().expect("valid default address"));
        let base_url =
            var("REPUB_BASE_URL").unwrap_or_else(|| format!("http://{listen_addr}"));
        let data_dir = PathBuf::from(var("REPUB_DATA_DIR").unwrap_or_else(|| "data".to_string()));
        let database_url = var("REPUB_DATABASE_URL")
            .unwrap_or_else(|| data_dir.join("repub.db").to_string_lossy().into_owned());

        let upstream_url = var("REPUB_UPSTREAM_URL")
            .map(|raw| {
                Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                    var: "REPUB_UPSTREAM_URL",
                    message: e.to_string(),
                })
            })
            .transpose()?;
        let enable_upstream_proxy = bool_var("REPUB_ENABLE_UPSTREAM_PROXY", false)?;
        if enable_upstream_proxy && upstream_url.is_none() {
            return Err(ConfigError::Invalid {
                var: "REPUB_ENABLE_UPSTREAM_PROXY",
                message: "upstream proxying requires REPUB_UPSTREAM_URL".to_string(),
            });
        }

        Ok(Self {
            listen_addr,
            base_url: base_url.trim_end_matches('/').to_string(),
            database_url,
            data_dir,
            upstream_url,
            enable_upstream_proxy,
            require_publish_auth: bool_var("REPUB_REQUIRE_PUBLISH_AUTH", true)?,
            require_download_auth: bool_var("REPUB_REQUIRE_DOWNLOAD_AUTH", false)?,
            signed_url_ttl: Duration::from_secs(
                parse_var::<u64>("REPUB_SIGNED_URL_TTL_SECONDS")?.unwrap_or(300),
            ),
            rate_limit_requests: parse_var("REPUB_RATE_LIMIT_REQUESTS")?.unwrap_or(300),
            rate_limit_window: Duration::from_secs(
                parse_var::<u64>("REPUB_RATE_LIMIT_WINDOW_SECONDS")?.unwrap_or(60),
            ),
        })
    }

    /// The lock file guarding single-instance operation and offline
    /// storage-config activation.
    pub fn lock_file_path(&self) -> PathBuf {
        self.data_dir.join("repub.lock")
    }

    /// Where blobs live when no storage config has ever been activated.
    pub fn default_blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

/// Typed accessors over the `site_config` table.
///
/// Missing or malformed values fall back to their defaults; a broken config
/// row must never take the registry down.
pub mod site {
    use std::time::Duration;

    use crate::datastore::DataStore;

    pub const KEY_MAX_UPLOAD_SIZE_MB: &str = "max_upload_size_mb";
    pub const KEY_TOKEN_MAX_TTL_DAYS: &str = "token_max_ttl_days";
    pub const KEY_WEBHOOK_FAILURE_THRESHOLD: &str = "webhook_failure_threshold";
    pub const KEY_UPSTREAM_LISTING_TTL_SECONDS: &str = "upstream_listing_ttl_seconds";
    pub const KEY_UPLOAD_SESSION_TTL_MINUTES: &str = "upload_session_ttl_minutes";

    /// Keys owned by the environment; the config API refuses to write them.
    pub const ENV_ONLY_KEYS: &[&str] = &["listen_addr", "base_url", "database_url"];

    async fn get_u64(store: &dyn DataStore, key: &str, default: u64) -> u64 {
        match store.get_config(key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(default),
            Ok(None) => default,
            Err(e) => {
                tracing::warn!("failed to read site config `{key}`: {e}");
                default
            }
        }
    }

    pub async fn max_upload_size_bytes(store: &dyn DataStore) -> u64 {
        get_u64(store, KEY_MAX_UPLOAD_SIZE_MB, 100).await * 1024 * 1024
    }

    pub async fn token_max_ttl_days(store: &dyn DataStore) -> u64 {
        get_u64(store, KEY_TOKEN_MAX_TTL_DAYS, 0).await
    }

    pub async fn webhook_failure_threshold(store: &dyn DataStore) -> u64 {
        get_u64(store, KEY_WEBHOOK_FAILURE_THRESHOLD, 20).await
    }

    pub async fn upstream_listing_ttl(store: &dyn DataStore) -> Duration {
        Duration::from_secs(get_u64(store, KEY_UPSTREAM_LISTING_TTL_SECONDS, 300).await)
    }

    pub async fn upload_session_ttl(store: &dyn DataStore) -> Duration {
        Duration::from_secs(get_u64(store, KEY_UPLOAD_SESSION_TTL_MINUTES, 10).await * 60)
    }
}
