//! Opaque bearer tokens and scope evaluation.
//!
//! Raw tokens are random and returned exactly once; only the SHA-256 of the
//! raw value is stored. Scope strings attach capabilities to a token.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::datastore::{AuthToken, DataStore, DataStoreError, User};

/// Random bytes in a raw token.
const TOKEN_BYTES: usize = 32;

/// Minimum interval between `last_used_at` writes for one token.
const TOUCH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid scope `{0}`")]
    InvalidScope(String),

    #[error("a token label is required")]
    MissingLabel,

    #[error("token expiry exceeds the maximum of {0} days")]
    TtlExceedsMax(u64),

    #[error("user {0} was not found")]
    UnknownUser(i64),

    #[error("invalid or expired token")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] DataStoreError),
}

/// A capability attached to a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Full authority over the registry.
    Admin,
    /// Publish any package.
    PublishAll,
    /// Publish one named package.
    PublishPackage(String),
    /// Download when download auth is required.
    ReadAll,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "publish:all" => Some(Self::PublishAll),
            "read:all" => Some(Self::ReadAll),
            _ => s
                .strip_prefix("publish:pkg:")
                .filter(|name| !name.is_empty())
                .map(|name| Self::PublishPackage(name.to_string())),
        }
    }

    /// Whether this scope grants the requested access.
    pub fn grants(&self, access: &Access<'_>) -> bool {
        match (self, access) {
            (Self::Admin, _) => true,
            (Self::PublishAll, Access::Publish(_)) => true,
            (Self::PublishPackage(name), Access::Publish(pkg)) => name == pkg,
            (Self::ReadAll, Access::Download) => true,
            _ => false,
        }
    }

    /// Whether this scope subsumes `other`; used to stop a token from
    /// minting broader tokens than its own.
    pub fn covers(&self, other: &Scope) -> bool {
        match (self, other) {
            (Self::Admin, _) => true,
            (a, b) if a == b => true,
            (Self::PublishAll, Self::PublishPackage(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::PublishAll => f.write_str("publish:all"),
            Self::PublishPackage(name) => write!(f, "publish:pkg:{name}"),
            Self::ReadAll => f.write_str("read:all"),
        }
    }
}

/// A requested capability `(verb, object)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access<'a> {
    /// Publish into the named package.
    Publish(&'a str),
    /// Download an archive.
    Download,
    /// Use the admin API.
    Admin,
}

/// Evaluates a held scope set against a requested access.
pub fn scopes_grant(scopes: &[String], access: &Access<'_>) -> bool {
    scopes
        .iter()
        .filter_map(|s| Scope::parse(s))
        .any(|scope| scope.grants(access))
}

/// Mints and authenticates bearer tokens.
pub struct TokenService {
    store: Arc<dyn DataStore>,
    touched: Mutex<HashMap<i64, Instant>>,
}

impl TokenService {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            touched: Mutex::new(HashMap::new()),
        }
    }

    /// Generates a fresh raw token value.
    pub fn generate_raw() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// The stored form of a raw token.
    pub fn hash(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// Creates a token, returning the raw value (exactly once) and the row.
    ///
    /// `max_ttl_days` of zero means unbounded.
    pub async fn create(
        &self,
        user_id: i64,
        label: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
        max_ttl_days: u64,
    ) -> Result<(String, AuthToken), TokenError> {
        if label.trim().is_empty() {
            return Err(TokenError::MissingLabel);
        }
        for scope in scopes {
            if Scope::parse(scope).is_none() {
                return Err(TokenError::InvalidScope(scope.clone()));
            }
        }
        if let (Some(expires_at), true) = (expires_at, max_ttl_days > 0) {
            let max = Utc::now() + chrono::Duration::days(max_ttl_days as i64);
            if expires_at > max {
                return Err(TokenError::TtlExceedsMax(max_ttl_days));
            }
        }
        if self.store.get_user(user_id).await?.is_none() {
            return Err(TokenError::UnknownUser(user_id));
        }

        let raw = Self::generate_raw();
        let token = self
            .store
            .create_token(user_id, label, &Self::hash(&raw), scopes, expires_at)
            .await?;
        Ok((raw, token))
    }

    /// Authenticates a raw token, returning the owning user and the token row.
    ///
    /// Successful lookups update `last_used_at`, coalesced to at most one
    /// write per token per minute.
    pub async fn authenticate(&self, raw: &str) -> Result<(User, AuthToken), TokenError> {
        let hash = Self::hash(raw);
        let token = self
            .store
            .get_token_by_hash(&hash)
            .await?
            .ok_or(TokenError::Unauthorized)?;

        if let Some(expires_at) = token.expires_at {
            if expires_at <= Utc::now() {
                return Err(TokenError::Unauthorized);
            }
        }

        let user = self
            .store
            .get_user(token.user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or(TokenError::Unauthorized)?;

        let should_touch = {
            let mut touched = self
                .touched
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            match touched.get(&token.id) {
                Some(last) if now.duration_since(*last) < TOUCH_INTERVAL => false,
                _ => {
                    touched.insert(token.id, now);
                    true
                }
            }
        };
        if should_touch {
            self.store.touch_token(&hash, Utc::now()).await?;
        }

        Ok((user, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SqliteDataStore;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn scope_grammar_round_trips() {
        for s in ["admin", "publish:all", "publish:pkg:foo", "read:all"] {
            assert_eq!(Scope::parse(s).unwrap().to_string(), s);
        }
        assert!(Scope::parse("publish:pkg:").is_none());
        assert!(Scope::parse("write:all").is_none());
        assert!(Scope::parse("").is_none());
    }

    #[test]
    fn admin_covers_everything() {
        let held = scopes(&["admin"]);
        assert!(scopes_grant(&held, &Access::Publish("foo")));
        assert!(scopes_grant(&held, &Access::Download));
        assert!(scopes_grant(&held, &Access::Admin));
    }

    #[test]
    fn publish_all_covers_any_package_but_not_admin() {
        let held = scopes(&["publish:all"]);
        assert!(scopes_grant(&held, &Access::Publish("foo")));
        assert!(scopes_grant(&held, &Access::Publish("bar")));
        assert!(!scopes_grant(&held, &Access::Admin));
        assert!(!scopes_grant(&held, &Access::Download));
    }

    #[test]
    fn package_scope_is_exact() {
        let held = scopes(&["publish:pkg:foo"]);
        assert!(scopes_grant(&held, &Access::Publish("foo")));
        assert!(!scopes_grant(&held, &Access::Publish("foobar")));
        assert!(!scopes_grant(&held, &Access::Download));
    }

    #[test]
    fn read_all_covers_downloads_only() {
        let held = scopes(&["read:all"]);
        assert!(scopes_grant(&held, &Access::Download));
        assert!(!scopes_grant(&held, &Access::Publish("foo")));
        assert!(!scopes_grant(&held, &Access::Admin));
    }

    #[test]
    fn unknown_scopes_grant_nothing() {
        let held = scopes(&["bogus", "also:bogus"]);
        assert!(!scopes_grant(&held, &Access::Download));
    }

    #[test]
    fn covers_is_a_partial_order() {
        let admin = Scope::Admin;
        let publish_all = Scope::PublishAll;
        let publish_foo = Scope::PublishPackage("foo".to_string());
        assert!(admin.covers(&publish_all));
        assert!(publish_all.covers(&publish_foo));
        assert!(!publish_foo.covers(&publish_all));
        assert!(!publish_all.covers(&Scope::ReadAll));
    }

    #[test]
    fn raw_tokens_are_long_and_unique() {
        let a = TokenService::generate_raw();
        let b = TokenService::generate_raw();
        assert_ne!(a, b);
        // 32 bytes base64url-encoded, comfortably past the 20-byte floor.
        assert!(a.len() >= 40);
    }

    async fn service_with_user() -> (TokenService, i64) {
        let store = Arc::new(SqliteDataStore::open_in_memory().unwrap());
        store.migrate().await.unwrap();
        let user = store.create_user("a@example.com", "hash").await.unwrap();
        (TokenService::new(store), user.id)
    }

    #[tokio::test]
    async fn create_then_authenticate() {
        let (service, user_id) = service_with_user().await;
        let (raw, token) = service
            .create(user_id, "ci", &scopes(&["publish:all"]), None, 0)
            .await
            .unwrap();
        assert_eq!(token.token_hash, TokenService::hash(&raw));

        let (user, authed) = service.authenticate(&raw).await.unwrap();
        assert_eq!(user.id, user_id);
        assert_eq!(authed.id, token.id);

        // The raw value is never stored anywhere.
        assert_ne!(authed.token_hash, raw);
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_and_expired() {
        let (service, user_id) = service_with_user().await;
        assert!(matches!(
            service.authenticate("no-such-token").await,
            Err(TokenError::Unauthorized)
        ));

        let past = Utc::now() - chrono::Duration::hours(1);
        let (raw, _) = service
            .create(user_id, "old", &scopes(&["read:all"]), Some(past), 0)
            .await
            .unwrap();
        assert!(matches!(
            service.authenticate(&raw).await,
            Err(TokenError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn create_rejects_expiry_past_the_configured_max() {
        let (service, user_id) = service_with_user().await;
        let far = Utc::now() + chrono::Duration::days(90);
        let result = service
            .create(user_id, "ci", &scopes(&["publish:all"]), Some(far), 30)
            .await;
        assert!(matches!(result, Err(TokenError::TtlExceedsMax(30))));

        // Zero means unbounded.
        service
            .create(user_id, "ci", &scopes(&["publish:all"]), Some(far), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_rejects_unknown_scopes() {
        let (service, user_id) = service_with_user().await;
        let result = service
            .create(user_id, "ci", &scopes(&["publish:everything"]), None, 0)
            .await;
        assert!(matches!(result, Err(TokenError::InvalidScope(_))));
    }

    #[tokio::test]
    async fn touch_is_coalesced() {
        let (service, user_id) = service_with_user().await;
        let (raw, token) = service
            .create(user_id, "ci", &scopes(&["read:all"]), None, 0)
            .await
            .unwrap();

        service.authenticate(&raw).await.unwrap();
        let first = service
            .store
            .get_token(token.id)
            .await
            .unwrap()
            .unwrap()
            .last_used_at
            .expect("first use should touch");

        // A second use inside the coalescing window leaves the stamp alone.
        service.authenticate(&raw).await.unwrap();
        let second = service
            .store
            .get_token(token.id)
            .await
            .unwrap()
            .unwrap()
            .last_used_at
            .unwrap();
        assert_eq!(first, second);
    }
}
