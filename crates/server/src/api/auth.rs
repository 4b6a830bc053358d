//! Bearer-token extraction for the HTTP surface.
//!
//! Every handler receives a [`Caller`]. Requests without an `Authorization`
//! header yield an anonymous caller; requests with one must carry a valid
//! token or are rejected outright. Scope enforcement happens per handler.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::datastore::{ActorType, AuthToken, NewActivity, User};
use crate::services::RegistryService;
use crate::token::{scopes_grant, Access, Scope};

use super::ApiError;

/// The authenticated (or anonymous) originator of a request.
pub struct Caller {
    pub user: Option<User>,
    pub token: Option<AuthToken>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            user: None,
            token: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Whether the caller's scopes grant the access.
    pub fn can(&self, access: &Access<'_>) -> bool {
        self.token
            .as_ref()
            .map(|t| scopes_grant(&t.scopes, access))
            .unwrap_or(false)
    }

    /// Whether the caller holds any publish capability at all; the target
    /// package is only known once the manifest has been read.
    pub fn can_publish_something(&self) -> bool {
        self.token
            .as_ref()
            .map(|t| {
                t.scopes.iter().filter_map(|s| Scope::parse(s)).any(|s| {
                    matches!(
                        s,
                        Scope::Admin | Scope::PublishAll | Scope::PublishPackage(_)
                    )
                })
            })
            .unwrap_or(false)
    }

    /// Rejects the request unless the caller holds the `admin` scope.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if !self.is_authenticated() {
            return Err(ApiError::unauthorized("authentication required"));
        }
        if !self.can(&Access::Admin) {
            return Err(ApiError::forbidden("the `admin` scope is required"));
        }
        Ok(())
    }

    /// Rejects the request unless a token is present.
    pub fn require_authenticated(&self) -> Result<(&User, &AuthToken), ApiError> {
        match (&self.user, &self.token) {
            (Some(user), Some(token)) => Ok((user, token)),
            _ => Err(ApiError::unauthorized("authentication required")),
        }
    }

    /// Builds an activity entry attributed to this caller.
    pub fn activity(
        &self,
        activity_type: &str,
        target_type: &str,
        target_id: impl Into<String>,
    ) -> NewActivity {
        let actor_type = match &self.user {
            Some(_) if self.can(&Access::Admin) => ActorType::Admin,
            Some(_) => ActorType::User,
            None => ActorType::Anonymous,
        };
        NewActivity {
            activity_type: activity_type.to_string(),
            actor_type,
            actor_id: self.user.as_ref().map(|u| u.id),
            actor_email: self.user.as_ref().map(|u| u.email.clone()),
            target_type: Some(target_type.to_string()),
            target_id: Some(target_id.into()),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<RegistryService> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &RegistryService,
    ) -> Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(axum::http::header::AUTHORIZATION) else {
            return Ok(Self::anonymous());
        };
        let raw = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| {
                ApiError::unauthorized("the Authorization header must be a bearer token")
            })?;

        let (user, token) = service.tokens().authenticate(raw).await?;
        Ok(Self {
            user: Some(user),
            token: Some(token),
        })
    }
}
