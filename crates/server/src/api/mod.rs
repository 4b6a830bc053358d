use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use repub_api::admin::HealthResponse;
use repub_api::error::{ErrorCode, ErrorEnvelope};

use crate::archive::ArchiveError;
use crate::blobstore::BlobStoreError;
use crate::datastore::DataStoreError;
use crate::proxy::ProxyError;
use crate::services::RegistryService;
use crate::storage_config::StorageConfigError;
use crate::token::TokenError;

pub mod admin;
pub mod auth;
pub mod packages;
pub mod publish;
pub mod ratelimit;

pub use ratelimit::{RateLimitLayer, RateLimiter};

/// The error every handler returns; serialises as the error envelope.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn upload_expired() -> Self {
        Self::new(
            ErrorCode::UploadExpired,
            "the upload session is missing, expired, or already used",
        )
    }

    /// Logs the underlying cause and hides it from the client.
    pub fn internal(e: impl std::fmt::Display) -> Self {
        tracing::error!("unexpected error: {e}");
        Self::new(
            ErrorCode::Internal,
            "an error occurred while processing the request",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.code.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            axum::Json(ErrorEnvelope::new(self.code, self.message)),
        )
            .into_response()
    }
}

impl From<DataStoreError> for ApiError {
    fn from(e: DataStoreError) -> Self {
        match e {
            DataStoreError::VersionConflict { package, version } => Self::new(
                ErrorCode::VersionExists,
                format!("version `{version}` of `{package}` already exists with different contents"),
            ),
            DataStoreError::PackageKindConflict(name) => Self::forbidden(format!(
                "package `{name}` belongs to the other namespace"
            )),
            e @ (DataStoreError::PackageNotFound(_)
            | DataStoreError::VersionNotFound { .. }
            | DataStoreError::SessionNotFound(_)
            | DataStoreError::WebhookNotFound(_)) => Self::not_found(e.to_string()),
            e @ (DataStoreError::UserExists(_)
            | DataStoreError::AdminUserExists(_)
            | DataStoreError::TokenLabelExists(_)
            | DataStoreError::UnsupportedBackupVersion(_)) => Self::bad_request(e.to_string()),
            e => Self::internal(e),
        }
    }
}

impl From<BlobStoreError> for ApiError {
    fn from(e: BlobStoreError) -> Self {
        match e {
            BlobStoreError::NotFound(key) => Self::not_found(format!("blob `{key}` was not found")),
            BlobStoreError::InvalidKey(key) => Self::bad_request(format!("invalid blob key `{key}`")),
            e @ BlobStoreError::Transient(_) => Self::internal(e),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::NotFound => Self::not_found("package was not found"),
            e @ (ProxyError::Unavailable(_) | ProxyError::HashMismatch { .. }) => {
                Self::new(ErrorCode::UpstreamUnavailable, e.to_string())
            }
            e @ ProxyError::Internal(_) => Self::internal(e),
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(e: ArchiveError) -> Self {
        match e {
            e @ (ArchiveError::NotGzip | ArchiveError::InvalidTar(_)) => {
                Self::new(ErrorCode::UnsupportedMediaType, e.to_string())
            }
            e @ ArchiveError::InvalidManifest(_) => Self::bad_request(e.to_string()),
            e => Self::new(ErrorCode::Unprocessable, e.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Unauthorized => Self::unauthorized("invalid or expired token"),
            TokenError::Store(e) => e.into(),
            e => Self::bad_request(e.to_string()),
        }
    }
}

impl From<StorageConfigError> for ApiError {
    fn from(e: StorageConfigError) -> Self {
        match e {
            StorageConfigError::Store(e) => e.into(),
            e @ (StorageConfigError::Invalid(_) | StorageConfigError::Unsupported(_)) => {
                Self::bad_request(e.to_string())
            }
            e => Self::internal(e),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

/// A JSON extractor that rejects with the error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> axum::response::Response {
        axum::Json(self.0).into_response()
    }
}

/// A path extractor that rejects with the error envelope.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct Path<T>(pub T);

/// A query extractor that rejects with the error envelope.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct Query<T>(pub T);

pub async fn not_found() -> ApiError {
    ApiError::not_found("the requested resource was not found")
}

async fn health(State(service): State<RegistryService>) -> Json<HealthResponse> {
    let health = service.store().health().await;
    Json(HealthResponse {
        status: health.status,
        db_type: health.db_type.to_string(),
    })
}

/// Assembles the public and admin routers.
///
/// `strict_limit` wraps the publish and admin surfaces on top of the general
/// limit the caller layers over the whole router.
pub fn create_router(service: RegistryService, strict_limit: RateLimitLayer) -> Router {
    let publish_routes = Router::new()
        .route("/packages/versions/new", get(publish::new_session))
        .route("/packages/versions/newUpload", post(publish::upload))
        .route("/packages/versions/newUploadFinish", get(publish::finish))
        // The archive size limit is enforced while streaming the multipart
        // body, not by the framework default.
        .layer(DefaultBodyLimit::disable())
        .layer(strict_limit.clone());

    let resolution_routes = Router::new()
        .route("/packages/search", get(packages::search))
        .route("/packages/:name", get(packages::version_listing))
        .route(
            "/packages/:name/versions/:version",
            get(packages::single_version),
        )
        .route(
            "/packages/:name/versions/:version/archive.tar.gz",
            get(packages::archive),
        )
        .route("/blobs/*key", get(packages::blob_fallback));

    let admin_routes = Router::new()
        .route("/stats", get(admin::stats))
        .route("/activity", get(admin::activity))
        .route("/packages", get(admin::list_packages))
        .route(
            "/packages/:name",
            get(admin::package_detail).delete(admin::delete_package),
        )
        .route("/packages/:name/discontinue", post(admin::discontinue))
        .route(
            "/packages/:name/versions/:version/retract",
            post(admin::retract),
        )
        .route(
            "/packages/:name/versions/:version/unretract",
            post(admin::unretract),
        )
        .route("/users", get(admin::list_users).post(admin::create_user))
        .route("/users/:id", delete(admin::delete_user))
        .route(
            "/admin-users",
            get(admin::list_admin_users).post(admin::create_admin_user),
        )
        .route("/admin-users/:id", delete(admin::delete_admin_user))
        .route("/tokens", get(admin::list_tokens).post(admin::create_token))
        .route("/tokens/:id", delete(admin::delete_token))
        .route(
            "/webhooks",
            get(admin::list_webhooks).post(admin::create_webhook),
        )
        .route("/webhooks/:id", delete(admin::delete_webhook))
        .route("/webhooks/:id/test", post(admin::test_webhook))
        .route("/webhooks/:id/deliveries", get(admin::webhook_deliveries))
        .route("/config", get(admin::get_config).post(admin::set_config))
        .route(
            "/config/storage",
            get(admin::get_storage_config).put(admin::put_storage_config),
        )
        .route("/cache/clear", post(admin::clear_cache))
        .route("/blobs/gc", post(admin::gc_blobs))
        // Admin consoles are browser applications.
        .layer(CorsLayer::permissive())
        .layer(strict_limit);

    Router::new()
        .nest("/api", publish_routes.merge(resolution_routes))
        .nest("/admin/api", admin_routes)
        .route("/healthz", get(health))
        .fallback(not_found)
        .with_state(service)
}
