//! The resolution surface: version listings, archives, and search.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use repub_api::PUB_MEDIA_TYPE;

use crate::blobstore::validate_key;
use crate::datastore::Package;
use crate::services::RegistryService;
use crate::token::Access;
use crate::webhook::EVENT_PACKAGE_DOWNLOADED;

use super::auth::Caller;
use super::{admin, ApiError, Path, Query};

/// Serialises a document with the pub v2 media type.
fn pub_json<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(value).map_err(ApiError::internal)?;
    Response::builder()
        .header(header::CONTENT_TYPE, PUB_MEDIA_TYPE)
        .body(Body::from(body))
        .map_err(ApiError::internal)
}

fn octet_stream(bytes: Bytes) -> Result<Response, ApiError> {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(bytes))
        .map_err(ApiError::internal)
}

/// Gate shared by the whole resolution surface, cached namespace included.
fn enforce_download_auth(service: &RegistryService, caller: &Caller) -> Result<(), ApiError> {
    if !service.config().require_download_auth {
        return Ok(());
    }
    if !caller.is_authenticated() {
        return Err(ApiError::unauthorized("authentication required"));
    }
    if !caller.can(&Access::Download) {
        return Err(ApiError::forbidden("the `read:all` scope is required"));
    }
    Ok(())
}

/// Finds a package, falling through to the upstream proxy per the cache
/// rules: hosted packages never fall through; unknown or cached ones do when
/// proxying is enabled.
async fn resolve_package(service: &RegistryService, name: &str) -> Result<Package, ApiError> {
    let local = service.store().get_package(name).await?;
    match local {
        Some(package) if !package.is_upstream_cache => Ok(package),
        other => match service.proxy() {
            Some(proxy) => {
                proxy.ensure_listing(name).await?;
                service
                    .store()
                    .get_package(name)
                    .await?
                    .ok_or_else(|| ApiError::not_found(format!("package `{name}` was not found")))
            }
            None => other
                .ok_or_else(|| ApiError::not_found(format!("package `{name}` was not found"))),
        },
    }
}

pub async fn version_listing(
    State(service): State<RegistryService>,
    Path(name): Path<String>,
    caller: Caller,
) -> Result<Response, ApiError> {
    enforce_download_auth(&service, &caller)?;
    resolve_package(&service, &name).await?;

    let listing = service
        .version_listing(&name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("package `{name}` was not found")))?;
    pub_json(&listing)
}

pub async fn single_version(
    State(service): State<RegistryService>,
    Path((name, version)): Path<(String, String)>,
    caller: Caller,
) -> Result<Response, ApiError> {
    enforce_download_auth(&service, &caller)?;
    resolve_package(&service, &name).await?;

    let row = service
        .store()
        .get_package_version(&name, &version)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("version `{version}` of `{name}` was not found"))
        })?;
    pub_json(&service.version_entry(&row))
}

pub async fn archive(
    State(service): State<RegistryService>,
    Path((name, version)): Path<(String, String)>,
    caller: Caller,
) -> Result<Response, ApiError> {
    enforce_download_auth(&service, &caller)?;
    let package = resolve_package(&service, &name).await?;

    let row = service
        .store()
        .get_package_version(&name, &version)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("version `{version}` of `{name}` was not found"))
        })?;

    let response = if service.blobs().exists(&row.archive_key).await? {
        match service
            .blobs()
            .presigned_get_url(&row.archive_key, service.config().signed_url_ttl)
            .await?
        {
            Some(url) => Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, url)
                .body(Body::empty())
                .map_err(ApiError::internal)?,
            None => octet_stream(service.blobs().get_archive(&row.archive_key).await?)?,
        }
    } else if package.is_upstream_cache {
        let proxy = service.proxy().ok_or_else(|| {
            ApiError::new(
                repub_api::error::ErrorCode::UpstreamUnavailable,
                "upstream proxying is disabled and the archive is not materialised",
            )
        })?;
        octet_stream(proxy.get_archive(&name, &version).await?)?
    } else {
        return Err(ApiError::not_found(format!(
            "archive for `{name}` {version} was not found"
        )));
    };

    service.downloads().record(&name, &version);
    service.dispatcher().dispatch(
        EVENT_PACKAGE_DOWNLOADED,
        serde_json::json!({ "package": name, "version": version }),
    );

    Ok(response)
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    q: String,
    page: Option<u32>,
    limit: Option<u32>,
}

pub async fn search(
    State(service): State<RegistryService>,
    Query(params): Query<SearchParams>,
    caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    enforce_download_auth(&service, &caller)?;
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let result = service
        .store()
        .search_packages(&params.q, page, limit)
        .await?;
    Ok(super::Json(admin::package_list(result, page, limit)))
}

pub async fn blob_fallback(
    State(service): State<RegistryService>,
    Path(key): Path<String>,
    caller: Caller,
) -> Result<Response, ApiError> {
    enforce_download_auth(&service, &caller)?;
    validate_key(&key).map_err(|_| ApiError::bad_request(format!("invalid blob key `{key}`")))?;
    octet_stream(service.blobs().get_archive(&key).await?)
}
