//! The two-step publish pipeline.
//!
//! Step one opens an upload session; step two receives the archive as
//! `multipart/form-data`, validates it, and promotes blob plus metadata; step
//! three is the redirect target that reports the outcome in the pub client's
//! expected JSON shape. Terminal failures in step two expire the session, so
//! a client must start over rather than retry the same URL.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use repub_api::publish::{SuccessEnvelope, UploadSessionResponse};

use crate::archive::validate_archive;
use crate::blobstore::{archive_key, ArchiveNamespace};
use crate::config::site;
use crate::datastore::{NewPackageVersion, SessionState};
use crate::services::RegistryService;
use crate::token::Access;
use crate::webhook::EVENT_PACKAGE_PUBLISHED;

use super::auth::Caller;
use super::{ApiError, Json, Query};

/// Ceiling on the wall time of one upload body, against slow-write clients.
const UPLOAD_READ_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn new_session(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<UploadSessionResponse>, ApiError> {
    if service.config().require_publish_auth {
        if !caller.is_authenticated() {
            return Err(ApiError::unauthorized("authentication required to publish"));
        }
        if !caller.can_publish_something() {
            return Err(ApiError::forbidden("a publish scope is required"));
        }
    }

    // Opportunistically drop sessions that ran out their TTL.
    let now = Utc::now();
    if let Err(e) = service.store().cleanup_expired_sessions(now).await {
        tracing::warn!("failed to clean up expired upload sessions: {e}");
    }

    let ttl = site::upload_session_ttl(service.store().as_ref()).await;
    let id = Uuid::new_v4().to_string();
    let session = service
        .store()
        .create_upload_session(
            &id,
            caller.user.as_ref().map(|u| u.id),
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(10)),
        )
        .await?;

    Ok(Json(UploadSessionResponse {
        url: format!(
            "{base}/api/packages/versions/newUpload?session={id}",
            base = service.config().base_url,
            id = session.id
        ),
        fields: Default::default(),
    }))
}

#[derive(Deserialize)]
pub struct UploadParams {
    session: String,
}

pub async fn upload(
    State(service): State<RegistryService>,
    Query(params): Query<UploadParams>,
    caller: Caller,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    match process_upload(&service, &params.session, &caller, multipart).await {
        Ok(response) => Ok(response),
        Err(e) => {
            // A failed upload terminates the session; the client starts over.
            if let Err(expire_err) = service.store().expire_upload_session(&params.session).await
            {
                tracing::warn!("failed to expire upload session: {expire_err}");
            }
            Err(e)
        }
    }
}

async fn process_upload(
    service: &RegistryService,
    session_id: &str,
    caller: &Caller,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let now = Utc::now();
    let session = service
        .store()
        .get_upload_session(session_id)
        .await?
        .ok_or_else(ApiError::upload_expired)?;
    if session.state != SessionState::Open || session.expires_at < now {
        return Err(ApiError::upload_expired());
    }

    let max_bytes = site::max_upload_size_bytes(service.store().as_ref()).await;
    let data = tokio::time::timeout(UPLOAD_READ_TIMEOUT, read_archive(multipart, max_bytes))
        .await
        .map_err(|_| ApiError::bad_request("upload timed out"))??;

    // Hashing and the tar walk are CPU-bound; keep them off the HTTP workers.
    let (data, sha256, info) = tokio::task::spawn_blocking(move || {
        let sha256 = hex::encode(Sha256::digest(&data));
        let info = validate_archive(&data)?;
        Ok::<_, ApiError>((data, sha256, info))
    })
    .await
    .map_err(ApiError::internal)??;

    if let Some(package) = service.store().get_package(&info.name).await? {
        if package.is_upstream_cache {
            return Err(ApiError::forbidden(format!(
                "package `{name}` mirrors the upstream registry and cannot be published to",
                name = info.name
            )));
        }
    }

    if service.config().require_publish_auth && !caller.can(&Access::Publish(&info.name)) {
        return Err(ApiError::forbidden(format!(
            "publishing `{name}` requires the `publish:pkg:{name}`, `publish:all`, or `admin` scope",
            name = info.name
        )));
    }

    let key = archive_key(&info.name, &info.version_raw, &sha256, ArchiveNamespace::Hosted);
    service.blobs().put_archive(&key, &data).await?;

    // A failure past this point intentionally leaves the blob behind: blobs
    // are content-addressed and collected by the GC pass.
    let outcome = service
        .store()
        .upsert_package_version(NewPackageVersion {
            package_name: info.name.clone(),
            version: info.version_raw.clone(),
            pubspec: info.pubspec.clone(),
            archive_key: key,
            archive_sha256: sha256.clone(),
            upstream_archive_url: None,
            is_upstream_cache: false,
            description: info.description.clone(),
        })
        .await?;

    service.store().complete_upload_session(&session.id).await?;

    // Idempotent re-publish of identical bytes must not duplicate side
    // effects.
    if outcome.created {
        service.recompute_denorm(&info.name).await?;
        service
            .log_activity(caller.activity(
                "package_published",
                "package_version",
                format!("{}@{}", info.name, info.version_raw),
            ))
            .await;
        service.dispatcher().dispatch(
            EVENT_PACKAGE_PUBLISHED,
            serde_json::json!({
                "package": info.name,
                "version": info.version_raw,
                "sha256": sha256,
                "published_at": outcome.version.published_at,
            }),
        );
    }

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(
            header::LOCATION,
            format!(
                "{base}/api/packages/versions/newUploadFinish?upload_id={id}",
                base = service.config().base_url,
                id = session.id
            ),
        )
        .body(Body::empty())
        .map_err(ApiError::internal)
}

/// Streams the `file` multipart field into memory, bounded by `max_bytes`.
async fn read_archive(mut multipart: Multipart, max_bytes: u64) -> Result<Vec<u8>, ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let mut data = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?
        {
            if (data.len() + chunk.len()) as u64 > max_bytes {
                return Err(ApiError::new(
                    repub_api::error::ErrorCode::PayloadTooLarge,
                    format!("archive exceeds the maximum size of {max_bytes} bytes"),
                ));
            }
            data.extend_from_slice(&chunk);
        }
        return Ok(data);
    }

    Err(ApiError::bad_request(
        "the multipart field `file` is required",
    ))
}

#[derive(Deserialize)]
pub struct FinishParams {
    upload_id: String,
}

pub async fn finish(
    State(service): State<RegistryService>,
    Query(params): Query<FinishParams>,
) -> Result<Json<SuccessEnvelope>, ApiError> {
    let session = service
        .store()
        .get_upload_session(&params.upload_id)
        .await?
        .ok_or_else(|| ApiError::not_found("upload session was not found"))?;

    match session.state {
        SessionState::Completed => Ok(Json(SuccessEnvelope::new(
            "the package version has been published",
        ))),
        SessionState::Expired => Err(ApiError::upload_expired()),
        SessionState::Open if session.expires_at < Utc::now() => Err(ApiError::upload_expired()),
        SessionState::Open => Err(ApiError::bad_request(
            "the upload for this session has not completed",
        )),
    }
}
