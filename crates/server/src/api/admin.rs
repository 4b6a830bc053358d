//! The admin API consumed by external consoles.
//!
//! Everything here requires the `admin` scope, except token management which
//! also allows authenticated users to manage their own tokens.

use std::collections::HashSet;

use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;

use repub_api::admin::{
    ActivityEntry, AdminUserSummary, BlobGcResponse, CacheClearResponse, ConfigEntry,
    CreateAdminUserRequest, CreateTokenRequest, CreateTokenResponse, CreateUserRequest,
    CreateWebhookRequest, DeliverySummary, DiscontinueRequest, PackageDetail, PackageList,
    PackageSummary, Pagination, RetractRequest, StatsResponse, StorageConfigPair, TokenSummary,
    UserList, UserSummary, VersionSummary, WebhookSummary,
};

use crate::blobstore::{CACHED_PREFIX, HOSTED_PREFIX};
use crate::config::site;
use crate::datastore::{
    Activity, AdminUser, AuthToken, NewWebhook, Package, PackagePage, User, Webhook,
    WebhookDelivery,
};
use crate::services::RegistryService;
use crate::storage_config;
use crate::token::{Access, Scope};
use crate::webhook::{
    EVENT_PACKAGE_DELETED, EVENT_PACKAGE_RETRACTED, EVENT_USER_CREATED, EVENT_WEBHOOK_TEST,
};

use super::auth::Caller;
use super::{ApiError, Json, Path, Query};

// ── mapping helpers ────────────────────────────────────────────────────

fn package_summary(package: Package, version_count: u64, download_count: u64) -> PackageSummary {
    PackageSummary {
        name: package.name,
        description: package.description,
        is_discontinued: package.is_discontinued,
        replaced_by: package.replaced_by,
        is_upstream_cache: package.is_upstream_cache,
        latest: package.latest_version,
        version_count,
        download_count,
        created_at: package.created_at,
        updated_at: package.updated_at,
    }
}

pub(crate) fn package_list(page: PackagePage, page_no: u32, limit: u32) -> PackageList {
    PackageList {
        pagination: Pagination::new(page.total, page_no, limit),
        packages: page
            .packages
            .into_iter()
            .map(|p| package_summary(p.package, p.version_count, p.download_count))
            .collect(),
    }
}

fn user_summary(user: User) -> UserSummary {
    UserSummary {
        id: user.id,
        email: user.email,
        is_active: user.is_active,
        created_at: user.created_at,
        last_login_at: user.last_login_at,
    }
}

fn admin_user_summary(user: AdminUser) -> AdminUserSummary {
    AdminUserSummary {
        id: user.id,
        username: user.username,
        must_change_password: user.must_change_password,
        login_count: user.login_count,
        created_at: user.created_at,
        last_login_at: user.last_login_at,
    }
}

fn token_summary(token: AuthToken) -> TokenSummary {
    TokenSummary {
        id: token.id,
        user_id: token.user_id,
        label: token.label,
        scopes: token.scopes,
        created_at: token.created_at,
        expires_at: token.expires_at,
        last_used_at: token.last_used_at,
    }
}

fn webhook_summary(webhook: Webhook) -> WebhookSummary {
    WebhookSummary {
        id: webhook.id,
        url: webhook.url,
        events: webhook.events,
        has_secret: webhook.secret.is_some(),
        is_active: webhook.is_active,
        failure_count: webhook.failure_count,
        last_triggered_at: webhook.last_triggered_at,
    }
}

fn delivery_summary(delivery: WebhookDelivery) -> DeliverySummary {
    DeliverySummary {
        id: delivery.id,
        event_type: delivery.event_type,
        delivered_at: delivery.delivered_at,
        status_code: delivery.status_code,
        duration_ms: delivery.duration_ms,
        error: delivery.error,
        success: delivery.success,
    }
}

fn activity_entry(activity: Activity) -> ActivityEntry {
    ActivityEntry {
        id: activity.id,
        activity_type: activity.activity_type,
        actor_type: activity.actor_type.as_str().to_string(),
        actor_id: activity.actor_id,
        actor_email: activity.actor_email,
        target_type: activity.target_type,
        target_id: activity.target_id,
        metadata: activity.metadata,
        created_at: activity.created_at,
    }
}

fn hash_password(plain: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(ApiError::internal)
}

#[derive(Deserialize)]
pub struct PageParams {
    page: Option<u32>,
    limit: Option<u32>,
    #[serde(default)]
    q: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn page_and_limit(params: &PageParams) -> (u32, u32) {
    (
        params.page.unwrap_or(1).max(1),
        params.limit.unwrap_or(20).clamp(1, 100),
    )
}

// ── stats & activity ───────────────────────────────────────────────────

pub async fn stats(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<StatsResponse>, ApiError> {
    caller.require_admin()?;
    let stats = service.store().stats().await?;
    Ok(Json(StatsResponse {
        hosted_packages: stats.hosted_packages,
        cached_packages: stats.cached_packages,
        package_versions: stats.package_versions,
        users: stats.users,
        webhooks: stats.webhooks,
        total_downloads: stats.total_downloads,
    }))
}

#[derive(Deserialize)]
pub struct ActivityParams {
    limit: Option<u32>,
    before: Option<DateTime<Utc>>,
}

pub async fn activity(
    State(service): State<RegistryService>,
    Query(params): Query<ActivityParams>,
    caller: Caller,
) -> Result<Json<Vec<ActivityEntry>>, ApiError> {
    caller.require_admin()?;
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let entries = service
        .store()
        .recent_activity(limit, params.before)
        .await?;
    Ok(Json(entries.into_iter().map(activity_entry).collect()))
}

// ── packages ───────────────────────────────────────────────────────────

pub async fn list_packages(
    State(service): State<RegistryService>,
    Query(params): Query<PageParams>,
    caller: Caller,
) -> Result<Json<PackageList>, ApiError> {
    caller.require_admin()?;
    let (page, limit) = page_and_limit(&params);

    let result = match (&params.q, params.kind.as_deref()) {
        (Some(q), _) if !q.is_empty() => service.store().search_packages(q, page, limit).await?,
        (_, Some("hosted")) => {
            service
                .store()
                .list_packages_by_type(false, page, limit)
                .await?
        }
        (_, Some("cached")) => {
            service
                .store()
                .list_packages_by_type(true, page, limit)
                .await?
        }
        (_, Some(other)) => {
            return Err(ApiError::bad_request(format!(
                "unknown package type `{other}`; expected `hosted` or `cached`"
            )))
        }
        _ => service.store().list_packages(page, limit).await?,
    };

    Ok(Json(package_list(result, page, limit)))
}

pub async fn package_detail(
    State(service): State<RegistryService>,
    Path(name): Path<String>,
    caller: Caller,
) -> Result<Json<PackageDetail>, ApiError> {
    caller.require_admin()?;
    let package = service
        .store()
        .get_package(&name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("package `{name}` was not found")))?;
    let versions = service.store().get_package_versions(&name).await?;

    let download_count = versions.iter().map(|v| v.download_count).sum();
    Ok(Json(PackageDetail {
        package: package_summary(package, versions.len() as u64, download_count),
        versions: versions
            .into_iter()
            .map(|v| VersionSummary {
                version: v.version,
                archive_sha256: v.archive_sha256,
                published_at: v.published_at,
                is_retracted: v.is_retracted,
                retraction_message: v.retraction_message,
                download_count: v.download_count,
            })
            .collect(),
    }))
}

pub async fn delete_package(
    State(service): State<RegistryService>,
    Path(name): Path<String>,
    caller: Caller,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    let versions_deleted = service.store().delete_package(&name).await?;

    service
        .log_activity(caller.activity("package_deleted", "package", name.as_str()))
        .await;
    service.dispatcher().dispatch(
        EVENT_PACKAGE_DELETED,
        serde_json::json!({ "package": name }),
    );

    Ok(Json(
        serde_json::json!({ "versions_deleted": versions_deleted }),
    ))
}

pub async fn discontinue(
    State(service): State<RegistryService>,
    Path(name): Path<String>,
    caller: Caller,
    Json(request): Json<DiscontinueRequest>,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    service
        .store()
        .discontinue_package(&name, request.replaced_by.as_deref())
        .await?;
    service
        .log_activity(caller.activity("package_discontinued", "package", name.as_str()))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retract(
    State(service): State<RegistryService>,
    Path((name, version)): Path<(String, String)>,
    caller: Caller,
    Json(request): Json<RetractRequest>,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    service
        .store()
        .retract_version(&name, &version, request.message.as_deref())
        .await?;
    service.recompute_denorm(&name).await?;

    service
        .log_activity(caller.activity(
            "package_retracted",
            "package_version",
            format!("{name}@{version}"),
        ))
        .await;
    service.dispatcher().dispatch(
        EVENT_PACKAGE_RETRACTED,
        serde_json::json!({ "package": name, "version": version }),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unretract(
    State(service): State<RegistryService>,
    Path((name, version)): Path<(String, String)>,
    caller: Caller,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    service.store().unretract_version(&name, &version).await?;
    service.recompute_denorm(&name).await?;
    service
        .log_activity(caller.activity(
            "package_unretracted",
            "package_version",
            format!("{name}@{version}"),
        ))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── users ──────────────────────────────────────────────────────────────

pub async fn list_users(
    State(service): State<RegistryService>,
    Query(params): Query<PageParams>,
    caller: Caller,
) -> Result<Json<UserList>, ApiError> {
    caller.require_admin()?;
    let (page, limit) = page_and_limit(&params);
    let (users, total) = service.store().list_users(page, limit).await?;
    Ok(Json(UserList {
        users: users.into_iter().map(user_summary).collect(),
        pagination: Pagination::new(total, page, limit),
    }))
}

pub async fn create_user(
    State(service): State<RegistryService>,
    caller: Caller,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserSummary>), ApiError> {
    caller.require_admin()?;
    if request.email.trim().is_empty() || !request.email.contains('@') {
        return Err(ApiError::bad_request("a valid email address is required"));
    }
    if request.password.len() < 8 {
        return Err(ApiError::bad_request(
            "passwords must be at least 8 characters",
        ));
    }

    let hash = hash_password(&request.password)?;
    let user = service.store().create_user(&request.email, &hash).await?;

    service
        .log_activity(caller.activity("user_created", "user", user.id.to_string()))
        .await;
    service.dispatcher().dispatch(
        EVENT_USER_CREATED,
        serde_json::json!({ "email": user.email }),
    );

    Ok((StatusCode::CREATED, Json(user_summary(user))))
}

pub async fn delete_user(
    State(service): State<RegistryService>,
    Path(id): Path<i64>,
    caller: Caller,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    if !service.store().delete_user(id).await? {
        return Err(ApiError::not_found(format!("user {id} was not found")));
    }
    service
        .log_activity(caller.activity("user_deleted", "user", id.to_string()))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── admin users ────────────────────────────────────────────────────────

pub async fn list_admin_users(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<Vec<AdminUserSummary>>, ApiError> {
    caller.require_admin()?;
    let users = service.store().list_admin_users().await?;
    Ok(Json(users.into_iter().map(admin_user_summary).collect()))
}

pub async fn create_admin_user(
    State(service): State<RegistryService>,
    caller: Caller,
    Json(request): Json<CreateAdminUserRequest>,
) -> Result<(StatusCode, Json<AdminUserSummary>), ApiError> {
    caller.require_admin()?;
    if request.username.trim().is_empty() {
        return Err(ApiError::bad_request("a username is required"));
    }
    if request.password.len() < 8 {
        return Err(ApiError::bad_request(
            "passwords must be at least 8 characters",
        ));
    }

    let hash = hash_password(&request.password)?;
    let user = service
        .store()
        .create_admin_user(&request.username, &hash, request.must_change_password)
        .await?;
    service
        .log_activity(caller.activity("admin_user_created", "admin_user", user.id.to_string()))
        .await;
    Ok((StatusCode::CREATED, Json(admin_user_summary(user))))
}

pub async fn delete_admin_user(
    State(service): State<RegistryService>,
    Path(id): Path<i64>,
    caller: Caller,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    if !service.store().delete_admin_user(id).await? {
        return Err(ApiError::not_found(format!(
            "admin user {id} was not found"
        )));
    }
    service
        .log_activity(caller.activity("admin_user_deleted", "admin_user", id.to_string()))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── tokens ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TokenListParams {
    user_id: Option<i64>,
}

pub async fn list_tokens(
    State(service): State<RegistryService>,
    Query(params): Query<TokenListParams>,
    caller: Caller,
) -> Result<Json<Vec<TokenSummary>>, ApiError> {
    let (user, _) = caller.require_authenticated()?;
    let filter = if caller.can(&Access::Admin) {
        params.user_id
    } else {
        // Self-service callers only ever see their own tokens.
        Some(user.id)
    };
    let tokens = service.store().list_tokens(filter).await?;
    Ok(Json(tokens.into_iter().map(token_summary).collect()))
}

pub async fn create_token(
    State(service): State<RegistryService>,
    caller: Caller,
    Json(request): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), ApiError> {
    let (user, token) = caller.require_authenticated()?;
    let is_admin = caller.can(&Access::Admin);

    let target_user = match request.user_id {
        Some(id) if id != user.id => {
            if !is_admin {
                return Err(ApiError::forbidden(
                    "only admins may create tokens for other users",
                ));
            }
            id
        }
        _ => user.id,
    };

    if !is_admin {
        // A token must not mint broader capabilities than it holds.
        let held: Vec<Scope> = token.scopes.iter().filter_map(|s| Scope::parse(s)).collect();
        for requested in &request.scopes {
            let scope = Scope::parse(requested)
                .ok_or_else(|| ApiError::bad_request(format!("invalid scope `{requested}`")))?;
            if !held.iter().any(|h| h.covers(&scope)) {
                return Err(ApiError::forbidden(format!(
                    "the caller's token does not cover scope `{requested}`"
                )));
            }
        }
    }

    let max_ttl_days = site::token_max_ttl_days(service.store().as_ref()).await;
    let (raw, created) = service
        .tokens()
        .create(
            target_user,
            &request.label,
            &request.scopes,
            request.expires_at,
            max_ttl_days,
        )
        .await?;

    service
        .log_activity(caller.activity("token_created", "token", created.id.to_string()))
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token: raw,
            summary: token_summary(created),
        }),
    ))
}

pub async fn delete_token(
    State(service): State<RegistryService>,
    Path(id): Path<i64>,
    caller: Caller,
) -> Result<StatusCode, ApiError> {
    let (user, _) = caller.require_authenticated()?;
    let token = service
        .store()
        .get_token(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("token {id} was not found")))?;
    if token.user_id != user.id && !caller.can(&Access::Admin) {
        return Err(ApiError::forbidden("tokens may only be deleted by their owner"));
    }

    service.store().delete_token(id).await?;
    service
        .log_activity(caller.activity("token_deleted", "token", id.to_string()))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── webhooks ───────────────────────────────────────────────────────────

pub async fn list_webhooks(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<Vec<WebhookSummary>>, ApiError> {
    caller.require_admin()?;
    let webhooks = service.store().list_webhooks(false).await?;
    Ok(Json(webhooks.into_iter().map(webhook_summary).collect()))
}

pub async fn create_webhook(
    State(service): State<RegistryService>,
    caller: Caller,
    Json(request): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<WebhookSummary>), ApiError> {
    caller.require_admin()?;

    let url = url::Url::parse(&request.url)
        .map_err(|e| ApiError::bad_request(format!("invalid webhook URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::bad_request(
            "webhook URLs must use http or https",
        ));
    }
    if request.events.is_empty() {
        return Err(ApiError::bad_request(
            "a webhook must subscribe to at least one event",
        ));
    }

    let webhook = service
        .store()
        .create_webhook(NewWebhook {
            url: request.url,
            events: request.events,
            secret: request.secret,
            is_active: request.is_active,
        })
        .await?;
    service
        .log_activity(caller.activity("webhook_created", "webhook", webhook.id.to_string()))
        .await;
    Ok((StatusCode::CREATED, Json(webhook_summary(webhook))))
}

pub async fn delete_webhook(
    State(service): State<RegistryService>,
    Path(id): Path<i64>,
    caller: Caller,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    if !service.store().delete_webhook(id).await? {
        return Err(ApiError::not_found(format!("webhook {id} was not found")));
    }
    service
        .log_activity(caller.activity("webhook_deleted", "webhook", id.to_string()))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn test_webhook(
    State(service): State<RegistryService>,
    Path(id): Path<i64>,
    caller: Caller,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    caller.require_admin()?;
    if service.store().get_webhook(id).await?.is_none() {
        return Err(ApiError::not_found(format!("webhook {id} was not found")));
    }

    service.dispatcher().dispatch_to(
        id,
        EVENT_WEBHOOK_TEST,
        serde_json::json!({
            "webhook_id": id,
            "triggered_at": Utc::now(),
        }),
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "queued" })),
    ))
}

#[derive(Deserialize)]
pub struct DeliveryParams {
    limit: Option<u32>,
}

pub async fn webhook_deliveries(
    State(service): State<RegistryService>,
    Path(id): Path<i64>,
    Query(params): Query<DeliveryParams>,
    caller: Caller,
) -> Result<Json<Vec<DeliverySummary>>, ApiError> {
    caller.require_admin()?;
    if service.store().get_webhook(id).await?.is_none() {
        return Err(ApiError::not_found(format!("webhook {id} was not found")));
    }
    let deliveries = service
        .store()
        .list_webhook_deliveries(id, params.limit.unwrap_or(50).clamp(1, 200))
        .await?;
    Ok(Json(deliveries.into_iter().map(delivery_summary).collect()))
}

// ── site & storage config ──────────────────────────────────────────────

pub async fn get_config(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<Vec<ConfigEntry>>, ApiError> {
    caller.require_admin()?;
    let entries = service.store().all_config().await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|(key, value)| ConfigEntry { key, value })
            .collect(),
    ))
}

pub async fn set_config(
    State(service): State<RegistryService>,
    caller: Caller,
    Json(entry): Json<ConfigEntry>,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    if site::ENV_ONLY_KEYS.contains(&entry.key.as_str()) {
        return Err(ApiError::bad_request(format!(
            "`{key}` is environment-only and cannot be set through the API",
            key = entry.key
        )));
    }
    service.store().set_config(&entry.key, &entry.value).await?;
    service
        .log_activity(caller.activity("config_updated", "site_config", entry.key))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_storage_config(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<StorageConfigPair>, ApiError> {
    caller.require_admin()?;
    let store = service.store().as_ref();
    let active = storage_config::read_slot(store, storage_config::SLOT_ACTIVE)
        .await?
        .ok_or_else(|| ApiError::internal("the active storage config is missing"))?;
    let pending = storage_config::read_slot(store, storage_config::SLOT_PENDING).await?;
    Ok(Json(StorageConfigPair { active, pending }))
}

pub async fn put_storage_config(
    State(service): State<RegistryService>,
    caller: Caller,
    Json(config): Json<storage_config::StorageBackendConfig>,
) -> Result<StatusCode, ApiError> {
    caller.require_admin()?;
    storage_config::write_pending(service.store().as_ref(), &config).await?;
    service
        .log_activity(caller.activity("storage_config_staged", "storage_config", "pending"))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── cache & blob maintenance ───────────────────────────────────────────

pub async fn clear_cache(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<CacheClearResponse>, ApiError> {
    caller.require_admin()?;

    let removed_packages = service.store().clear_cached_packages().await?;
    let mut removed_blobs = 0;
    for key in service.blobs().list_keys(CACHED_PREFIX).await? {
        service.blobs().delete(&key).await?;
        removed_blobs += 1;
    }

    service
        .log_activity(caller.activity("cache_cleared", "cache", "upstream"))
        .await;
    Ok(Json(CacheClearResponse {
        removed_packages,
        removed_blobs,
    }))
}

pub async fn gc_blobs(
    State(service): State<RegistryService>,
    caller: Caller,
) -> Result<Json<BlobGcResponse>, ApiError> {
    caller.require_admin()?;

    let referenced: HashSet<String> = service
        .store()
        .all_archive_keys()
        .await?
        .into_iter()
        .collect();

    let mut scanned = 0;
    let mut removed = 0;
    for prefix in [HOSTED_PREFIX, CACHED_PREFIX] {
        for key in service.blobs().list_keys(prefix).await? {
            scanned += 1;
            if !referenced.contains(&key) {
                service.blobs().delete(&key).await?;
                removed += 1;
            }
        }
    }

    service
        .log_activity(caller.activity("blobs_collected", "blob_store", "gc"))
        .await;
    Ok(Json(BlobGcResponse { scanned, removed }))
}
