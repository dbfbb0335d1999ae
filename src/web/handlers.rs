//! HTTP request handlers.

use super::AppState;
use crate::db::{SiteFilter, UptimeSummary};
use crate::registry::RegistryError;
use crate::scheduler::Trigger;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header carrying the caller's user ID.
pub const USER_HEADER: &str = "x-user-id";

const MAX_UPTIME_HOURS: u32 = 24 * 30;
const MAX_LIMIT: u32 = 500;

// ============================================================================
// Errors and identity
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid X-User-Id header")]
    Unauthenticated,
    #[error("unknown trigger: {0}")]
    UnknownTrigger(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::UnknownTrigger(_) => "not_found",
            ApiError::Registry(e) => e.code(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.code() {
            "unauthenticated" => StatusCode::UNAUTHORIZED,
            "missing_url" | "invalid_url" | "missing_key" => StatusCode::BAD_REQUEST,
            "site_exists" | "server_exists" => StatusCode::CONFLICT,
            "not_found" => StatusCode::NOT_FOUND,
            "site_limit_reached" => StatusCode::FORBIDDEN,
            "invalid_key" | "auth_failed" | "forbidden" | "verification_failed" => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            "connection_failed" | "api_error" | "invalid_response" | "pagespeed_error" => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<crate::db::DbError> for ApiError {
    fn from(e: crate::db::DbError) -> Self {
        ApiError::Registry(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("API error: {}", self);
        }

        let body = serde_json::json!({
            "code": self.code(),
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The calling user, from the `X-User-Id` header.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(CurrentUser)
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

impl LimitQuery {
    fn get(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, MAX_LIMIT)
    }
}

// ============================================================================
// API: Sites
// ============================================================================

pub async fn handle_list_sites(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(filter): Query<SiteFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sites.get_all(user, &filter)?))
}

#[derive(Debug, Deserialize)]
pub struct CreateSiteRequest {
    #[serde(default)]
    pub site_url: String,
    #[serde(default)]
    pub site_key: String,
    #[serde(default)]
    pub site_name: Option<String>,
}

pub async fn handle_create_site(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateSiteRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state
        .sites
        .add(user, &req.site_url, &req.site_key, req.site_name.as_deref())
        .await?;
    let site = state.sites.get(user, id)?;
    Ok((StatusCode::CREATED, Json(site)))
}

pub async fn handle_site_quota(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sites.quota_usage(user)?))
}

pub async fn handle_get_site(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sites.get(user, id)?))
}

pub async fn handle_delete_site(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.sites.disconnect(user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run uptime and health checks for one site now.
pub async fn handle_check_site(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let site = state.sites.get(user, id)?;
    let uptime = state.scheduler.health().check_site_uptime(&site).await?;
    let health = state.scheduler.health().check_site_health(&site).await?;
    Ok(Json(serde_json::json!({
        "health": health,
        "uptime": uptime,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UptimeQuery {
    #[serde(default)]
    pub hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct UptimeResponse<T: Serialize> {
    pub hours: u32,
    pub summary: UptimeSummary,
    pub checks: Vec<T>,
}

pub async fn handle_site_uptime(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Query(query): Query<UptimeQuery>,
) -> ApiResult<impl IntoResponse> {
    let site = state.sites.get(user, id)?;
    let hours = query.hours.unwrap_or(24).clamp(1, MAX_UPTIME_HOURS);
    let since = Utc::now() - ChronoDuration::hours(i64::from(hours));

    Ok(Json(UptimeResponse {
        hours,
        summary: state.store.uptime_summary(site.id, since)?,
        checks: state.store.uptime_history(site.id, since)?,
    }))
}

pub async fn handle_site_health_log(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let site = state.sites.get(user, id)?;
    Ok(Json(state.store.health_log(site.id, query.get(50))?))
}

pub async fn handle_site_webvitals(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let site = state.sites.get(user, id)?;
    Ok(Json(state.store.webvitals_history(site.id, query.get(30))?))
}

#[derive(Debug, Serialize)]
pub struct AnalyticsDay {
    pub day: NaiveDate,
    pub data: serde_json::Value,
}

pub async fn handle_site_analytics(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let site = state.sites.get(user, id)?;
    let days: Vec<AnalyticsDay> = state
        .store
        .analytics_days(site.id)?
        .into_iter()
        .map(|(day, data)| AnalyticsDay { day, data })
        .collect();
    Ok(Json(days))
}

pub async fn handle_run_webvitals(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let site = state.sites.get(user, id)?;
    Ok(Json(state.scheduler.vitals().check_site(&site).await?))
}

// ============================================================================
// API: Plesk servers
// ============================================================================

pub async fn handle_list_servers(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.servers.get_all(user)?))
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn handle_create_server(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateServerRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state
        .servers
        .add(user, &req.host, req.port, &req.api_key, req.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(state.servers.get(user, id)?)))
}

pub async fn handle_get_server(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.servers.get(user, id)?))
}

pub async fn handle_delete_server(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.servers.remove(user, id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_check_server(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let server = state.servers.get(user, id)?;
    Ok(Json(state.scheduler.servers().check_server(&server).await?))
}

pub async fn handle_server_history(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let server = state.servers.get(user, id)?;
    Ok(Json(state.store.plesk_history(server.id, query.get(50))?))
}

// ============================================================================
// API: Accounts
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: Option<i64>,
    pub members: Vec<i64>,
}

fn account_response(state: &AppState, user: i64) -> ApiResult<AccountResponse> {
    Ok(AccountResponse {
        id: state.store.account_for_user(user)?,
        members: state.store.account_user_ids(user)?,
    })
}

pub async fn handle_get_account(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(account_response(&state, user)?))
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_email: Option<String>,
}

/// Create an account with the caller as its first member.
pub async fn handle_create_account(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<impl IntoResponse> {
    let owner_email = req.owner_email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    let id = state.store.create_account(req.name.trim(), owner_email)?;
    state.store.add_account_member(id, user)?;
    tracing::info!("User {} created account {}", user, id);
    Ok((StatusCode::CREATED, Json(account_response(&state, user)?)))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
}

pub async fn handle_add_account_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<impl IntoResponse> {
    let account = state
        .store
        .account_for_user(user)?
        .ok_or(ApiError::Registry(RegistryError::NotFound))?;
    state.store.add_account_member(account, req.user_id)?;
    Ok(Json(account_response(&state, user)?))
}

// ============================================================================
// API: Triggers
// ============================================================================

pub async fn handle_run_trigger(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let trigger = Trigger::parse(&name).ok_or(ApiError::UnknownTrigger(name))?;
    tracing::info!("User {} triggered {}", user, trigger.name());
    let outcome = state.scheduler.run_trigger(trigger).await;
    Ok(Json(serde_json::json!({
        "trigger": trigger.name(),
        "result": outcome,
    })))
}
