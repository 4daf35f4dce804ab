//! HTTP request handlers.

use super::{ApiError, ApiJson, AppState, TenantId};
use crate::db::{Endpoint, Granularity, HealthCheckResult, Outage, UptimeSummary};
use crate::registry::{EndpointPatch, NewEndpoint};
use crate::scheduler::LiveUptime;
use crate::status_page::{current_status, DisplayStatus, NewStatusPage, PageView, UnlockGrant};
use crate::telemetry::CorrelationResult;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_OUTAGE_LIMIT: u32 = 100;
const MAX_OUTAGE_LIMIT: u32 = 1000;
const MAX_LIVE_HOURS: u32 = 24 * 90;
const MAX_ROOT_CAUSE_LEN: usize = 4000;

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// API: Endpoints
// ============================================================================

pub async fn handle_list_endpoints(State(state): State<AppState>, TenantId(tenant): TenantId) -> ApiResult<Json<Vec<Endpoint>>> {
    Ok(Json(state.registry.list(&tenant)?))
}

pub async fn handle_create_endpoint(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    ApiJson(req): ApiJson<NewEndpoint>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state.registry.create(&tenant, req)?;
    state.scheduler.add_endpoint(endpoint.clone()).await;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

pub async fn handle_get_endpoint(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
) -> ApiResult<Json<Endpoint>> {
    Ok(Json(state.registry.get(&tenant, id)?))
}

pub async fn handle_update_endpoint(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
    ApiJson(patch): ApiJson<EndpointPatch>,
) -> ApiResult<Json<Endpoint>> {
    let updated = state.registry.update(&tenant, id, patch)?;
    // Restart the loop so a new interval or URL takes effect.
    state.scheduler.reschedule(updated.clone()).await;
    Ok(Json(updated))
}

pub async fn handle_deactivate_endpoint(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
) -> ApiResult<Json<Endpoint>> {
    let endpoint = state.registry.deactivate(&tenant, id)?;
    state.scheduler.remove_endpoint(id).await;
    Ok(Json(endpoint))
}

pub async fn handle_delete_endpoint(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let endpoint = state.registry.get(&tenant, id)?;
    // Stop and drain the recorder before the rows go away.
    state.scheduler.remove_endpoint(id).await;
    if let Err(e) = state.registry.delete(&tenant, id) {
        state.scheduler.add_endpoint(endpoint).await;
        return Err(e.into());
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// API: Monitors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MonitorStatus {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub status: DisplayStatus,
    pub last_check: Option<HealthCheckResult>,
    pub ongoing_outage: Option<Outage>,
    pub uptime_24h: f64,
}

pub async fn handle_list_monitors(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
) -> ApiResult<Json<Vec<MonitorStatus>>> {
    let now = Utc::now();
    let endpoints = state.registry.list(&tenant)?;
    let mut monitors = Vec::with_capacity(endpoints.len());

    for endpoint in endpoints {
        let last_check = state.store.recent_health_checks(&tenant, endpoint.id, 1)?.pop();
        let ongoing_outage = state.store.ongoing_outage(&tenant, endpoint.id)?;
        let uptime = state.aggregator.uptime_over(&tenant, endpoint.id, 24, now)?;
        let status = if endpoint.is_active {
            current_status(last_check.as_ref(), ongoing_outage.is_some())
        } else {
            DisplayStatus::Unknown
        };
        monitors.push(MonitorStatus {
            endpoint,
            status,
            last_check,
            ongoing_outage,
            uptime_24h: uptime.uptime_percentage,
        });
    }

    Ok(Json(monitors))
}

// ============================================================================
// API: Outages
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OutagesQuery {
    pub limit: Option<u32>,
}

impl OutagesQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_OUTAGE_LIMIT).clamp(1, MAX_OUTAGE_LIMIT)
    }
}

pub async fn handle_list_outages(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Query(query): Query<OutagesQuery>,
) -> ApiResult<Json<Vec<Outage>>> {
    Ok(Json(state.store.list_outages(&tenant, None, query.limit())?))
}

pub async fn handle_endpoint_outages(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
    Query(query): Query<OutagesQuery>,
) -> ApiResult<Json<Vec<Outage>>> {
    state.registry.get(&tenant, id)?;
    Ok(Json(state.store.list_outages(&tenant, Some(id), query.limit())?))
}

#[derive(Debug, Deserialize)]
pub struct RootCauseRequest {
    pub root_cause: String,
}

pub async fn handle_annotate_outage(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<RootCauseRequest>,
) -> ApiResult<Json<Outage>> {
    let root_cause = req.root_cause.trim();
    if root_cause.is_empty() || root_cause.chars().count() > MAX_ROOT_CAUSE_LEN {
        return Err(ApiError::bad_request(format!(
            "root_cause must be 1-{} characters",
            MAX_ROOT_CAUSE_LEN
        )));
    }
    Ok(Json(state.store.annotate_outage(&tenant, id, root_cause)?))
}

// ============================================================================
// API: Uptime
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UptimeQuery {
    #[serde(default)]
    pub granularity: Option<Granularity>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

fn default_span(granularity: Granularity) -> ChronoDuration {
    match granularity {
        Granularity::Hourly => ChronoDuration::hours(48),
        Granularity::Daily => ChronoDuration::days(30),
        Granularity::Monthly => ChronoDuration::days(365),
    }
}

pub async fn handle_uptime_summaries(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
    Query(query): Query<UptimeQuery>,
) -> ApiResult<Json<Vec<UptimeSummary>>> {
    let granularity = query.granularity.unwrap_or(Granularity::Hourly);
    let end = query.end.unwrap_or_else(Utc::now);
    let start = query.start.unwrap_or(end - default_span(granularity));
    if start >= end {
        return Err(ApiError::bad_request("start must be before end"));
    }

    state.registry.get(&tenant, id)?;
    Ok(Json(state.store.get_summaries(&tenant, id, granularity, start, end)?))
}

#[derive(Debug, Deserialize)]
pub struct LiveUptimeQuery {
    pub hours: Option<u32>,
}

pub async fn handle_live_uptime(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<i64>,
    Query(query): Query<LiveUptimeQuery>,
) -> ApiResult<Json<LiveUptime>> {
    let hours = query.hours.unwrap_or(24);
    if !(1..=MAX_LIVE_HOURS).contains(&hours) {
        return Err(ApiError::bad_request(format!("hours must be 1-{}", MAX_LIVE_HOURS)));
    }

    state.registry.get(&tenant, id)?;
    Ok(Json(state.aggregator.uptime_over(&tenant, id, hours, Utc::now())?))
}

// ============================================================================
// API: Status pages
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusPageSummary {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub is_public: bool,
    pub endpoint_ids: Vec<i64>,
}

impl From<crate::db::StatusPage> for StatusPageSummary {
    fn from(page: crate::db::StatusPage) -> Self {
        Self {
            slug: page.slug,
            title: page.title,
            description: page.description,
            is_public: page.is_public,
            endpoint_ids: page.endpoint_ids,
        }
    }
}

pub async fn handle_list_status_pages(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
) -> ApiResult<Json<Vec<StatusPageSummary>>> {
    let pages = state.status_pages.list(&tenant)?;
    Ok(Json(pages.into_iter().map(StatusPageSummary::from).collect()))
}

pub async fn handle_create_status_page(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    ApiJson(req): ApiJson<NewStatusPage>,
) -> ApiResult<impl IntoResponse> {
    let page = state.status_pages.create(&tenant, req)?;
    Ok((StatusCode::CREATED, Json(StatusPageSummary::from(page))))
}

pub async fn handle_delete_status_page(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(slug): Path<String>,
) -> ApiResult<StatusCode> {
    state.status_pages.delete(&tenant, &slug).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PublicStatusQuery {
    pub token: Option<String>,
}

/// Unlock token from `Authorization: Bearer` or `?token=`.
fn unlock_token(headers: &HeaderMap, query: &PublicStatusQuery) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .or_else(|| query.token.clone())
        .filter(|t| !t.is_empty())
}

pub async fn handle_public_status(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<PublicStatusQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<PageView>> {
    let token = unlock_token(&headers, &query);
    Ok(Json(state.status_pages.view(&slug, token.as_deref(), Utc::now()).await?))
}

#[derive(Debug, Deserialize)]
pub struct UnlockRequest {
    pub password: String,
}

pub async fn handle_unlock_status_page(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    ApiJson(req): ApiJson<UnlockRequest>,
) -> ApiResult<Json<UnlockGrant>> {
    Ok(Json(state.status_pages.unlock(&slug, &req.password).await?))
}

// ============================================================================
// API: Traces
// ============================================================================

pub async fn handle_correlate_trace(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(trace_id): Path<String>,
) -> ApiResult<Json<CorrelationResult>> {
    Ok(Json(state.correlator.correlate(&trace_id, &tenant).await?))
}

// ============================================================================
// Service health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping() {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "endpoints_scheduled": state.scheduler.scheduled_count().await,
            })),
        ),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unavailable" })))
        }
    }
}
