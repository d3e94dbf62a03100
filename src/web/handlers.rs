//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, Target};
use crate::probe::ProtocolKind;
use crate::scheduler::MonitorError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;

/// Longest history window a request may ask for.
const MAX_HISTORY_HOURS: i64 = 24 * 366;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_kind(raw: &str) -> Result<ProtocolKind, Response> {
    raw.parse::<ProtocolKind>()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> Response {
    match state.store.get_target_statuses() {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<TargetRequest>,
) -> Response {
    let (Some(name), Some(address), Some(kind)) =
        (non_empty(req.name), non_empty(req.address), non_empty(req.kind))
    else {
        return error_response(StatusCode::BAD_REQUEST, "Name, address, and kind are required");
    };
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let mut target = Target {
        name,
        address,
        kind,
        is_active: req.is_active.unwrap_or(true),
        ..Default::default()
    };

    match state.store.add_target(&mut target) {
        Ok(_) => (StatusCode::CREATED, Json(target)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<TargetRequest>,
) -> Response {
    let existing = match state.store.get_target(id) {
        Ok(t) => t,
        Err(DbError::NotFound) => return error_response(StatusCode::NOT_FOUND, "Target not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let kind = match non_empty(req.kind) {
        Some(raw) => match parse_kind(&raw) {
            Ok(k) => k,
            Err(resp) => return resp,
        },
        None => existing.kind,
    };

    let updated = Target {
        name: non_empty(req.name).unwrap_or(existing.name),
        address: non_empty(req.address).unwrap_or(existing.address),
        kind,
        is_active: req.is_active.unwrap_or(existing.is_active),
        ..existing
    };

    match state.store.update_target(&updated) {
        Ok(_) => Json(updated).into_response(),
        Err(DbError::NotFound) => error_response(StatusCode::NOT_FOUND, "Target not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    match state.store.delete_target(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// API: Monitoring
// ============================================================================

pub async fn handle_run_all(State(state): State<AppState>) -> Response {
    match state.scheduler.run_now().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!("Bulk run failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to run monitoring")
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleCheckRequest {
    #[serde(default)]
    pub target_id: Option<i64>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Check one target now. Address and kind default to the registered target.
pub async fn handle_run_single(
    State(state): State<AppState>,
    Json(req): Json<SingleCheckRequest>,
) -> Response {
    let Some(target_id) = req.target_id else {
        return error_response(StatusCode::BAD_REQUEST, "Target ID is required");
    };
    let registered = match state.store.get_target(target_id) {
        Ok(t) => Some(t),
        Err(DbError::NotFound) => None,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let kind = match non_empty(req.kind) {
        Some(raw) => match parse_kind(&raw) {
            Ok(k) => Some(k),
            Err(resp) => return resp,
        },
        None => registered.as_ref().map(|t| t.kind),
    };
    let address = non_empty(req.address).or_else(|| registered.as_ref().map(|t| t.address.clone()));

    let (Some(address), Some(kind)) = (address, kind) else {
        return error_response(StatusCode::BAD_REQUEST, "Target ID, address, and kind are required");
    };

    let target = Target {
        id: target_id,
        address,
        kind,
        ..registered.unwrap_or_default()
    };

    match state.scheduler.monitor().run_one(&target).await {
        Ok(result) => Json(result).into_response(),
        Err(MonitorError::InvalidTarget { reason, .. }) => error_response(StatusCode::BAD_REQUEST, reason),
        Err(e) => {
            tracing::error!("Single check for target {} failed: {}", target_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to monitor target")
        }
    }
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub hours: Option<i64>,
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state.store.get_target(id) {
        Ok(_) => {}
        Err(DbError::NotFound) => return error_response(StatusCode::NOT_FOUND, "Target not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let hours = query
        .hours
        .filter(|h| *h > 0)
        .unwrap_or(state.config.history_hours)
        .min(MAX_HISTORY_HOURS);
    let until = Utc::now();
    let since = until - ChronoDuration::hours(hours);

    match state.store.get_checks(id, since, until) {
        Ok(checks) => Json(checks).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
