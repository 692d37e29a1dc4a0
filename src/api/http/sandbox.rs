//! Sandbox HTTP handlers

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::api::http::{auth, respond};
use crate::domain::client::ApiClient;
use crate::domain::sandbox::{CreateOptions, ListFilters, SandboxStatus};
use crate::service::sandbox::SandboxManager;
use crate::{AppState, Error, Result};

/// Create sandbox request; `ttl` is in nanoseconds
#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub user_id: String,
    pub ttl: Option<i64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Extend TTL request
#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub duration_ns: i64,
}

/// List query parameters
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<String>,
    pub template_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Logs query parameters
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Json(req): Json<CreateSandboxRequest>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sandboxes:write")?;

    if req.template_id.is_empty() {
        return Err(Error::Validation("template_id is required".to_string()));
    }
    if req.user_id.is_empty() {
        return Err(Error::Validation("user_id is required".to_string()));
    }
    let ttl = match req.ttl {
        Some(ns) if ns > 0 => Some(Duration::from_nanos(ns as u64)),
        Some(_) => return Err(Error::Validation("ttl must be positive".to_string())),
        None => None,
    };

    let sandbox = state
        .manager
        .create(
            &req.template_id,
            &req.user_id,
            CreateOptions {
                ttl,
                env: req.env,
                metadata: req.metadata,
            },
        )
        .await?;

    Ok(respond(StatusCode::CREATED, sandbox))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sandboxes:read")?;

    let sandbox = state.manager.get(&id).await?;
    Ok(respond(StatusCode::OK, sandbox))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sandboxes:read")?;

    let status = query
        .status
        .as_deref()
        .map(|s| {
            SandboxStatus::parse(s)
                .ok_or_else(|| Error::Validation(format!("invalid status filter: {s}")))
        })
        .transpose()?;

    let filters = ListFilters {
        user_id: query.user_id,
        template_id: query.template_id,
        status,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    };

    let sandboxes = state.manager.list(&filters).await?;
    let total = sandboxes.len();
    Ok(respond(
        StatusCode::OK,
        json!({ "sandboxes": sandboxes, "total": total }),
    ))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sandboxes:write")?;

    state.manager.delete(&id).await?;
    Ok(respond(
        StatusCode::OK,
        json!({ "message": "sandbox deleted" }),
    ))
}

pub async fn stop(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sandboxes:write")?;

    state.manager.stop(&id).await?;
    Ok(respond(
        StatusCode::OK,
        json!({ "message": "sandbox stopped" }),
    ))
}

pub async fn extend(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sandboxes:write")?;

    if req.duration_ns <= 0 {
        return Err(Error::Validation("duration must be positive".to_string()));
    }

    state
        .manager
        .extend_ttl(&id, Duration::from_nanos(req.duration_ns as u64))
        .await?;

    let sandbox = state.manager.get(&id).await?;
    Ok(respond(StatusCode::OK, sandbox))
}

pub async fn logs(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sandboxes:read")?;

    let tail = query.tail.filter(|t| *t > 0).unwrap_or(100);
    let logs = state.manager.logs(&id, tail).await?;
    Ok(respond(StatusCode::OK, json!({ "logs": logs })))
}
