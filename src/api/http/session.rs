//! Session HTTP handlers: admin management plus the public join flow

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::http::{auth, respond};
use crate::domain::client::ApiClient;
use crate::domain::session::{Session, SessionStatus};
use crate::service::sandbox::SandboxManager;
use crate::service::session::CreateSessionParams;
use crate::{AppState, Error, Result};

// --- Admin handlers (API key auth) ---

/// Create session request; `ttl` is in seconds
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub id: String,
    pub token: String,
    pub template_id: String,
    pub status: SessionStatus,
    pub join_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sessions:write")?;

    if req.template_id.is_empty() {
        return Err(Error::Validation("template_id is required".to_string()));
    }
    if req.ttl <= 0 {
        return Err(Error::Validation(
            "ttl must be positive (seconds)".to_string(),
        ));
    }

    let session = state
        .sessions
        .create(CreateSessionParams {
            template_id: req.template_id,
            ttl_seconds: req.ttl,
            env: req.env,
            metadata: req.metadata,
            created_by: Some(client.name.clone()),
        })
        .await?;

    Ok(respond(
        StatusCode::CREATED,
        CreateSessionResponse {
            join_url: join_url(&state, &session.token),
            id: session.id,
            token: session.token,
            template_id: session.template_id,
            status: session.status,
            created_at: session.created_at,
        },
    ))
}

fn join_url(state: &AppState, token: &str) -> String {
    let host = if state.config.server_host == "0.0.0.0" {
        "localhost"
    } else {
        &state.config.server_host
    };
    format!(
        "http://{host}:{}/api/v1/join/{token}",
        state.config.server_port
    )
}

pub async fn list(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sessions:read")?;

    let status = query
        .status
        .as_deref()
        .map(|s| {
            SessionStatus::parse(s)
                .ok_or_else(|| Error::Validation(format!("invalid status filter: {s}")))
        })
        .transpose()?;

    let sessions = state
        .sessions
        .list(status, query.limit.unwrap_or(0), query.offset.unwrap_or(0))
        .await?;
    let total = sessions.len();
    Ok(respond(
        StatusCode::OK,
        json!({ "sessions": sessions, "total": total }),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sessions:read")?;

    let session = state.sessions.get(&id).await?;
    Ok(respond(StatusCode::OK, session))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "sessions:write")?;

    state.sessions.delete(&id).await?;
    Ok(respond(
        StatusCode::OK,
        json!({ "message": "session deleted" }),
    ))
}

// --- Public handlers (session token is the auth) ---

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateInfo>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxInfo>,
}

#[derive(Debug, Serialize)]
pub struct TemplateInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct SandboxInfo {
    pub id: String,
    pub status: String,
    pub endpoints: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Session view for the join page; includes sandbox info once active
pub async fn join(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state.sessions.get_by_token(&token).await?;

    let template = state
        .catalog
        .get(&session.template_id)
        .map(|t| TemplateInfo {
            name: t.name,
            description: t.description,
        });

    let sandbox = match (&session.status, &session.sandbox_id) {
        (SessionStatus::Active, Some(sandbox_id)) => {
            match state.manager.get(sandbox_id).await {
                Ok(sb) => Some(SandboxInfo {
                    id: sb.id,
                    status: sb.status.as_str().to_string(),
                    endpoints: sb.endpoints,
                    expires_at: session.expires_at,
                }),
                Err(_) => None,
            }
        }
        _ => None,
    };

    Ok(respond(
        StatusCode::OK,
        JoinResponse {
            status: session.status,
            template,
            metadata: session.metadata,
            sandbox,
        },
    ))
}

/// Idempotent activation: repeat calls observe the same state
pub async fn activate(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse> {
    let session: Session = state.sessions.activate(&token).await?;

    Ok(respond(
        StatusCode::OK,
        json!({
            "status": session.status,
            "sandbox_id": session.sandbox_id,
        }),
    ))
}
