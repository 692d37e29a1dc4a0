//! Health and readiness probes

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde_json::json;

use crate::api::http::respond;
use crate::service::sandbox::SandboxManager;
use crate::{AppState, Result};

pub async fn health() -> impl IntoResponse {
    respond(
        StatusCode::OK,
        json!({
            "status": "healthy",
            "time": Utc::now().to_rfc3339(),
        }),
    )
}

/// 503 unless the container runtime and the store both answer
pub async fn ready(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.manager.ping().await?;
    Ok(respond(StatusCode::OK, json!({ "status": "ready" })))
}
