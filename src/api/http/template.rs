//! Template and catalog HTTP handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension,
};
use serde_json::json;

use crate::api::http::{auth, respond};
use crate::domain::client::ApiClient;
use crate::{AppState, Error, Result};

pub async fn list(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let templates = state.catalog.list();
    let total = templates.len();
    Ok(respond(
        StatusCode::OK,
        json!({ "templates": templates, "total": total }),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let template = state
        .catalog
        .get(&name)
        .ok_or_else(|| Error::TemplateNotFound(name))?;
    Ok(respond(StatusCode::OK, template))
}

// --- Catalog hierarchy: domains -> projects -> tasks ---

pub async fn list_domains(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let domains = state.catalog.domains();
    let total = domains.len();
    Ok(respond(
        StatusCode::OK,
        json!({ "domains": domains, "total": total }),
    ))
}

pub async fn get_domain(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(domain_id): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let domain = state
        .catalog
        .domain(&domain_id)
        .ok_or_else(|| Error::NotFound(format!("domain {domain_id}")))?;
    Ok(respond(StatusCode::OK, domain))
}

pub async fn list_projects(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(domain_id): Path<String>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let projects = state.catalog.projects(&domain_id);
    let total = projects.len();
    Ok(respond(
        StatusCode::OK,
        json!({ "projects": projects, "total": total }),
    ))
}

pub async fn get_project(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path((domain_id, project_name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let id = format!("{domain_id}/{project_name}");
    let project = state
        .catalog
        .project(&id)
        .ok_or_else(|| Error::NotFound(format!("project {id}")))?;
    Ok(respond(StatusCode::OK, project))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path((domain_id, project_name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let tasks = state.catalog.tasks(&format!("{domain_id}/{project_name}"));
    let total = tasks.len();
    Ok(respond(
        StatusCode::OK,
        json!({ "tasks": tasks, "total": total }),
    ))
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path((domain_id, project_name, task_code)): Path<(String, String, String)>,
) -> Result<impl IntoResponse> {
    auth::require(&client, "templates:read")?;

    let id = format!("{domain_id}/{project_name}/{task_code}");
    let task = state
        .catalog
        .task(&id)
        .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
    Ok(respond(StatusCode::OK, task))
}
