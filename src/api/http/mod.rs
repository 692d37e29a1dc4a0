//! HTTP API handlers

pub mod auth;
mod health;
mod sandbox;
mod session;
mod template;
mod terminal;

use std::time::Duration;

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

const REST_TIMEOUT: Duration = Duration::from_secs(60);

/// Wrap a payload in the `{success, data}` envelope
pub(crate) fn respond<T: Serialize>(status: StatusCode, data: T) -> impl IntoResponse {
    (status, Json(json!({ "success": true, "data": data })))
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public join routes: the session token is the auth
    let join_routes = Router::new()
        .route("/join/{token}", get(session::join))
        .route("/join/{token}/activate", post(session::activate))
        .layer(TimeoutLayer::new(REST_TIMEOUT));

    // Admin REST routes: API key auth, per-handler permissions
    let rest_routes = Router::new()
        .route("/sandboxes", post(sandbox::create).get(sandbox::list))
        .route(
            "/sandboxes/{id}",
            get(sandbox::get).delete(sandbox::remove),
        )
        .route("/sandboxes/{id}/stop", post(sandbox::stop))
        .route("/sandboxes/{id}/extend", post(sandbox::extend))
        .route("/sandboxes/{id}/logs", get(sandbox::logs))
        .route("/sessions", post(session::create).get(session::list))
        .route(
            "/sessions/{id}",
            get(session::get).delete(session::remove),
        )
        .route("/templates", get(template::list))
        .route("/templates/{name}", get(template::get))
        .route("/catalog/domains", get(template::list_domains))
        .route("/catalog/domains/{domain_id}", get(template::get_domain))
        .route(
            "/catalog/domains/{domain_id}/projects",
            get(template::list_projects),
        )
        .route(
            "/catalog/domains/{domain_id}/projects/{project_name}",
            get(template::get_project),
        )
        .route(
            "/catalog/domains/{domain_id}/projects/{project_name}/tasks",
            get(template::list_tasks),
        )
        .route(
            "/catalog/domains/{domain_id}/projects/{project_name}/tasks/{task_code}",
            get(template::get_task),
        )
        .layer(TimeoutLayer::new(REST_TIMEOUT))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ));

    // WebSocket terminals: long-lived, no timeout layer; credentials come
    // through query parameters because browsers cannot set headers here
    let ws_routes = Router::new()
        .route("/ws/terminal/{id}", get(terminal::terminal_ws))
        .route(
            "/ws/session-terminal/{id}",
            get(terminal::session_terminal_ws),
        );

    let api_routes = Router::new()
        .merge(join_routes)
        .merge(rest_routes)
        .merge(ws_routes);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
