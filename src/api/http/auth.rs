//! API key authentication

use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::domain::client::ApiClient;
use crate::error::{Error, Result};
use crate::AppState;

const TOUCH_BUDGET: Duration = Duration::from_secs(5);

/// Extract an API key from `Authorization: Bearer <key>`, a raw
/// `Authorization` value, or the `X-API-Key` header.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let key = value.strip_prefix("Bearer ").unwrap_or(value);
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }

    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Resolve an API key to an active client. `last_used_at` is recorded in a
/// detached task with its own budget so the request never waits on it.
pub async fn resolve_client(state: &AppState, api_key: &str) -> Result<ApiClient> {
    let client = state
        .repository
        .client_by_api_key(api_key)
        .await
        .map_err(|e| {
            warn!(error = %e, "failed to look up api client");
            Error::Internal("authentication error".to_string())
        })?;

    let Some(client) = client else {
        warn!(key_prefix = mask_key(api_key), "invalid api key");
        return Err(Error::Unauthorized(
            "the provided api key is not valid".to_string(),
        ));
    };

    if !client.is_active {
        warn!(client = client.name, "inactive client attempt");
        return Err(Error::Unauthorized(
            "this api key has been deactivated".to_string(),
        ));
    }

    let repository = state.repository.clone();
    let key = api_key.to_string();
    let name = client.name.clone();
    tokio::spawn(async move {
        let touch = tokio::time::timeout(TOUCH_BUDGET, repository.touch_client_last_used(&key));
        match touch.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(client = name, error = %e, "failed to update last_used_at"),
            Err(_) => warn!(client = name, "last_used_at update timed out"),
        }
    });

    debug!(client = client.name, key_prefix = client.masked_key(), "authenticated request");
    Ok(client)
}

/// Middleware: authenticate the request and stash the client in request
/// extensions for handlers to check permissions against.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, Error> {
    let api_key = extract_api_key(request.headers()).ok_or_else(|| {
        Error::Unauthorized(
            "provide an Authorization bearer token or X-API-Key header".to_string(),
        )
    })?;

    let client = resolve_client(&state, &api_key).await?;
    request.extensions_mut().insert(client);

    Ok(next.run(request).await)
}

/// Permission gate used inside handlers
pub fn require(client: &ApiClient, permission: &str) -> Result<()> {
    if client.has_permission(permission) {
        Ok(())
    } else {
        warn!(
            client = client.name,
            required = permission,
            "permission denied"
        );
        Err(Error::PermissionDenied(format!(
            "client does not have required permission: {permission}"
        )))
    }
}

fn mask_key(key: &str) -> String {
    if key.len() < 8 {
        "***".to_string()
    } else {
        format!("{}...", &key[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_and_header_keys() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk_live_abc".parse().expect("header"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk_live_abc"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "sk_raw_key".parse().expect("header"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk_raw_key"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk_x_key".parse().expect("header"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk_x_key"));

        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }
}
