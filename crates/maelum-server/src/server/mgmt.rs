//! Management endpoints gated on API-key permissions.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use maelum_core::{parse_permissions, AddressHash, ApiKey, InviteToken, Permission};

use crate::state::{unix_now, AppState};

use super::auth::authorize_mgmt;
use super::{api_error, json_ok};

#[derive(Debug, Deserialize)]
pub struct ApiKeyBody {
    permissions: Vec<String>,
    /// Days of validity; omitted means the key never expires.
    valid_days: Option<u64>,
}

/// Mints a regular (non-admin) API key. Admin keys can only be created
/// through the local CLI.
pub async fn mint_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ApiKeyBody>,
) -> Response {
    if let Err(response) = authorize_mgmt(&state, &headers, Permission::ApiKeys).await {
        return response;
    }

    let permissions = match parse_permissions(&body.permissions) {
        Ok(permissions) if !permissions.is_empty() => permissions,
        Ok(_) => return api_error(StatusCode::BAD_REQUEST, "no permissions given"),
        Err(err) => return api_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let valid_until = body.valid_days.map(|days| unix_now() + days * 86_400);

    let key = ApiKey::new(permissions, valid_until);
    let id = key.id.clone();
    if let Err(err) = state.apikeys.store(key).await {
        tracing::warn!(error = ?err, "storing api key failed");
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "storing api key failed");
    }

    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "api_key": id })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct InviteBody {
    address_hash: AddressHash,
    /// Days the invite stays valid; defaults to 30.
    days: Option<u64>,
}

/// Issues an invite token for registering one address on this server.
pub async fn generate_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<InviteBody>,
) -> Response {
    if let Err(response) = authorize_mgmt(&state, &headers, Permission::Invite).await {
        return response;
    }

    let expires_at = unix_now() + body.days.unwrap_or(30) * 86_400;
    match InviteToken::new(
        body.address_hash,
        state.identity.routing_id.clone(),
        expires_at,
        &state.identity.keypair.private,
    ) {
        Ok(token) => json_ok(serde_json::json!({
            "token": token.to_string(),
            "expires": expires_at,
        })),
        Err(err) => {
            tracing::warn!(error = ?err, "generating invite failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "generating invite failed")
        }
    }
}

/// Triggers an immediate retry sweep of the delivery queue.
pub async fn flush(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize_mgmt(&state, &headers, Permission::Flush).await {
        return response;
    }
    state.processor.flush();
    json_ok(serde_json::json!({ "status": "queues flushed" }))
}
