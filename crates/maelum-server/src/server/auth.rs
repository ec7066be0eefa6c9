//! Request authentication: mailbox bearer tokens and management API keys.

use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use maelum_core::{AddressHash, ApiKey, Permission};

use crate::state::{unix_now, AppState};

use super::api_error;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Verifies a mailbox bearer token for `hash`.
///
/// The token is `base64("<hash>:<expiry>:<sig>")` with the signature taken
/// over `"<hash>:<expiry>"` by the account key or one of its authorised
/// keys. Every decoding failure is an authentication failure.
pub async fn authorize_account(
    state: &AppState,
    headers: &HeaderMap,
    hash: &AddressHash,
) -> Result<(), Response> {
    let denied = || api_error(StatusCode::UNAUTHORIZED, "unauthorized");

    let token = bearer(headers).ok_or_else(denied)?;
    let decoded = BASE64.decode(token).map_err(|_| denied())?;
    let decoded = String::from_utf8(decoded).map_err(|_| denied())?;

    let mut parts = decoded.splitn(3, ':');
    let token_hash = parts.next().ok_or_else(denied)?;
    let expires = parts
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(denied)?;
    let signature = parts
        .next()
        .and_then(|v| BASE64.decode(v).ok())
        .ok_or_else(denied)?;

    let now = unix_now();
    if token_hash != hash.to_string() || now >= expires {
        return Err(denied());
    }

    let account = state
        .store
        .account(hash)
        .await
        .map_err(|err| {
            tracing::warn!(error = ?err, "reading account record failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "account lookup failed")
        })?
        .ok_or_else(denied)?;

    let payload = format!("{token_hash}:{expires}");
    if account.public_key.verify(payload.as_bytes(), &signature) {
        return Ok(());
    }
    for auth_key in &account.auth_keys {
        let expired = auth_key.expires_at.is_some_and(|at| now >= at);
        if !expired && auth_key.public_key.verify(payload.as_bytes(), &signature) {
            return Ok(());
        }
    }
    Err(denied())
}

/// Verifies a management API key and its permission for the endpoint.
pub async fn authorize_mgmt(
    state: &AppState,
    headers: &HeaderMap,
    permission: Permission,
) -> Result<ApiKey, Response> {
    let denied = || api_error(StatusCode::UNAUTHORIZED, "unauthorized");

    let key_id = bearer(headers).ok_or_else(denied)?;
    let key = state
        .apikeys
        .get(key_id, unix_now())
        .await
        .map_err(|err| {
            tracing::warn!(error = ?err, "api key lookup failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "api key lookup failed")
        })?
        .ok_or_else(denied)?;

    if key.has_permission(permission) {
        Ok(key)
    } else {
        Err(denied())
    }
}
