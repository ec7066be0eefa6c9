//! Authenticated mailbox API plus account registration.

use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use uuid::Uuid;

use maelum_client::api::FetchedMessage;
use maelum_core::{Address, AddressHash, Header, InviteToken, PublicKey};

use crate::state::{unix_now, AppState};
use crate::storage::mailbox::{AuthKey, FIRST_CUSTOM_BOX};
use crate::storage::{CATALOG_FILE, HEADER_FILE};

use super::auth::authorize_account;
use super::{api_error, json_ok};

/// How long an update long-poll waits before answering `204`.
const UPDATE_POLL_WINDOW: Duration = Duration::from_secs(25);

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    address: String,
    public_key: PublicKey,
    invite_token: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Response {
    let Ok(address) = Address::parse(&body.address) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid address");
    };
    let Ok(token) = InviteToken::from_str(&body.invite_token) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid invite token");
    };

    let now = unix_now();
    if !token.is_valid(&state.identity.keypair.public, now)
        || token.routing_id != state.identity.routing_id
        || token.address_hash != address.hash()
    {
        return api_error(StatusCode::UNAUTHORIZED, "invite token not accepted");
    }

    match state
        .store
        .create_account(address.hash(), body.public_key, now)
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "status": "account created" })),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = ?err, "account registration failed");
            api_error(StatusCode::CONFLICT, "account already exists")
        }
    }
}

pub async fn list_boxes(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    match state.store.list_boxes(&hash).await {
        Ok(boxes) => json_ok(boxes),
        Err(err) => {
            tracing::warn!(error = ?err, "listing boxes failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "listing boxes failed")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BoxBody {
    name: String,
}

pub async fn create_box(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BoxBody>,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    match state.store.create_box(&hash, &body.name).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "id": id, "name": body.name })),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = ?err, "creating box failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "creating box failed")
        }
    }
}

pub async fn rename_box(
    State(state): State<AppState>,
    Path((hash, box_id)): Path<(String, u32)>,
    headers: HeaderMap,
    Json(body): Json<BoxBody>,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    if box_id < FIRST_CUSTOM_BOX {
        return api_error(StatusCode::BAD_REQUEST, "box is reserved");
    }
    match state.store.rename_box(&hash, box_id, &body.name).await {
        Ok(()) => json_ok(serde_json::json!({ "id": box_id, "name": body.name })),
        Err(err) => {
            tracing::warn!(error = ?err, "renaming box failed");
            api_error(StatusCode::BAD_REQUEST, "renaming box failed")
        }
    }
}

pub async fn delete_box(
    State(state): State<AppState>,
    Path((hash, box_id)): Path<(String, u32)>,
    headers: HeaderMap,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    if box_id < FIRST_CUSTOM_BOX {
        return api_error(StatusCode::BAD_REQUEST, "box is reserved");
    }
    match state.store.delete_box(&hash, box_id).await {
        Ok(()) => json_ok(serde_json::json!({ "status": "box removed" })),
        Err(err) => {
            tracing::warn!(error = ?err, "deleting box failed");
            api_error(StatusCode::BAD_REQUEST, "deleting box failed")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path((hash, box_id)): Path<(String, u32)>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let limit = query.limit.unwrap_or(50).min(500);
    match state
        .store
        .list_messages(&hash, box_id, query.offset, limit)
        .await
    {
        Ok(messages) => json_ok(messages),
        Err(err) => {
            tracing::warn!(error = ?err, "listing messages failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "listing messages failed")
        }
    }
}

pub async fn fetch_message(
    State(state): State<AppState>,
    Path((hash, box_id, id)): Path<(String, u32, Uuid)>,
    headers: HeaderMap,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let dir = state.store.boxed_message_dir(&hash, box_id, id);

    let header_bytes = match tokio::fs::read(dir.join(HEADER_FILE)).await {
        Ok(bytes) => bytes,
        Err(_) => return api_error(StatusCode::NOT_FOUND, "message not found"),
    };
    let Ok(header) = serde_json::from_slice::<Header>(&header_bytes) else {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "stored header unreadable");
    };
    let catalog = match tokio::fs::read(dir.join(CATALOG_FILE)).await {
        Ok(bytes) => bytes,
        Err(_) => return api_error(StatusCode::NOT_FOUND, "message not found"),
    };

    json_ok(FetchedMessage {
        header,
        catalog: BASE64.encode(catalog),
    })
}

pub async fn fetch_block(
    state: State<AppState>,
    path: Path<(String, u32, Uuid, String)>,
    headers: HeaderMap,
) -> Response {
    fetch_part(state, path, headers, "block").await
}

pub async fn fetch_attachment(
    state: State<AppState>,
    path: Path<(String, u32, Uuid, String)>,
    headers: HeaderMap,
) -> Response {
    fetch_part(state, path, headers, "attachment").await
}

async fn fetch_part(
    State(state): State<AppState>,
    Path((hash, box_id, id, part_id)): Path<(String, u32, Uuid, String)>,
    headers: HeaderMap,
    kind: &'static str,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    if part_id.is_empty()
        || part_id.len() > 64
        || !part_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
    {
        return api_error(StatusCode::BAD_REQUEST, "invalid part id");
    }
    let path = state
        .store
        .boxed_message_dir(&hash, box_id, id)
        .join(format!("{kind}-{part_id}"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(_) => api_error(StatusCode::NOT_FOUND, format!("{kind} not found")),
    }
}

#[derive(Debug, Deserialize)]
pub struct MoveBody {
    to_box: u32,
}

pub async fn move_message(
    State(state): State<AppState>,
    Path((hash, box_id, id)): Path<(String, u32, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<MoveBody>,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    match state
        .store
        .move_boxed_message(&hash, box_id, body.to_box, id)
        .await
    {
        Ok(()) => json_ok(serde_json::json!({ "status": "message moved" })),
        Err(err) => {
            tracing::warn!(error = ?err, "moving message failed");
            api_error(StatusCode::BAD_REQUEST, "moving message failed")
        }
    }
}

pub async fn wait_for_updates(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let mut updates = state.notifier.subscribe(&hash);
    match tokio::time::timeout(UPDATE_POLL_WINDOW, updates.recv()).await {
        Ok(Ok(message_id)) => json_ok(serde_json::json!({ "message_id": message_id })),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionBody {
    from_hash: AddressHash,
    subscription_id: String,
}

pub async fn add_subscription(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SubscriptionBody>,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    match state
        .subscriptions
        .add(body.from_hash, hash, body.subscription_id)
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "status": "subscription added" })),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = ?err, "adding subscription failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "adding subscription failed",
            )
        }
    }
}

pub async fn remove_subscription(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SubscriptionBody>,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    match state
        .subscriptions
        .remove(&body.from_hash, &hash, &body.subscription_id)
        .await
    {
        Ok(()) => json_ok(serde_json::json!({ "status": "subscription removed" })),
        Err(err) => {
            tracing::warn!(error = ?err, "removing subscription failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "removing subscription failed",
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthKeyBody {
    public_key: PublicKey,
    expires_at: Option<u64>,
}

pub async fn add_auth_key(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AuthKeyBody>,
) -> Response {
    let hash = match authorized(&state, &headers, &hash).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    match state
        .store
        .add_auth_key(
            &hash,
            AuthKey {
                public_key: body.public_key,
                expires_at: body.expires_at,
            },
        )
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "status": "auth key added" })),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = ?err, "adding auth key failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "adding auth key failed")
        }
    }
}

async fn authorized(
    state: &AppState,
    headers: &HeaderMap,
    hash: &str,
) -> Result<AddressHash, Response> {
    let Ok(hash) = AddressHash::parse(hash) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid address hash"));
    };
    authorize_account(state, headers, &hash).await?;
    Ok(hash)
}
