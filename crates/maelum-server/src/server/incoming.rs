//! Ticket-gated upload endpoints: the staged ingest of one message.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use maelum_client::api::{
    ChallengeBody, CompleteRequest, TicketGrant, TicketRequest, CHECKSUM_HEADER, POW_HEADER,
};
use maelum_core::{sha256_hex, sign_server_header, Header, Ticket};

use crate::admission::{self, TicketDecision};
use crate::processor::WorkItem;
use crate::state::{unix_now, AppState};
use crate::storage::{Section, CATALOG_FILE, HEADER_FILE};

use super::{api_error, json_ok};

const INVALID_TICKET: &str = "invalid ticket id or ticket not valid";

pub async fn request_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TicketRequest>,
) -> Response {
    let pow_response = headers
        .get(POW_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_pow_header);

    let decision = admission::request_ticket(
        &state.tickets,
        &state.challenges,
        &state.subscriptions,
        request.from_hash,
        request.to_hash,
        request.subscription_id,
        pow_response,
        state.config.admission.pow_bits,
        unix_now(),
    );

    match decision {
        TicketDecision::Issued(ticket) => {
            state.observability.record_ingest_ok();
            json_ok(TicketGrant {
                id: ticket.id,
                valid: ticket.valid,
                expires: ticket.expires_at,
            })
        }
        TicketDecision::ChallengeRequired { challenge, bits } => {
            state.observability.record_ingest_err("pow-required");
            (
                StatusCode::PRECONDITION_FAILED,
                Json(ChallengeBody { challenge, bits }),
            )
                .into_response()
        }
    }
}

fn parse_pow_header(raw: &str) -> Option<(String, u64)> {
    let (challenge, nonce) = raw.rsplit_once(':')?;
    let nonce = nonce.parse::<u64>().ok()?;
    Some((challenge.to_string(), nonce))
}

pub async fn upload_header(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    body: Bytes,
) -> Response {
    let ticket = match usable_ticket(&state, ticket_id) {
        Ok(ticket) => ticket,
        Err(response) => return response,
    };
    let lock = state.ticket_lock(ticket_id);
    let _guard = lock.lock().await;

    let Ok(mut header) = serde_json::from_slice::<Header>(&body) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid header posted");
    };

    if header.from.addr != ticket.from || header.to.addr != ticket.to {
        return api_error(
            StatusCode::BAD_REQUEST,
            "header from/to address do not match the ticket",
        );
    }

    if state
        .store
        .message_exists(Section::Incoming, ticket_id, Some(HEADER_FILE))
        .await
    {
        return api_error(StatusCode::CONFLICT, "header already uploaded");
    }

    // The origin proof of this server: a routing-key signature over the
    // header as received.
    if let Err(err) = sign_server_header(&mut header, &state.identity.keypair.private) {
        tracing::warn!(error = ?err, "signing incoming header failed");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "error while signing incoming message",
        );
    }

    let encoded = match serde_json::to_vec(&header) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::warn!(error = ?err, "encoding signed header failed");
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error while storing message header",
            );
        }
    };
    if let Err(err) = state
        .store
        .write_message_file(Section::Incoming, ticket_id, HEADER_FILE, &encoded)
        .await
    {
        tracing::warn!(error = ?err, "storing header failed");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "error while storing message header",
        );
    }

    json_ok(serde_json::json!({ "status": "header saved" }))
}

pub async fn upload_catalog(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    body: Bytes,
) -> Response {
    if let Err(response) = usable_ticket(&state, ticket_id) {
        return response;
    }
    let lock = state.ticket_lock(ticket_id);
    let _guard = lock.lock().await;

    if body.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "catalog body is empty");
    }

    if let Err(err) = state
        .store
        .write_message_file(Section::Incoming, ticket_id, CATALOG_FILE, &body)
        .await
    {
        tracing::warn!(error = ?err, "storing catalog failed");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "error while storing message catalog",
        );
    }

    json_ok(serde_json::json!({ "status": "catalog saved" }))
}

pub async fn upload_block(
    state: State<AppState>,
    path: Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    store_part(state, path, headers, body, "block").await
}

pub async fn upload_attachment(
    state: State<AppState>,
    path: Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    store_part(state, path, headers, body, "attachment").await
}

async fn store_part(
    State(state): State<AppState>,
    Path((ticket_id, part_id)): Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
    kind: &'static str,
) -> Response {
    if let Err(response) = usable_ticket(&state, ticket_id) {
        return response;
    }
    if !is_safe_part_id(&part_id) {
        return api_error(StatusCode::BAD_REQUEST, "invalid part id");
    }
    let lock = state.ticket_lock(ticket_id);
    let _guard = lock.lock().await;

    let Some(declared) = headers
        .get(CHECKSUM_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return api_error(StatusCode::BAD_REQUEST, "missing checksum");
    };
    if sha256_hex(&body) != declared.to_ascii_lowercase() {
        state.observability.record_ingest_err("checksum-mismatch");
        return api_error(StatusCode::BAD_REQUEST, "checksum mismatch");
    }

    let file = format!("{kind}-{part_id}");
    if let Err(err) = state
        .store
        .write_message_file(Section::Incoming, ticket_id, &file, &body)
        .await
    {
        tracing::warn!(error = ?err, kind, "storing message part failed");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("error while storing message {kind}"),
        );
    }

    json_ok(serde_json::json!({ "status": format!("saved message {kind}") }))
}

pub async fn complete(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Json(manifest): Json<CompleteRequest>,
) -> Response {
    if let Err(response) = usable_ticket(&state, ticket_id) {
        return response;
    }
    let lock = state.ticket_lock(ticket_id);
    let _guard = lock.lock().await;

    for file in [HEADER_FILE, CATALOG_FILE] {
        if !state
            .store
            .message_exists(Section::Incoming, ticket_id, Some(file))
            .await
        {
            return api_error(StatusCode::BAD_REQUEST, format!("{file} is missing"));
        }
    }
    for id in &manifest.blocks {
        if !is_safe_part_id(id)
            || !state
                .store
                .message_exists(Section::Incoming, ticket_id, Some(&format!("block-{id}")))
                .await
        {
            return api_error(StatusCode::BAD_REQUEST, format!("block {id} is missing"));
        }
    }
    for id in &manifest.attachments {
        if !is_safe_part_id(id)
            || !state
                .store
                .message_exists(
                    Section::Incoming,
                    ticket_id,
                    Some(&format!("attachment-{id}")),
                )
                .await
        {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("attachment {id} is missing"),
            );
        }
    }

    // The rename into `processing` is the exclusivity gate: at most one
    // complete call wins it. Only then is the ticket consumed.
    if state
        .store
        .move_message(Section::Incoming, Section::Processing, ticket_id)
        .await
        .is_err()
    {
        return api_error(StatusCode::UNAUTHORIZED, INVALID_TICKET);
    }
    state.tickets.remove(ticket_id);
    state.release_ticket_lock(ticket_id);

    state.processor.enqueue(WorkItem::new(ticket_id, unix_now())).await;
    state.observability.record_ingest_ok();

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "message accepted" })),
    )
        .into_response()
}

pub async fn abort(State(state): State<AppState>, Path(ticket_id): Path<Uuid>) -> Response {
    if state.tickets.get(ticket_id).is_none() {
        return api_error(StatusCode::UNAUTHORIZED, INVALID_TICKET);
    }
    let lock = state.ticket_lock(ticket_id);
    let _guard = lock.lock().await;

    if let Err(err) = state.store.remove_message(Section::Incoming, ticket_id).await {
        tracing::warn!(error = ?err, "removing staged upload failed");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "error while deleting staged message",
        );
    }
    state.tickets.remove(ticket_id);
    state.release_ticket_lock(ticket_id);

    json_ok(serde_json::json!({ "status": "message removed" }))
}

fn usable_ticket(state: &AppState, id: Uuid) -> Result<Ticket, Response> {
    match state.tickets.get(id) {
        Some(ticket) if ticket.is_usable(unix_now()) => Ok(ticket),
        _ => Err(api_error(StatusCode::UNAUTHORIZED, INVALID_TICKET)),
    }
}

fn is_safe_part_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
}
