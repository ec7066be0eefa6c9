//! HTTP surface of the maelum server.

mod account;
mod auth;
mod incoming;
mod mgmt;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::state::AppState;

/// Largest accepted upload body (blocks and attachments included).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Standard error body: `{"error": "..."}`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

pub(crate) fn json_ok<T: serde::Serialize>(value: T) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Binds `listener` and serves the API until shutdown.
    pub async fn spawn(listener: TcpListener, state: AppState) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .context("reading bound listener address")?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let app = router(state);
        let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let join = tokio::spawn(async move {
            server
                .await
                .map_err(|err| anyhow::anyhow!("server transport failed: {err}"))
        });

        Ok(Self {
            shutdown: Some(shutdown_tx),
            join,
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join.await.context("awaiting server shutdown")?
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/incoming", post(incoming::request_ticket))
        .route("/incoming/:ticket/header", post(incoming::upload_header))
        .route("/incoming/:ticket/catalog", post(incoming::upload_catalog))
        .route("/incoming/:ticket/block/:id", post(incoming::upload_block))
        .route(
            "/incoming/:ticket/attachment/:id",
            post(incoming::upload_attachment),
        )
        .route("/incoming/:ticket/complete", post(incoming::complete))
        .route("/incoming/:ticket", delete(incoming::abort))
        .route("/account", post(account::register))
        .route("/account/:hash/boxes", get(account::list_boxes))
        .route("/account/:hash/box", post(account::create_box))
        .route(
            "/account/:hash/box/:box",
            get(account::list_messages)
                .post(account::rename_box)
                .delete(account::delete_box),
        )
        .route(
            "/account/:hash/box/:box/message/:id",
            get(account::fetch_message),
        )
        .route(
            "/account/:hash/box/:box/message/:id/block/:part",
            get(account::fetch_block),
        )
        .route(
            "/account/:hash/box/:box/message/:id/attachment/:part",
            get(account::fetch_attachment),
        )
        .route(
            "/account/:hash/box/:box/message/:id/move",
            post(account::move_message),
        )
        .route("/account/:hash/updates", get(account::wait_for_updates))
        .route(
            "/account/:hash/subscription",
            post(account::add_subscription).delete(account::remove_subscription),
        )
        .route("/account/:hash/authkey", post(account::add_auth_key))
        .route("/mgmt/apikey", post(mgmt::mint_api_key))
        .route("/mgmt/invite", post(mgmt::generate_invite))
        .route("/mgmt/flush", post(mgmt::flush))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Response {
    let snapshot = state.observability.snapshot();
    json_ok(serde_json::json!({
        "ok": true,
        "routing_id": state.identity.routing_id,
        "uptime": humantime::format_duration(snapshot.uptime).to_string(),
        "ingest_ok_total": snapshot.ingest_ok_total,
        "ingest_err_total": snapshot.ingest_err_total,
        "processed_ok_total": snapshot.processed_ok_total,
        "bounced_total": snapshot.bounced_total,
        "quarantined_total": snapshot.quarantined_total,
    }))
}
