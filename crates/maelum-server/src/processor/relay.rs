//! Remote delivery: re-run the upload state machine against the
//! recipient's server from the staged files.

use std::path::PathBuf;

use tokio::fs;
use uuid::Uuid;

use maelum_client::api::{ClientError, CompleteRequest, IngestClient, TicketRequest};
use maelum_core::Header;
use maelum_resolver::RoutingInfo;

use super::{ProcessorContext, StageFailure};
use crate::storage::{CATALOG_FILE, HEADER_FILE};

pub(super) async fn deliver_remote(
    ctx: &ProcessorContext,
    id: Uuid,
    locked_dir: &PathBuf,
    routing: &RoutingInfo,
) -> Result<(), StageFailure> {
    let staged = read_staged(locked_dir).await.map_err(StageFailure::Invalid)?;

    let client = IngestClient::new(&routing.routing)
        .map_err(|err| StageFailure::Transient(err.to_string()))?;

    match upload_staged(&client, &staged).await {
        Ok(()) => {
            let _ = fs::remove_dir_all(locked_dir).await;
            ctx.observability.record_processed_ok();
            tracing::info!(id = %id, peer = %routing.routing, "message relayed");
            Ok(())
        }
        Err(err) if err.is_transient() => Err(StageFailure::Transient(err.to_string())),
        Err(err) => Err(StageFailure::Bounce(format!("peer rejected message: {err}"))),
    }
}

struct StagedMessage {
    header: Header,
    catalog: Vec<u8>,
    blocks: Vec<(String, Vec<u8>)>,
    attachments: Vec<(String, Vec<u8>)>,
}

async fn read_staged(dir: &PathBuf) -> Result<StagedMessage, String> {
    let header_bytes = fs::read(dir.join(HEADER_FILE))
        .await
        .map_err(|err| format!("staged header unreadable: {err}"))?;
    let mut header: Header = serde_json::from_slice(&header_bytes)
        .map_err(|err| format!("staged header malformed: {err}"))?;
    // The next hop signs on its own ingest; our signature stays local.
    header.signatures.server.clear();

    let catalog = fs::read(dir.join(CATALOG_FILE))
        .await
        .map_err(|err| format!("staged catalog unreadable: {err}"))?;

    let mut blocks = Vec::new();
    let mut attachments = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|err| format!("listing staged files failed: {err}"))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| format!("reading staged entry failed: {err}"))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name.strip_prefix("block-") {
            let payload = fs::read(entry.path())
                .await
                .map_err(|err| format!("staged block unreadable: {err}"))?;
            blocks.push((id.to_string(), payload));
        } else if let Some(id) = name.strip_prefix("attachment-") {
            let payload = fs::read(entry.path())
                .await
                .map_err(|err| format!("staged attachment unreadable: {err}"))?;
            attachments.push((id.to_string(), payload));
        }
    }

    Ok(StagedMessage {
        header,
        catalog,
        blocks,
        attachments,
    })
}

async fn upload_staged(
    client: &IngestClient,
    staged: &StagedMessage,
) -> Result<(), ClientError> {
    let grant = client
        .obtain_ticket(&TicketRequest {
            from_hash: staged.header.from.addr,
            to_hash: staged.header.to.addr,
            subscription_id: None,
        })
        .await?;

    client.upload_header(grant.id, &staged.header).await?;
    client.upload_catalog(grant.id, &staged.catalog).await?;
    for (id, payload) in &staged.blocks {
        client.upload_block(grant.id, id, payload).await?;
    }
    for (id, payload) in &staged.attachments {
        client.upload_attachment(grant.id, id, payload).await?;
    }

    client
        .complete(
            grant.id,
            &CompleteRequest {
                blocks: staged.blocks.iter().map(|(id, _)| id.clone()).collect(),
                attachments: staged
                    .attachments
                    .iter()
                    .map(|(id, _)| id.clone())
                    .collect(),
            },
        )
        .await
}
