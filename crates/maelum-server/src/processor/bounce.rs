//! Bouncing: park the undeliverable message in `outbox` with a receipt
//! and, for local senders, drop a server-generated notice in their inbox.

use std::path::PathBuf;

use tokio::fs;
use uuid::Uuid;

use maelum_core::{
    compose, Address, Addressing, BlockSpec, Header, KeyType,
};

use super::ProcessorContext;
use crate::state::unix_now;
use crate::storage::mailbox::INBOX;
use crate::storage::{write_atomic, Section, CATALOG_FILE, HEADER_FILE};

/// The local identity bounce notices are sent from.
const POSTMASTER: &str = "postmaster!";

pub(super) async fn bounce(ctx: &ProcessorContext, id: Uuid, locked_dir: &PathBuf, reason: &str) {
    let original_header = read_header(locked_dir).await;

    let target = ctx.store.message_dir(Section::Outbox, id);
    if let Err(err) = fs::rename(locked_dir, &target).await {
        tracing::error!(error = ?err, id = %id, "moving message to outbox failed");
        return;
    }
    let receipt = serde_json::json!({ "reason": reason, "bounced_at": unix_now() });
    if let Err(err) =
        write_atomic(&target.join("bounce.json"), receipt.to_string().as_bytes()).await
    {
        tracing::warn!(error = ?err, id = %id, "writing bounce receipt failed");
    }
    ctx.observability.record_bounced();

    // Best effort: a notice into the sender's inbox when the sender lives
    // here.
    if let Some(header) = original_header {
        if let Err(err) = notify_local_sender(ctx, &header, reason).await {
            tracing::debug!(error = %err, id = %id, "no bounce notice delivered");
        }
    }
}

async fn read_header(dir: &PathBuf) -> Option<Header> {
    let bytes = fs::read(dir.join(HEADER_FILE)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn notify_local_sender(
    ctx: &ProcessorContext,
    original: &Header,
    reason: &str,
) -> Result<(), String> {
    let sender_hash = original.from.addr;
    let account = ctx
        .store
        .account(&sender_hash)
        .await
        .map_err(|err| err.to_string())?
        .ok_or("sender is not local")?;
    if account.public_key.key_type() != KeyType::Ed25519 {
        return Err("sender key cannot receive sealed notices".to_string());
    }

    let postmaster = Address::parse(POSTMASTER).expect("postmaster address is well-formed");
    let body = format!(
        "Your message to {} could not be delivered.\n\nReason: {reason}\n",
        original.to.addr
    );
    let envelope = compose(
        &Addressing {
            sender: postmaster.hash(),
            sender_key: ctx.identity.keypair.clone(),
            recipient: sender_hash,
            recipient_key: account.public_key.clone(),
        },
        "Delivery failure",
        unix_now(),
        vec![BlockSpec {
            kind: "default".to_string(),
            data: body.into_bytes(),
        }],
        Vec::new(),
        None,
    )
    .map_err(|err| err.to_string())?;

    // Delivered straight into the inbox: the notice is server-generated
    // and never passes through the ingest pipeline.
    let notice_id = Uuid::new_v4();
    let dir = ctx.store.boxed_message_dir(&sender_hash, INBOX, notice_id);
    fs::create_dir_all(&dir).await.map_err(|err| err.to_string())?;

    let header_bytes = serde_json::to_vec(&envelope.header).map_err(|err| err.to_string())?;
    write_atomic(&dir.join(HEADER_FILE), &header_bytes)
        .await
        .map_err(|err| err.to_string())?;
    write_atomic(&dir.join(CATALOG_FILE), &envelope.sealed_catalog)
        .await
        .map_err(|err| err.to_string())?;
    for (block_id, payload) in &envelope.blocks {
        write_atomic(&dir.join(format!("block-{block_id}")), payload)
            .await
            .map_err(|err| err.to_string())?;
    }

    ctx.store
        .index_message(&sender_hash, INBOX, notice_id, unix_now())
        .await
        .map_err(|err| err.to_string())?;
    ctx.notifier.notify(&sender_hash, notice_id);
    tracing::info!(account = %sender_hash, "bounce notice delivered");
    Ok(())
}
