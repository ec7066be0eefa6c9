//! The incoming processor: moves finalised messages from `processing`
//! through verification and routing into a local mailbox or out to a
//! remote server.
//!
//! A fixed pool of workers consumes a bounded queue of message ids.
//! Per-message exclusivity comes from renaming `processing/<id>` into
//! `processing/<id>.lock.<pid>`: the worker that wins the rename owns the
//! message. Transient failures reschedule with exponential backoff and
//! jitter; the retry budget exhausting, or a permanent remote rejection,
//! bounces the message back to its sender; internal failures quarantine it
//! in `dead/`.

mod bounce;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::fs;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use maelum_core::{verify_client_header, verify_server_header, Header};
use maelum_resolver::{ResolveError, ResolverService, RoutingInfo};

use crate::config::ProcessorConfig;
use crate::identity::RoutingIdentity;
use crate::observability::ServerObservability;
use crate::repos::TicketRepo;
use crate::state::{unix_now, Notifier};
use crate::storage::{MessageStore, Section, CATALOG_FILE, HEADER_FILE};

/// Upper bound on a stored header file.
const MAX_HEADER_BYTES: u64 = 64 * 1024;
/// Upper bound on a stored catalog file.
const MAX_CATALOG_BYTES: u64 = 8 * 1024 * 1024;

const QUEUE_DEPTH: usize = 1_024;

/// One unit of processor work.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub id: Uuid,
    pub attempt: u32,
    pub first_seen: u64,
}

impl WorkItem {
    #[must_use]
    pub fn new(id: Uuid, now: u64) -> Self {
        Self {
            id,
            attempt: 0,
            first_seen: now,
        }
    }

    fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

/// Entry point handed to the HTTP layer: enqueue work, force retries.
#[derive(Clone)]
pub struct ProcessorHandle {
    tx: mpsc::Sender<WorkItem>,
    retries: Arc<RetryQueue>,
}

impl ProcessorHandle {
    pub async fn enqueue(&self, item: WorkItem) {
        if self.tx.send(item).await.is_err() {
            tracing::error!(id = %item.id, "processor queue is closed; message stays in processing");
        }
    }

    /// Makes every delayed retry due immediately.
    pub fn flush(&self) {
        self.retries.flush();
    }
}

/// Delayed retries, polled by the scheduler task.
#[derive(Default)]
struct RetryQueue {
    entries: std::sync::Mutex<Vec<(u64, WorkItem)>>,
    notify: Notify,
}

impl RetryQueue {
    fn schedule(&self, due_at: u64, item: WorkItem) {
        self.entries
            .lock()
            .expect("retry queue poisoned")
            .push((due_at, item));
        self.notify.notify_one();
    }

    fn flush(&self) {
        let mut entries = self.entries.lock().expect("retry queue poisoned");
        for (due_at, _) in entries.iter_mut() {
            *due_at = 0;
        }
        drop(entries);
        self.notify.notify_one();
    }

    fn take_due(&self, now: u64) -> Vec<WorkItem> {
        let mut entries = self.entries.lock().expect("retry queue poisoned");
        let (due, rest): (Vec<_>, Vec<_>) = entries.drain(..).partition(|(at, _)| *at <= now);
        *entries = rest;
        due.into_iter().map(|(_, item)| item).collect()
    }
}

/// Everything a worker needs; cheap to clone per task.
#[derive(Clone)]
pub struct ProcessorContext {
    pub store: MessageStore,
    pub identity: RoutingIdentity,
    pub resolver: Arc<ResolverService>,
    pub tickets: Arc<TicketRepo>,
    pub observability: ServerObservability,
    pub notifier: Notifier,
    pub config: ProcessorConfig,
}

/// Spawned worker pool plus background tasks.
pub struct ProcessorPool {
    handles: Vec<JoinHandle<()>>,
}

impl ProcessorPool {
    /// Waits for every worker and background task to stop. Call after
    /// cancelling the token passed to [`spawn`].
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Starts the worker pool, the retry scheduler, and the GC sweep. Crash
/// recovery runs first: orphaned `processing/` entries are unlocked and
/// requeued before the workers start pulling.
pub async fn spawn(
    ctx: ProcessorContext,
    cancel: CancellationToken,
) -> Result<(ProcessorHandle, ProcessorPool)> {
    let (tx, rx) = mpsc::channel::<WorkItem>(QUEUE_DEPTH);
    let retries = Arc::new(RetryQueue::default());
    let handle = ProcessorHandle {
        tx: tx.clone(),
        retries: Arc::clone(&retries),
    };

    recover_orphans(&ctx, &tx).await?;

    let rx = Arc::new(Mutex::new(rx));
    let mut handles = Vec::new();

    for worker in 0..ctx.config.workers.max(1) {
        let ctx = ctx.clone();
        let rx = Arc::clone(&rx);
        let retries = Arc::clone(&retries);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker, ctx, rx, retries, cancel).await;
        }));
    }

    handles.push(tokio::spawn(scheduler_loop(
        Arc::clone(&retries),
        tx.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(gc_loop(ctx.clone(), cancel)));

    Ok((handle, ProcessorPool { handles }))
}

async fn worker_loop(
    worker: usize,
    ctx: ProcessorContext,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    retries: Arc<RetryQueue>,
    cancel: CancellationToken,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            }
        };
        process_item(&ctx, &retries, item).await;
    }
    tracing::debug!(worker, "processor worker stopped");
}

async fn scheduler_loop(
    retries: Arc<RetryQueue>,
    tx: mpsc::Sender<WorkItem>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = retries.notify.notified() => {}
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
        }
        for item in retries.take_due(unix_now()) {
            if tx.send(item).await.is_err() {
                return;
            }
        }
    }
}

async fn gc_loop(ctx: ProcessorContext, cancel: CancellationToken) {
    let period = std::time::Duration::from_secs(ctx.config.gc_interval_secs.max(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        if let Err(err) = sweep_incoming(&ctx).await {
            tracing::warn!(error = ?err, "incoming GC sweep failed");
        }
    }
}

/// Deletes any incoming tree whose ticket is no longer alive.
async fn sweep_incoming(ctx: &ProcessorContext) -> Result<()> {
    let now = unix_now();
    let live = ctx.tickets.live_ids(now);
    ctx.tickets.prune(now);

    for id in ctx.store.list_section(Section::Incoming).await? {
        if !live.contains(&id) {
            tracing::info!(id = %id, "reclaiming expired upload");
            ctx.store.remove_message(Section::Incoming, id).await?;
        }
    }
    Ok(())
}

/// Requeues processing-section messages left behind by a previous run.
async fn recover_orphans(ctx: &ProcessorContext, tx: &mpsc::Sender<WorkItem>) -> Result<()> {
    let dir = ctx.store.section_dir(Section::Processing);
    let mut entries = fs::read_dir(&dir)
        .await
        .with_context(|| format!("listing processing section {}", dir.display()))?;
    let now = unix_now();

    while let Some(entry) = entries.next_entry().await.context("reading entry")? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        // Stale lock dirs from a crashed worker: unlock first.
        let plain = match name.split_once(".lock.") {
            Some((id, _)) => {
                let unlocked = dir.join(id);
                if let Err(err) = fs::rename(entry.path(), &unlocked).await {
                    tracing::warn!(error = ?err, name, "unlocking orphaned message failed");
                    continue;
                }
                id.to_string()
            }
            None => name.to_string(),
        };

        if let Ok(id) = Uuid::parse_str(&plain) {
            tracing::info!(id = %id, "requeueing orphaned message");
            let _ = tx.send(WorkItem::new(id, now)).await;
        }
    }
    Ok(())
}

/// Failure classification for one pipeline stage.
enum StageFailure {
    /// Validation failure: quarantine, never retry.
    Invalid(String),
    /// Worth retrying later.
    Transient(String),
    /// Permanent, but the sender should hear about it.
    Bounce(String),
}

async fn process_item(ctx: &ProcessorContext, retries: &RetryQueue, item: WorkItem) {
    let Some(locked_dir) = lock_message(ctx, item.id).await else {
        // Someone else owns it, or it is already gone.
        return;
    };

    match run_pipeline(ctx, item.id, &locked_dir).await {
        Ok(()) => {}
        Err(StageFailure::Invalid(reason)) => {
            tracing::warn!(id = %item.id, reason, "message failed validation; quarantining");
            quarantine(ctx, item.id, &locked_dir, &reason).await;
        }
        Err(StageFailure::Transient(reason)) => {
            let now = unix_now();
            if now.saturating_sub(item.first_seen) >= ctx.config.retry_budget_secs {
                tracing::warn!(id = %item.id, reason, "retry budget exhausted; bouncing");
                bounce::bounce(ctx, item.id, &locked_dir, "delivery retries exhausted").await;
                return;
            }
            let delay = backoff_secs(item.attempt, &ctx.config);
            tracing::info!(id = %item.id, reason, delay, attempt = item.attempt, "delivery will retry");
            if unlock_message(ctx, item.id, &locked_dir).await {
                retries.schedule(now + delay, item.next_attempt());
            }
        }
        Err(StageFailure::Bounce(reason)) => {
            tracing::warn!(id = %item.id, reason, "delivery failed permanently; bouncing");
            bounce::bounce(ctx, item.id, &locked_dir, &reason).await;
        }
    }
}

/// `min(2^attempt · base, cap)` plus up to half the base of jitter.
fn backoff_secs(attempt: u32, config: &ProcessorConfig) -> u64 {
    let base = config.retry_base_secs.max(1);
    let exp = base.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = exp.min(config.retry_cap_secs.max(base));
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    capped + jitter
}

async fn lock_message(ctx: &ProcessorContext, id: Uuid) -> Option<PathBuf> {
    let source = ctx.store.message_dir(Section::Processing, id);
    let locked = ctx
        .store
        .section_dir(Section::Processing)
        .join(format!("{id}.lock.{}", std::process::id()));
    match fs::rename(&source, &locked).await {
        Ok(()) => Some(locked),
        Err(_) => None,
    }
}

async fn unlock_message(ctx: &ProcessorContext, id: Uuid, locked_dir: &PathBuf) -> bool {
    let target = ctx.store.message_dir(Section::Processing, id);
    match fs::rename(locked_dir, &target).await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(error = ?err, id = %id, "unlocking message failed");
            false
        }
    }
}

async fn quarantine(ctx: &ProcessorContext, id: Uuid, locked_dir: &PathBuf, reason: &str) {
    let target = ctx.store.message_dir(Section::Dead, id);
    if let Err(err) = fs::rename(locked_dir, &target).await {
        tracing::error!(error = ?err, id = %id, "quarantining message failed");
        return;
    }
    let note = serde_json::json!({ "reason": reason, "at": unix_now() });
    if let Err(err) =
        crate::storage::write_atomic(&target.join("quarantine.json"), note.to_string().as_bytes())
            .await
    {
        tracing::warn!(error = ?err, id = %id, "writing quarantine note failed");
    }
    ctx.observability.record_quarantined();
}

/// The VERIFY → ROUTE → DELIVER pipeline for one locked message.
async fn run_pipeline(
    ctx: &ProcessorContext,
    id: Uuid,
    locked_dir: &PathBuf,
) -> Result<(), StageFailure> {
    let header = verify(ctx, locked_dir).await?;

    match route(ctx, &header).await? {
        Route::Local => deliver_local(ctx, id, locked_dir, &header).await,
        Route::Remote(routing) => relay::deliver_remote(ctx, id, locked_dir, &routing).await,
    }
}

async fn verify(ctx: &ProcessorContext, locked_dir: &PathBuf) -> Result<Header, StageFailure> {
    let header_path = locked_dir.join(HEADER_FILE);
    let header_len = fs::metadata(&header_path)
        .await
        .map_err(|err| StageFailure::Invalid(format!("header unreadable: {err}")))?
        .len();
    if header_len > MAX_HEADER_BYTES {
        return Err(StageFailure::Invalid("header exceeds size bound".to_string()));
    }
    let catalog_len = fs::metadata(locked_dir.join(CATALOG_FILE))
        .await
        .map_err(|err| StageFailure::Invalid(format!("catalog unreadable: {err}")))?
        .len();
    if catalog_len > MAX_CATALOG_BYTES {
        return Err(StageFailure::Invalid("catalog exceeds size bound".to_string()));
    }

    let bytes = fs::read(&header_path)
        .await
        .map_err(|err| StageFailure::Invalid(format!("header unreadable: {err}")))?;
    let header: Header = serde_json::from_slice(&bytes)
        .map_err(|err| StageFailure::Invalid(format!("header malformed: {err}")))?;

    // The sender's published key must match the one embedded in the
    // header, and the client signature must hold under it.
    let sender = match ctx.resolver.address(&header.from.addr).await {
        Ok(info) => info,
        Err(ResolveError::NotFound) => {
            return Err(StageFailure::Invalid("sender address unknown".to_string()));
        }
        Err(ResolveError::Transport(err)) => {
            return Err(StageFailure::Transient(format!("resolver unavailable: {err}")));
        }
        Err(err) => {
            return Err(StageFailure::Invalid(format!("sender record rejected: {err}")));
        }
    };
    if sender.public_key != header.from.public_key {
        return Err(StageFailure::Invalid(
            "header key does not match published sender key".to_string(),
        ));
    }
    if !verify_client_header(&header) {
        return Err(StageFailure::Invalid("client signature invalid".to_string()));
    }
    if !verify_server_header(&header, &ctx.identity.keypair.public) {
        return Err(StageFailure::Invalid("server signature invalid".to_string()));
    }

    Ok(header)
}

enum Route {
    Local,
    Remote(RoutingInfo),
}

async fn route(ctx: &ProcessorContext, header: &Header) -> Result<Route, StageFailure> {
    let recipient = match ctx.resolver.address(&header.to.addr).await {
        Ok(info) => info,
        Err(ResolveError::NotFound) => {
            return Err(StageFailure::Bounce("recipient address unknown".to_string()));
        }
        Err(ResolveError::Transport(err)) => {
            return Err(StageFailure::Transient(format!("resolver unavailable: {err}")));
        }
        Err(err) => {
            return Err(StageFailure::Bounce(format!("recipient record rejected: {err}")));
        }
    };

    if recipient.routing_id == ctx.identity.routing_id {
        return Ok(Route::Local);
    }

    match ctx.resolver.routing(&recipient.routing_id).await {
        Ok(routing) => Ok(Route::Remote(routing)),
        Err(ResolveError::NotFound) => {
            Err(StageFailure::Bounce("recipient server unknown".to_string()))
        }
        Err(ResolveError::Transport(err)) => {
            Err(StageFailure::Transient(format!("resolver unavailable: {err}")))
        }
        Err(err) => Err(StageFailure::Bounce(format!(
            "recipient server record rejected: {err}"
        ))),
    }
}

async fn deliver_local(
    ctx: &ProcessorContext,
    id: Uuid,
    locked_dir: &PathBuf,
    header: &Header,
) -> Result<(), StageFailure> {
    let account = header.to.addr;
    match ctx.store.account(&account).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(StageFailure::Bounce(
                "recipient has no account on this server".to_string(),
            ));
        }
        Err(err) => {
            return Err(StageFailure::Transient(format!("account lookup failed: {err}")));
        }
    }

    let target = ctx
        .store
        .boxed_message_dir(&account, crate::storage::mailbox::INBOX, id);
    if fs::try_exists(&target).await.unwrap_or(false) {
        // Already delivered by an earlier attempt: drop the duplicate.
        let _ = fs::remove_dir_all(locked_dir).await;
        return Ok(());
    }
    fs::rename(locked_dir, &target)
        .await
        .map_err(|err| StageFailure::Transient(format!("mailbox rename failed: {err}")))?;

    let now = unix_now();
    ctx.store
        .index_message(&account, crate::storage::mailbox::INBOX, id, now)
        .await
        .map_err(|err| StageFailure::Transient(format!("mailbox index failed: {err}")))?;

    ctx.notifier.notify(&account, id);
    ctx.observability.record_processed_ok();
    tracing::info!(id = %id, account = %account, "message delivered locally");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;

    #[test]
    fn backoff_grows_and_caps() {
        let config = ProcessorConfig {
            workers: 1,
            retry_base_secs: 30,
            retry_cap_secs: 3_600,
            retry_budget_secs: 72 * 3_600,
            gc_interval_secs: 300,
        };
        let jitter_bound = config.retry_base_secs / 2;

        let first = backoff_secs(0, &config);
        assert!((30..=30 + jitter_bound).contains(&first));

        let third = backoff_secs(2, &config);
        assert!((120..=120 + jitter_bound).contains(&third));

        let huge = backoff_secs(30, &config);
        assert!((3_600..=3_600 + jitter_bound).contains(&huge));
    }

    #[test]
    fn retry_queue_releases_only_due_items() {
        let queue = RetryQueue::default();
        let a = WorkItem::new(Uuid::new_v4(), 0);
        let b = WorkItem::new(Uuid::new_v4(), 0);
        queue.schedule(100, a);
        queue.schedule(200, b);

        let due = queue.take_due(150);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, a.id);

        queue.flush();
        let due = queue.take_due(0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, b.id);
    }

    #[test]
    fn work_item_attempts_advance() {
        let item = WorkItem::new(Uuid::new_v4(), 42);
        let next = item.next_attempt();
        assert_eq!(next.attempt, 1);
        assert_eq!(next.first_seen, 42);
        assert_eq!(next.id, item.id);
    }
}
