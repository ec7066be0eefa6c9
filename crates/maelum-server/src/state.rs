//! Shared server state handed to every handler.
//!
//! Built once at startup and passed explicitly; nothing reads global
//! state after initialisation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use uuid::Uuid;

use maelum_resolver::ResolverService;

use crate::config::ServerConfig;
use crate::identity::RoutingIdentity;
use crate::observability::ServerObservability;
use crate::processor::ProcessorHandle;
use crate::repos::{ApiKeyRepo, ChallengeRepo, SubscriptionRepo, TicketRepo};
use crate::storage::MessageStore;

use maelum_core::AddressHash;

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        Err(_) => 0,
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

pub struct AppInner {
    pub config: ServerConfig,
    pub store: MessageStore,
    pub identity: RoutingIdentity,
    pub tickets: Arc<TicketRepo>,
    pub challenges: ChallengeRepo,
    pub subscriptions: SubscriptionRepo,
    pub apikeys: ApiKeyRepo,
    pub resolver: Arc<ResolverService>,
    pub observability: ServerObservability,
    pub processor: ProcessorHandle,
    pub notifier: Notifier,
    ticket_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        store: MessageStore,
        identity: RoutingIdentity,
        tickets: Arc<TicketRepo>,
        subscriptions: SubscriptionRepo,
        apikeys: ApiKeyRepo,
        resolver: Arc<ResolverService>,
        observability: ServerObservability,
        processor: ProcessorHandle,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(AppInner {
                config,
                store,
                identity,
                tickets,
                challenges: ChallengeRepo::new(),
                subscriptions,
                apikeys,
                resolver,
                observability,
                processor,
                notifier,
                ticket_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Per-ticket mutex serialising the upload steps of one ticket.
    pub fn ticket_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .ticket_locks
            .lock()
            .expect("ticket lock table poisoned");
        Arc::clone(locks.entry(id).or_default())
    }

    /// Drops the upload lock once a ticket is finalised or aborted.
    pub fn release_ticket_lock(&self, id: Uuid) {
        self.inner
            .ticket_locks
            .lock()
            .expect("ticket lock table poisoned")
            .remove(&id);
    }
}

impl std::ops::Deref for AppState {
    type Target = AppInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Delivery notifications for long-polling fetchers, one broadcast channel
/// per account.
#[derive(Clone, Default)]
pub struct Notifier {
    channels: Arc<Mutex<HashMap<AddressHash, broadcast::Sender<Uuid>>>>,
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces a delivered message id to any waiting fetchers.
    pub fn notify(&self, account: &AddressHash, message_id: Uuid) {
        let channels = self.channels.lock().expect("notifier table poisoned");
        if let Some(sender) = channels.get(account) {
            let _ = sender.send(message_id);
        }
    }

    /// Subscribes to delivery events for an account.
    pub fn subscribe(&self, account: &AddressHash) -> broadcast::Receiver<Uuid> {
        let mut channels = self.channels.lock().expect("notifier table poisoned");
        channels
            .entry(*account)
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maelum_core::Address;

    #[tokio::test]
    async fn notifier_delivers_to_subscribers() {
        let notifier = Notifier::new();
        let account = Address::parse("bob!").unwrap().hash();
        let mut rx = notifier.subscribe(&account);

        let id = Uuid::new_v4();
        notifier.notify(&account, id);
        assert_eq!(rx.recv().await.unwrap(), id);
    }

    #[test]
    fn notify_without_subscribers_is_a_no_op() {
        let notifier = Notifier::new();
        let account = Address::parse("bob!").unwrap().hash();
        notifier.notify(&account, Uuid::new_v4());
    }
}
