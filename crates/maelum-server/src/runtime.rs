//! Wires configuration, storage, repositories, the processor pool, and the
//! HTTP transport into one running server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use maelum_resolver::{
    HttpResolver, MemoryResolver, Resolver, ResolverService, RoutingInfo,
};

use crate::config::ServerConfig;
use crate::identity::RoutingIdentity;
use crate::observability::ServerObservability;
use crate::processor::{self, ProcessorContext, ProcessorPool};
use crate::repos::{ApiKeyRepo, SubscriptionRepo, TicketRepo};
use crate::server::ServerHandle;
use crate::state::{AppState, Notifier};
use crate::storage::MessageStore;

/// Grace period for in-flight work on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

pub struct Runtime {
    server: ServerHandle,
    pool: ProcessorPool,
    cancel: CancellationToken,
    state: AppState,
    listen_addr: SocketAddr,
}

impl Runtime {
    /// Starts the server with the resolver chosen by configuration: the
    /// public HTTP resolver when `resolver_url` is set, an in-process one
    /// otherwise.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let resolver: Arc<dyn Resolver> = match config.resolver_url.as_deref() {
            Some(url) => Arc::new(
                HttpResolver::new(url)
                    .map_err(|err| anyhow::anyhow!("constructing resolver client: {err}"))?,
            ),
            None => Arc::new(MemoryResolver::new(config.admission.pow_bits)),
        };
        Self::start_with_resolver(config, resolver).await
    }

    /// Starts the server against an externally constructed resolver.
    /// Tests and embedded deployments share a [`MemoryResolver`] between
    /// several runtimes this way.
    pub async fn start_with_resolver(
        config: ServerConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        let store = MessageStore::bootstrap(&config.data_dir).await?;
        let identity = RoutingIdentity::load_or_generate(&store).await?;
        let subscriptions = SubscriptionRepo::load(store.state_dir()).await?;
        let apikeys = ApiKeyRepo::load(store.state_dir()).await?;
        let resolver_service = Arc::new(ResolverService::new(Arc::clone(&resolver)));
        let observability = ServerObservability::new();
        let notifier = Notifier::new();
        let tickets = Arc::new(TicketRepo::new());
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding server listener on {}", config.listen))?;
        let listen_addr = listener
            .local_addr()
            .context("reading bound listener address")?;

        publish_routing(&identity, listen_addr, resolver.as_ref()).await?;

        let (handle, pool) = processor::spawn(
            ProcessorContext {
                store: store.clone(),
                identity: identity.clone(),
                resolver: Arc::clone(&resolver_service),
                tickets: Arc::clone(&tickets),
                observability: observability.clone(),
                notifier: notifier.clone(),
                config: config.processor,
            },
            cancel.child_token(),
        )
        .await?;

        let state = AppState::new(
            config,
            store,
            identity,
            tickets,
            subscriptions,
            apikeys,
            resolver_service,
            observability,
            handle,
            notifier,
        );

        let server = ServerHandle::spawn(listener, state.clone()).await?;
        tracing::info!(listen = %listen_addr, "maelum server running");

        Ok(Self {
            server,
            pool,
            cancel,
            state,
            listen_addr,
        })
    }

    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stops pulling new work, drains in-flight items up to the soft
    /// deadline, then closes the transport.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        if tokio::time::timeout(DRAIN_DEADLINE, self.pool.join())
            .await
            .is_err()
        {
            tracing::warn!("processor drain deadline exceeded; aborting workers");
        }
        self.server.shutdown().await
    }
}

/// Registers this server's routing record so peers can find it.
async fn publish_routing(
    identity: &RoutingIdentity,
    listen_addr: SocketAddr,
    resolver: &dyn Resolver,
) -> Result<()> {
    let mut info = RoutingInfo {
        routing_id: identity.routing_id.clone(),
        public_key: identity.keypair.public.clone(),
        routing: listen_addr.to_string(),
        signature: String::new(),
    };
    info.sign(&identity.keypair.private)
        .context("signing routing record")?;
    match resolver.publish_routing(&info).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // A resolver outage must not stop the server from booting; the
            // record can be re-published later.
            tracing::warn!(error = %err, "publishing routing record failed");
            Ok(())
        }
    }
}
