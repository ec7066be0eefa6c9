//! Client for the maelum resolver: the public lookup oracle mapping
//! address hashes to keys and routing ids, and routing ids to servers.
//!
//! The raw transport (`MemoryResolver` for in-process use and tests,
//! `HttpResolver` for the real service) sits behind the [`Resolver`]
//! trait; [`ResolverService`] wraps a transport and enforces the trust
//! rules (self-signatures, proof-of-work thresholds, serial monotonicity,
//! and a short negative cache) so callers never see an unverified record.

mod dns;
mod http;
mod memory;
mod records;
mod service;

use async_trait::async_trait;
use thiserror::Error;

pub use dns::{ReservedNameGuard, StaticTxtLookup, TxtLookup};
pub use http::HttpResolver;
pub use memory::MemoryResolver;
pub use records::{AddressInfo, OrganisationInfo, ResolverConfig, RoutingInfo};
pub use service::ResolverService;

use maelum_core::AddressHash;

/// Errors surfaced by resolver lookups and publication.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("record not found")]
    NotFound,
    #[error("record self-signature is invalid")]
    InvalidSignature,
    #[error("record proof of work does not meet {required} bits")]
    InsufficientPow { required: u8 },
    #[error("record serial {offered} regresses below known serial {known}")]
    SerialRegression { offered: u64, known: u64 },
    #[error("name {name} is reserved and not proven via DNS")]
    ReservedName { name: String },
    #[error("resolver transport failed: {0}")]
    Transport(String),
}

/// Raw record transport. Implementations store or fetch records without
/// applying trust rules; [`ResolverService`] layers those on top.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn address(&self, hash: &AddressHash) -> Result<AddressInfo, ResolveError>;
    async fn routing(&self, routing_id: &str) -> Result<RoutingInfo, ResolveError>;
    async fn organisation(&self, hash: &AddressHash) -> Result<OrganisationInfo, ResolveError>;
    async fn config(&self) -> Result<ResolverConfig, ResolveError>;

    async fn publish_address(&self, info: &AddressInfo) -> Result<(), ResolveError>;
    async fn publish_routing(&self, info: &RoutingInfo) -> Result<(), ResolveError>;
    async fn publish_organisation(&self, info: &OrganisationInfo) -> Result<(), ResolveError>;
}
