//! Verified resolver lookups.
//!
//! Wraps a raw [`Resolver`] transport and refuses to hand out any record
//! that fails its self-signature, falls below the resolver's advertised
//! proof-of-work threshold, or regresses the serial seen in the local
//! cache. Unknown hashes are negatively cached for a short window so the
//! processor's retry loop does not hammer the resolver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use maelum_core::AddressHash;

use crate::records::{AddressInfo, ResolverConfig, RoutingInfo};
use crate::{ResolveError, Resolver};

/// How long an unknown hash stays negatively cached.
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct ResolverService {
    repo: Arc<dyn Resolver>,
    serials: Mutex<HashMap<AddressHash, u64>>,
    negative: Mutex<HashMap<AddressHash, Instant>>,
}

impl ResolverService {
    #[must_use]
    pub fn new(repo: Arc<dyn Resolver>) -> Self {
        Self {
            repo,
            serials: Mutex::new(HashMap::new()),
            negative: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves and verifies an address record.
    pub async fn address(&self, hash: &AddressHash) -> Result<AddressInfo, ResolveError> {
        if self.negatively_cached(hash) {
            return Err(ResolveError::NotFound);
        }

        let info = match self.repo.address(hash).await {
            Ok(info) => info,
            Err(ResolveError::NotFound) => {
                self.negative
                    .lock()
                    .expect("negative cache poisoned")
                    .insert(*hash, Instant::now());
                return Err(ResolveError::NotFound);
            }
            Err(err) => return Err(err),
        };

        if !info.verify() {
            return Err(ResolveError::InvalidSignature);
        }

        let required = self.repo.config().await?.pow_bits;
        if !info.pow_meets(required) {
            return Err(ResolveError::InsufficientPow { required });
        }

        let mut serials = self.serials.lock().expect("serial cache poisoned");
        if let Some(&known) = serials.get(hash) {
            if info.serial < known {
                return Err(ResolveError::SerialRegression {
                    offered: info.serial,
                    known,
                });
            }
        }
        serials.insert(*hash, info.serial);

        Ok(info)
    }

    /// Resolves and verifies a routing record.
    pub async fn routing(&self, routing_id: &str) -> Result<RoutingInfo, ResolveError> {
        let info = self.repo.routing(routing_id).await?;
        if !info.verify() {
            return Err(ResolveError::InvalidSignature);
        }
        Ok(info)
    }

    /// Returns the resolver's advertised policy.
    pub async fn config(&self) -> Result<ResolverConfig, ResolveError> {
        self.repo.config().await
    }

    /// The underlying transport, for publication flows.
    #[must_use]
    pub fn repo(&self) -> Arc<dyn Resolver> {
        Arc::clone(&self.repo)
    }

    fn negatively_cached(&self, hash: &AddressHash) -> bool {
        let mut negative = self.negative.lock().expect("negative cache poisoned");
        match negative.get(hash) {
            Some(since) if since.elapsed() < NEGATIVE_CACHE_TTL => true,
            Some(_) => {
                negative.remove(hash);
                false
            }
            None => false,
        }
    }
}
