//! In-process resolver repository.
//!
//! Backs single-node deployments and every test that needs a resolver
//! without the network. Publication applies the same acceptance rules the
//! public service applies: valid self-signature, sufficient proof of work,
//! and non-regressing serials.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use maelum_core::AddressHash;

use crate::records::{AddressInfo, OrganisationInfo, ResolverConfig, RoutingInfo};
use crate::{ResolveError, Resolver};

pub struct MemoryResolver {
    config: ResolverConfig,
    addresses: Mutex<HashMap<AddressHash, AddressInfo>>,
    routings: Mutex<HashMap<String, RoutingInfo>>,
    organisations: Mutex<HashMap<AddressHash, OrganisationInfo>>,
}

impl MemoryResolver {
    #[must_use]
    pub fn new(pow_bits: u8) -> Self {
        Self {
            config: ResolverConfig { pow_bits },
            addresses: Mutex::new(HashMap::new()),
            routings: Mutex::new(HashMap::new()),
            organisations: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Resolver for MemoryResolver {
    async fn address(&self, hash: &AddressHash) -> Result<AddressInfo, ResolveError> {
        self.addresses
            .lock()
            .expect("address table poisoned")
            .get(hash)
            .cloned()
            .ok_or(ResolveError::NotFound)
    }

    async fn routing(&self, routing_id: &str) -> Result<RoutingInfo, ResolveError> {
        self.routings
            .lock()
            .expect("routing table poisoned")
            .get(routing_id)
            .cloned()
            .ok_or(ResolveError::NotFound)
    }

    async fn organisation(&self, hash: &AddressHash) -> Result<OrganisationInfo, ResolveError> {
        self.organisations
            .lock()
            .expect("organisation table poisoned")
            .get(hash)
            .cloned()
            .ok_or(ResolveError::NotFound)
    }

    async fn config(&self) -> Result<ResolverConfig, ResolveError> {
        Ok(self.config)
    }

    async fn publish_address(&self, info: &AddressInfo) -> Result<(), ResolveError> {
        if !info.verify() {
            return Err(ResolveError::InvalidSignature);
        }
        if !info.pow_meets(self.config.pow_bits) {
            return Err(ResolveError::InsufficientPow {
                required: self.config.pow_bits,
            });
        }
        let mut addresses = self.addresses.lock().expect("address table poisoned");
        if let Some(existing) = addresses.get(&info.address_hash) {
            if info.serial < existing.serial {
                return Err(ResolveError::SerialRegression {
                    offered: info.serial,
                    known: existing.serial,
                });
            }
        }
        addresses.insert(info.address_hash, info.clone());
        Ok(())
    }

    async fn publish_routing(&self, info: &RoutingInfo) -> Result<(), ResolveError> {
        if !info.verify() {
            return Err(ResolveError::InvalidSignature);
        }
        self.routings
            .lock()
            .expect("routing table poisoned")
            .insert(info.routing_id.clone(), info.clone());
        Ok(())
    }

    async fn publish_organisation(&self, info: &OrganisationInfo) -> Result<(), ResolveError> {
        if !info.verify() {
            return Err(ResolveError::InvalidSignature);
        }
        if !info.pow_meets(self.config.pow_bits) {
            return Err(ResolveError::InsufficientPow {
                required: self.config.pow_bits,
            });
        }
        let mut organisations = self
            .organisations
            .lock()
            .expect("organisation table poisoned");
        if let Some(existing) = organisations.get(&info.org_hash) {
            if info.serial < existing.serial {
                return Err(ResolveError::SerialRegression {
                    offered: info.serial,
                    known: existing.serial,
                });
            }
        }
        organisations.insert(info.org_hash, info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maelum_core::{Address, KeyPair, KeyType, ProofOfWork};

    fn signed_info(pair: &KeyPair, serial: u64) -> AddressInfo {
        let hash = Address::parse("alice!").unwrap().hash();
        let mut pow = ProofOfWork::new(8, hash.to_string());
        pow.work();
        let mut info = AddressInfo {
            address_hash: hash,
            public_key: pair.public.clone(),
            routing_id: "cafe01".to_string(),
            pow: pow.to_string(),
            serial,
            signature: String::new(),
        };
        info.sign(&pair.private).unwrap();
        info
    }

    #[tokio::test]
    async fn publish_then_resolve() {
        let resolver = MemoryResolver::new(8);
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        let info = signed_info(&pair, 1);

        resolver.publish_address(&info).await.unwrap();
        let fetched = resolver.address(&info.address_hash).await.unwrap();
        assert_eq!(fetched, info);
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let resolver = MemoryResolver::new(8);
        let hash = Address::parse("ghost!").unwrap().hash();
        assert!(matches!(
            resolver.address(&hash).await,
            Err(ResolveError::NotFound)
        ));
    }

    #[tokio::test]
    async fn serial_regression_is_rejected() {
        let resolver = MemoryResolver::new(8);
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();

        resolver.publish_address(&signed_info(&pair, 5)).await.unwrap();
        let stale = signed_info(&pair, 4);
        assert!(matches!(
            resolver.publish_address(&stale).await,
            Err(ResolveError::SerialRegression { offered: 4, known: 5 })
        ));
        resolver.publish_address(&signed_info(&pair, 5)).await.unwrap();
    }

    #[tokio::test]
    async fn weak_pow_is_rejected() {
        let resolver = MemoryResolver::new(32);
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        let info = signed_info(&pair, 1);
        assert!(matches!(
            resolver.publish_address(&info).await,
            Err(ResolveError::InsufficientPow { required: 32 })
        ));
    }

    #[tokio::test]
    async fn tampered_record_is_rejected() {
        let resolver = MemoryResolver::new(8);
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        let mut info = signed_info(&pair, 1);
        info.routing_id = "beef02".to_string();
        assert!(matches!(
            resolver.publish_address(&info).await,
            Err(ResolveError::InvalidSignature)
        ));
    }
}
