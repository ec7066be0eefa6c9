//! Resolver record types and their self-signatures.
//!
//! Every record embeds the public key it speaks for and a detached
//! signature by that key over the canonical JSON of the record with the
//! signature field emptied. `serial` increases monotonically across
//! updates so stale records cannot displace fresh ones.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use maelum_core::canonical::to_canonical_vec;
use maelum_core::{AddressHash, KeyError, PrivateKey, ProofOfWork, PublicKey};

/// Account record: where an address hash lives and which key it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address_hash: AddressHash,
    pub public_key: PublicKey,
    pub routing_id: String,
    pub pow: String,
    pub serial: u64,
    #[serde(default)]
    pub signature: String,
}

/// Server record: routing id, routing key, and the reachable endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub routing_id: String,
    pub public_key: PublicKey,
    pub routing: String,
    #[serde(default)]
    pub signature: String,
}

/// Organisation record: the org hash and its signing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganisationInfo {
    pub org_hash: AddressHash,
    pub public_key: PublicKey,
    pub pow: String,
    pub serial: u64,
    #[serde(default)]
    pub signature: String,
}

/// Resolver-wide policy advertised on `/config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub pow_bits: u8,
}

macro_rules! impl_self_signed {
    ($record:ident) => {
        impl $record {
            /// Signs the record in place with its own private key.
            pub fn sign(&mut self, key: &PrivateKey) -> Result<(), KeyError> {
                self.signature.clear();
                let bytes = to_canonical_vec(self)
                    .map_err(|err| KeyError::Signing(err.to_string()))?;
                self.signature = BASE64.encode(key.sign(&bytes)?);
                Ok(())
            }

            /// Verifies the self-signature against the embedded public key.
            /// Fails closed on any decoding error.
            #[must_use]
            pub fn verify(&self) -> bool {
                if self.signature.is_empty() {
                    return false;
                }
                let Ok(signature) = BASE64.decode(&self.signature) else {
                    return false;
                };
                let mut unsigned = self.clone();
                unsigned.signature.clear();
                let Ok(bytes) = to_canonical_vec(&unsigned) else {
                    return false;
                };
                self.public_key.verify(&bytes, &signature)
            }
        }
    };
}

impl_self_signed!(AddressInfo);
impl_self_signed!(RoutingInfo);
impl_self_signed!(OrganisationInfo);

impl AddressInfo {
    /// Parses and checks the record's address proof of work: the challenge
    /// must be the address hash itself and meet `required_bits`.
    #[must_use]
    pub fn pow_meets(&self, required_bits: u8) -> bool {
        let Ok(pow) = self.pow.parse::<ProofOfWork>() else {
            return false;
        };
        pow.challenge == self.address_hash.to_string()
            && pow.bits >= required_bits
            && pow.is_valid()
    }
}

impl OrganisationInfo {
    /// Same proof-of-work rule as address records, over the org hash.
    #[must_use]
    pub fn pow_meets(&self, required_bits: u8) -> bool {
        let Ok(pow) = self.pow.parse::<ProofOfWork>() else {
            return false;
        };
        pow.challenge == self.org_hash.to_string() && pow.bits >= required_bits && pow.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maelum_core::{Address, KeyPair, KeyType};

    fn signed_address_info(serial: u64) -> (AddressInfo, KeyPair) {
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
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
        (info, pair)
    }

    #[test]
    fn self_signature_round_trip() {
        let (info, _) = signed_address_info(1);
        assert!(info.verify());
    }

    #[test]
    fn mutated_record_fails_verification() {
        let (mut info, _) = signed_address_info(1);
        info.routing_id = "beef02".to_string();
        assert!(!info.verify());
    }

    #[test]
    fn unsigned_or_garbage_signature_fails_closed() {
        let (mut info, _) = signed_address_info(1);
        info.signature.clear();
        assert!(!info.verify());
        info.signature = "!!!".to_string();
        assert!(!info.verify());
    }

    #[test]
    fn pow_check_binds_challenge_and_bits() {
        let (info, _) = signed_address_info(1);
        assert!(info.pow_meets(8));
        assert!(info.pow_meets(4));
        assert!(!info.pow_meets(9));

        let mut wrong = info.clone();
        wrong.pow = "8$unrelated-challenge$0".to_string();
        assert!(!wrong.pow_meets(8));
    }

    #[test]
    fn routing_info_self_signs() {
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        let mut info = RoutingInfo {
            routing_id: "cafe01".to_string(),
            public_key: pair.public.clone(),
            routing: "mail.example.org:2424".to_string(),
            signature: String::new(),
        };
        info.sign(&pair.private).unwrap();
        assert!(info.verify());
        info.routing = "evil.example.org:2424".to_string();
        assert!(!info.verify());
    }
}
