//! Dual key exchange: a randomized, stealth-address-style ECDH.
//!
//! The sender draws a fresh scalar `r` and publishes `(P, R)` alongside the
//! message; only the holder of the recipient's long-term Ed25519 private
//! key can recompute `P` and thereby recover the shared secret `D`. The
//! construction is non-deterministic: two exchanges against the same
//! recipient key produce unrelated transaction ids.
//!
//! Ed25519 keys are converted to X25519 for the Diffie-Hellman step; `Hs`
//! is Keccak-256 reduced mod the Ed25519 group order ℓ and reinterpreted
//! as an Ed25519 seed.

use std::fmt;
use std::str::FromStr;

use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::keys::{ed25519_signing_key, Capability, KeyType, PrivateKey, PublicKey};

/// Length in bytes of each transaction id component.
pub const TXID_COMPONENT_LEN: usize = 32;

/// Errors returned by the dual key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KexError {
    #[error("dual key exchange requires an ed25519 key, got {0}")]
    UnsupportedKeyType(KeyType),
    #[error("malformed ed25519 key material")]
    MalformedKey,
    #[error("transaction id must be 64 bytes of P ∥ R")]
    MalformedTransactionId,
}

/// The public `(P, R)` tag published with a message. Only the recipient can
/// validate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId {
    p: [u8; TXID_COMPONENT_LEN],
    r: [u8; TXID_COMPONENT_LEN],
}

impl TransactionId {
    #[must_use]
    pub const fn new(p: [u8; TXID_COMPONENT_LEN], r: [u8; TXID_COMPONENT_LEN]) -> Self {
        Self { p, r }
    }

    #[must_use]
    pub const fn p(&self) -> &[u8; TXID_COMPONENT_LEN] {
        &self.p
    }

    #[must_use]
    pub const fn r(&self) -> &[u8; TXID_COMPONENT_LEN] {
        &self.r
    }

    /// Parses the hex form `hex(P ∥ R)`.
    pub fn parse(input: &str) -> Result<Self, KexError> {
        let bytes = hex::decode(input).map_err(|_| KexError::MalformedTransactionId)?;
        if bytes.len() != 2 * TXID_COMPONENT_LEN {
            return Err(KexError::MalformedTransactionId);
        }
        let mut p = [0u8; TXID_COMPONENT_LEN];
        let mut r = [0u8; TXID_COMPONENT_LEN];
        p.copy_from_slice(&bytes[..TXID_COMPONENT_LEN]);
        r.copy_from_slice(&bytes[TXID_COMPONENT_LEN..]);
        Ok(Self { p, r })
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.p.iter().chain(self.r.iter()) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for TransactionId {
    type Err = KexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TransactionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct TransactionIdVisitor;

impl Visitor<'_> for TransactionIdVisitor {
    type Value = TransactionId;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a 128-character hexadecimal transaction id")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: DeError,
    {
        TransactionId::parse(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(TransactionIdVisitor)
    }
}

/// Runs the sender side of the exchange against the recipient's public key.
/// Returns the 32-byte shared secret and the transaction id to publish.
pub fn dual_key_exchange(
    recipient: &PublicKey,
) -> Result<([u8; 32], TransactionId), KexError> {
    if !recipient.key_type().supports(Capability::Derive) {
        return Err(KexError::UnsupportedKeyType(recipient.key_type()));
    }
    let recipient_key_bytes: &[u8; 32] = recipient
        .as_bytes()
        .try_into()
        .map_err(|_| KexError::MalformedKey)?;
    let recipient_key = verifying_key(recipient_key_bytes)?;

    // r is 32 uniform bytes reduced mod ℓ, then treated as an Ed25519 seed.
    let r_key = SigningKey::from_bytes(&random_scalar());
    let r_public = r_key.verifying_key();

    // D = r·A over X25519 after Ed25519→X25519 conversion of both sides.
    let shared = x25519_dalek::x25519(
        r_key.to_scalar_bytes(),
        recipient_key.to_montgomery().to_bytes(),
    );

    // P = f·G where f = Hs(D).
    let p_key = SigningKey::from_bytes(&hs(&shared));
    let p_public = p_key.verifying_key();

    Ok((
        shared,
        TransactionId::new(p_public.to_bytes(), r_public.to_bytes()),
    ))
}

/// Runs the recipient side: recomputes `P'` from `R` and the private key
/// and returns the shared secret iff it matches the published `P`. The
/// comparison is constant-time.
pub fn dual_key_get_secret(
    private: &PrivateKey,
    txid: &TransactionId,
) -> Result<Option<[u8; 32]>, KexError> {
    if !private.key_type().supports(Capability::Derive) {
        return Err(KexError::UnsupportedKeyType(private.key_type()));
    }
    let signing = ed25519_signing_key(private.as_bytes()).map_err(|_| KexError::MalformedKey)?;
    let r_public = verifying_key(txid.r())?;

    // D' = a·R
    let shared = x25519_dalek::x25519(
        signing.to_scalar_bytes(),
        r_public.to_montgomery().to_bytes(),
    );

    // P' = f'·G with f' = Hs(D'); accept iff P' = P.
    let p_key = SigningKey::from_bytes(&hs(&shared));
    let p_prime = p_key.verifying_key().to_bytes();

    if p_prime.as_slice().ct_eq(txid.p().as_slice()).into() {
        Ok(Some(shared))
    } else {
        Ok(None)
    }
}

/// 32 uniform CSPRNG bytes reduced mod ℓ.
fn random_scalar() -> [u8; 32] {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    Scalar::from_bytes_mod_order(buf).to_bytes()
}

/// `Hs(b)`: Keccak-256 of `b` reduced mod ℓ, usable as an Ed25519 seed.
fn hs(b: &[u8; 32]) -> [u8; 32] {
    let digest = Keccak256::digest(b);
    let bytes: [u8; 32] = digest
        .as_slice()
        .try_into()
        .expect("keccak-256 digest should be 32 bytes");
    Scalar::from_bytes_mod_order(bytes).to_bytes()
}

fn verifying_key(bytes: &[u8; 32]) -> Result<VerifyingKey, KexError> {
    VerifyingKey::from_bytes(bytes).map_err(|_| KexError::MalformedKey)
}
