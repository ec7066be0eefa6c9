//! Tagged key material and signature dispatch.
//!
//! Keys carry an algorithm tag plus opaque bytes; operations dispatch
//! through a small strategy table keyed on the tag. Ed25519 is mandatory
//! and is the only algorithm with the `derive` capability used by the dual
//! key exchange; RSA (PKCS#1 v1.5 over SHA-256) and ECDSA P-256 cover
//! accounts published with those key types.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::sha256_hex;

/// Errors returned by key parsing and signature operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unknown key algorithm {0:?}")]
    UnknownAlgorithm(String),
    #[error("{op} is not supported by {key_type} keys")]
    UnsupportedOperation {
        op: &'static str,
        key_type: KeyType,
    },
    #[error("malformed {key_type} key material")]
    MalformedKey { key_type: KeyType },
    #[error("malformed key string; expected \"<algorithm> <base64>\"")]
    MalformedKeyString,
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Ed25519,
    Rsa2048,
    EcdsaP256,
}

/// Operations an algorithm is able to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Sign,
    Verify,
    Derive,
}

impl KeyType {
    /// Returns the wire name of the algorithm.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            KeyType::Ed25519 => "ed25519",
            KeyType::Rsa2048 => "rsa",
            KeyType::EcdsaP256 => "ecdsa",
        }
    }

    /// Returns the capability set of the algorithm.
    #[must_use]
    pub const fn capabilities(self) -> &'static [Capability] {
        match self {
            KeyType::Ed25519 => &[Capability::Sign, Capability::Verify, Capability::Derive],
            KeyType::Rsa2048 | KeyType::EcdsaP256 => &[Capability::Sign, Capability::Verify],
        }
    }

    /// Returns `true` if the algorithm supports `cap`.
    #[must_use]
    pub fn supports(self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(KeyType::Ed25519),
            "rsa" => Ok(KeyType::Rsa2048),
            "ecdsa" => Ok(KeyType::EcdsaP256),
            other => Err(KeyError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Strategy table entry dispatching per-algorithm signature operations.
struct Algorithm {
    key_type: KeyType,
    sign: fn(&[u8], &[u8]) -> Result<Vec<u8>, KeyError>,
    verify: fn(&[u8], &[u8], &[u8]) -> bool,
}

const ALGORITHMS: &[Algorithm] = &[
    Algorithm {
        key_type: KeyType::Ed25519,
        sign: ed25519_sign,
        verify: ed25519_verify,
    },
    Algorithm {
        key_type: KeyType::Rsa2048,
        sign: rsa_sign,
        verify: rsa_verify,
    },
    Algorithm {
        key_type: KeyType::EcdsaP256,
        sign: ecdsa_sign,
        verify: ecdsa_verify,
    },
];

fn algorithm(key_type: KeyType) -> &'static Algorithm {
    ALGORITHMS
        .iter()
        .find(|alg| alg.key_type == key_type)
        .expect("algorithm table covers every key type")
}

/// A public key: algorithm tag plus canonical key bytes.
///
/// Serialised as the string `"<algorithm> <base64-bytes>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key_type: KeyType,
    bytes: Vec<u8>,
}

impl PublicKey {
    #[must_use]
    pub fn new(key_type: KeyType, bytes: Vec<u8>) -> Self {
        Self { key_type, bytes }
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex-encoded SHA-256 of the canonical key byte form.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.bytes)
    }

    /// Verifies a detached signature over `message`. Any decoding failure
    /// is a verification failure.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        (algorithm(self.key_type).verify)(&self.bytes, message, signature)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key_type, BASE64.encode(&self.bytes))
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key_type, bytes) = parse_key_string(s)?;
        Ok(Self { key_type, bytes })
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct PublicKeyVisitor;

impl Visitor<'_> for PublicKeyVisitor {
    type Value = PublicKey;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a \"<algorithm> <base64>\" public key string")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: DeError,
    {
        PublicKey::from_str(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(PublicKeyVisitor)
    }
}

/// A private key. Secret bytes are wiped on drop and never appear in
/// `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    #[zeroize(skip)]
    key_type: KeyType,
    bytes: Vec<u8>,
}

impl PrivateKey {
    #[must_use]
    pub fn new(key_type: KeyType, bytes: Vec<u8>) -> Self {
        Self { key_type, bytes }
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Produces a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        (algorithm(self.key_type).sign)(&self.bytes, message)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({}, [REDACTED])", self.key_type)
    }
}

impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key_type, BASE64.encode(&self.bytes))
    }
}

impl FromStr for PrivateKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key_type, bytes) = parse_key_string(s)?;
        Ok(Self { key_type, bytes })
    }
}

impl Serialize for PrivateKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct PrivateKeyVisitor;

impl Visitor<'_> for PrivateKeyVisitor {
    type Value = PrivateKey;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a \"<algorithm> <base64>\" private key string")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: DeError,
    {
        PrivateKey::from_str(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(PrivateKeyVisitor)
    }
}

/// A private/public key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generates a fresh key pair of the given algorithm.
    pub fn generate(key_type: KeyType) -> Result<Self, KeyError> {
        match key_type {
            KeyType::Ed25519 => {
                let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
                Ok(Self::from_ed25519(&signing))
            }
            KeyType::Rsa2048 => {
                let private = rsa::RsaPrivateKey::new(&mut OsRng, 2048)
                    .map_err(|err| KeyError::Generation(err.to_string()))?;
                let public = rsa::RsaPublicKey::from(&private);
                let private_der = private
                    .to_pkcs8_der()
                    .map_err(|err| KeyError::Generation(err.to_string()))?;
                let public_der = public
                    .to_public_key_der()
                    .map_err(|err| KeyError::Generation(err.to_string()))?;
                Ok(Self {
                    public: PublicKey::new(key_type, public_der.into_vec()),
                    private: PrivateKey::new(key_type, private_der.as_bytes().to_vec()),
                })
            }
            KeyType::EcdsaP256 => {
                let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
                let verifying = p256::ecdsa::VerifyingKey::from(&signing);
                Ok(Self {
                    public: PublicKey::new(
                        key_type,
                        verifying.to_encoded_point(true).as_bytes().to_vec(),
                    ),
                    private: PrivateKey::new(key_type, signing.to_bytes().to_vec()),
                })
            }
        }
    }

    /// Derives a deterministic Ed25519 key pair from a 32-byte master seed
    /// via HKDF-SHA256. Only Ed25519 carries the `derive` capability.
    pub fn derive_ed25519(seed: &[u8; 32]) -> Result<Self, KeyError> {
        let hk = hkdf::Hkdf::<Sha256>::new(None, seed);
        let mut okm = [0u8; 32];
        hk.expand(b"maelum/key/ed25519", &mut okm)
            .map_err(|err| KeyError::Generation(err.to_string()))?;
        let signing = ed25519_dalek::SigningKey::from_bytes(&okm);
        okm.zeroize();
        Ok(Self::from_ed25519(&signing))
    }

    fn from_ed25519(signing: &ed25519_dalek::SigningKey) -> Self {
        Self {
            public: PublicKey::new(
                KeyType::Ed25519,
                signing.verifying_key().to_bytes().to_vec(),
            ),
            private: PrivateKey::new(KeyType::Ed25519, signing.to_bytes().to_vec()),
        }
    }
}

fn parse_key_string(s: &str) -> Result<(KeyType, Vec<u8>), KeyError> {
    let (name, encoded) = s
        .split_once(' ')
        .ok_or(KeyError::MalformedKeyString)?;
    let key_type = KeyType::from_str(name)?;
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| KeyError::MalformedKeyString)?;
    Ok((key_type, bytes))
}

pub(crate) fn ed25519_signing_key(bytes: &[u8]) -> Result<ed25519_dalek::SigningKey, KeyError> {
    let seed: [u8; 32] = bytes.try_into().map_err(|_| KeyError::MalformedKey {
        key_type: KeyType::Ed25519,
    })?;
    Ok(ed25519_dalek::SigningKey::from_bytes(&seed))
}

pub(crate) fn ed25519_verifying_key(bytes: &[u8]) -> Result<ed25519_dalek::VerifyingKey, KeyError> {
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::MalformedKey {
        key_type: KeyType::Ed25519,
    })?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::MalformedKey {
        key_type: KeyType::Ed25519,
    })
}

fn ed25519_sign(key: &[u8], message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let signing = ed25519_signing_key(key)?;
    Ok(signing.sign(message).to_bytes().to_vec())
}

fn ed25519_verify(key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying) = ed25519_verifying_key(key) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    verifying.verify(message, &signature).is_ok()
}

fn rsa_sign(key: &[u8], message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let private = rsa::RsaPrivateKey::from_pkcs8_der(key).map_err(|_| KeyError::MalformedKey {
        key_type: KeyType::Rsa2048,
    })?;
    let digest = Sha256::digest(message);
    private
        .sign(rsa::Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|err| KeyError::Signing(err.to_string()))
}

fn rsa_verify(key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(public) = rsa::RsaPublicKey::from_public_key_der(key) else {
        return false;
    };
    let digest = Sha256::digest(message);
    public
        .verify(rsa::Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

fn ecdsa_sign(key: &[u8], message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let signing =
        p256::ecdsa::SigningKey::from_slice(key).map_err(|_| KeyError::MalformedKey {
            key_type: KeyType::EcdsaP256,
        })?;
    let signature: p256::ecdsa::Signature = signing.sign(message);
    Ok(signature.to_vec())
}

fn ecdsa_verify(key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying) = p256::ecdsa::VerifyingKey::from_sec1_bytes(key) else {
        return false;
    };
    let Ok(signature) = p256::ecdsa::Signature::from_slice(signature) else {
        return false;
    };
    verifying.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_sign_verify_round_trip() {
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        let sig = pair.private.sign(b"hello").unwrap();
        assert!(pair.public.verify(b"hello", &sig));
        assert!(!pair.public.verify(b"hello!", &sig));
    }

    #[test]
    fn ecdsa_sign_verify_round_trip() {
        let pair = KeyPair::generate(KeyType::EcdsaP256).unwrap();
        let sig = pair.private.sign(b"payload").unwrap();
        assert!(pair.public.verify(b"payload", &sig));
        assert!(!pair.public.verify(b"tampered", &sig));
    }

    #[test]
    fn rsa_sign_verify_round_trip() {
        let pair = KeyPair::generate(KeyType::Rsa2048).unwrap();
        let sig = pair.private.sign(b"payload").unwrap();
        assert!(pair.public.verify(b"payload", &sig));
        assert!(!pair.public.verify(b"tampered", &sig));
    }

    #[test]
    fn verify_fails_closed_on_garbage() {
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        assert!(!pair.public.verify(b"msg", b"not a signature"));
        let bogus = PublicKey::new(KeyType::Ed25519, vec![1, 2, 3]);
        assert!(!bogus.verify(b"msg", &[0u8; 64]));
    }

    #[test]
    fn key_string_round_trip() {
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        let encoded = pair.public.to_string();
        assert!(encoded.starts_with("ed25519 "));
        let decoded = PublicKey::from_str(&encoded).unwrap();
        assert_eq!(pair.public, decoded);
    }

    #[test]
    fn fingerprint_is_stable() {
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        assert_eq!(pair.public.fingerprint(), pair.public.fingerprint());
        assert_eq!(pair.public.fingerprint().len(), 64);
    }

    #[test]
    fn derive_capability_is_ed25519_only() {
        assert!(KeyType::Ed25519.supports(Capability::Derive));
        assert!(!KeyType::Rsa2048.supports(Capability::Derive));
        assert!(!KeyType::EcdsaP256.supports(Capability::Derive));
    }

    #[test]
    fn derivation_from_seed_is_deterministic() {
        let seed = [7u8; 32];
        let a = KeyPair::derive_ed25519(&seed).unwrap();
        let b = KeyPair::derive_ed25519(&seed).unwrap();
        assert_eq!(a.public, b.public);

        let other = KeyPair::derive_ed25519(&[8u8; 32]).unwrap();
        assert_ne!(a.public, other.public);
    }

    #[test]
    fn private_key_debug_is_redacted() {
        let pair = KeyPair::generate(KeyType::Ed25519).unwrap();
        let debug = format!("{:?}", pair.private);
        assert!(debug.contains("REDACTED"));
    }
}
