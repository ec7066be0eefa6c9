//! Mnemonic backup of the 256-bit master seed.
//!
//! The seed encodes as 24 BIP-39 words (checksummed); account keypairs are
//! derivable from the seed via HKDF, so the word list alone restores an
//! account key.

use bip39::Mnemonic;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::{KeyError, KeyPair};

/// Errors returned by mnemonic encoding and recovery.
#[derive(Debug, Error)]
pub enum MnemonicError {
    #[error("invalid mnemonic phrase: {0}")]
    InvalidPhrase(String),
    #[error("mnemonic does not encode a 256-bit seed")]
    WrongEntropyLength,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Generates a fresh 256-bit seed and its 24-word phrase.
pub fn generate() -> Result<([u8; 32], String), MnemonicError> {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let phrase = encode(&seed)?;
    Ok((seed, phrase))
}

/// Encodes a 32-byte seed as a 24-word phrase.
pub fn encode(seed: &[u8; 32]) -> Result<String, MnemonicError> {
    let mnemonic = Mnemonic::from_entropy(seed)
        .map_err(|err| MnemonicError::InvalidPhrase(err.to_string()))?;
    Ok(mnemonic.to_string())
}

/// Recovers the seed from a 24-word phrase.
pub fn decode(phrase: &str) -> Result<[u8; 32], MnemonicError> {
    let mnemonic =
        Mnemonic::parse(phrase).map_err(|err| MnemonicError::InvalidPhrase(err.to_string()))?;
    let entropy = Zeroizing::new(mnemonic.to_entropy());
    entropy
        .as_slice()
        .try_into()
        .map_err(|_| MnemonicError::WrongEntropyLength)
}

/// Restores the account Ed25519 keypair from a backup phrase.
pub fn keypair_from_phrase(phrase: &str) -> Result<KeyPair, MnemonicError> {
    let seed = Zeroizing::new(decode(phrase)?);
    Ok(KeyPair::derive_ed25519(&seed)?)
}
