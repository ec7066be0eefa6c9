//! AES-256-GCM sealing for catalogs, blocks, and attachments.
//!
//! `seal` produces `nonce ∥ ciphertext` with a fresh 12-byte random nonce;
//! `open` splits and authenticates. Blocks and attachments store their
//! nonce in the catalog entry instead and use the raw `encrypt`/`decrypt`
//! pair.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Length in bytes of an AES-256 key.
pub const KEY_LEN: usize = 32;

/// Length in bytes of an AES-GCM nonce.
pub const NONCE_LEN: usize = 12;

/// Errors returned by the AEAD primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AeadError {
    #[error("key must be {KEY_LEN} bytes")]
    InvalidKeyLength,
    #[error("nonce must be {NONCE_LEN} bytes")]
    InvalidNonceLength,
    #[error("ciphertext is too short to contain a nonce")]
    Truncated,
    #[error("decryption failed")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
}

/// Generates a fresh 32-byte symmetric key.
#[must_use]
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generates a fresh 12-byte nonce.
#[must_use]
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts `plaintext` under `key` with an explicit nonce. The nonce is
/// not prepended to the output.
pub fn encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = cipher_for(key)?;
    if nonce.len() != NONCE_LEN {
        return Err(AeadError::InvalidNonceLength);
    }
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| AeadError::Encryption)
}

/// Decrypts ciphertext produced by [`encrypt`] with the same key and nonce.
pub fn decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = cipher_for(key)?;
    if nonce.len() != NONCE_LEN {
        return Err(AeadError::InvalidNonceLength);
    }
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AeadError::Decryption)
}

/// Seals `plaintext` as `nonce ∥ ciphertext` with a fresh random nonce.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let nonce = generate_nonce();
    let ciphertext = encrypt(key, &nonce, plaintext)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens a blob produced by [`seal`].
pub fn open(key: &[u8], blob: &[u8]) -> Result<Vec<u8>, AeadError> {
    if blob.len() < NONCE_LEN {
        return Err(AeadError::Truncated);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    decrypt(key, nonce, ciphertext)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, AeadError> {
    if key.len() != KEY_LEN {
        return Err(AeadError::InvalidKeyLength);
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}
