//! The message envelope: plaintext header, sealed catalog, and the
//! encrypted block/attachment payloads the catalog describes.

mod catalog;
mod compose;
mod header;
mod open;
mod signature;

use thiserror::Error;

pub use catalog::{Catalog, CatalogEntry};
pub use compose::{compose, Addressing, AttachmentSpec, BlockSpec, Envelope};
pub use header::{CatalogSeal, Header, HeaderFrom, HeaderTo, Signatures, CRYPTO_SUITE};
pub use open::{decrypt_entry, unlock_catalog};
pub use signature::{
    sign_client_header, sign_server_header, verify_client_header, verify_server_header,
};

use crate::aead::AeadError;
use crate::keys::KeyError;
use crate::kex::KexError;

/// Errors returned when composing, sealing, or opening envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Aead(#[from] AeadError),
    #[error(transparent)]
    Kex(#[from] KexError),
    #[error("serialising envelope part failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compressing attachment failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("checksum mismatch for entry {id}")]
    ChecksumMismatch { id: String },
    #[error("malformed catalog entry {id}: {reason}")]
    MalformedEntry { id: String, reason: &'static str },
    #[error("transaction id does not match this private key")]
    SecretMismatch,
    #[error("encrypted catalog key must be 32 bytes")]
    MalformedEncryptedKey,
}
