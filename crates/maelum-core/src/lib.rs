//! Core primitives for the maelum federated messaging network.
//!
//! The crate provides strongly typed helpers around the wire format:
//! addresses and their hashes, tagged key material, the dual key exchange,
//! AEAD sealing, proof of work, and the envelope (header + catalog +
//! payloads) that servers ingest and relay. Enforcing consistent hashing
//! and canonical encoding here keeps client and server implementations in
//! lockstep.

pub mod address;
pub mod aead;
pub mod apikey;
pub mod canonical;
pub mod envelope;
mod hash;
pub mod invite;
pub mod keys;
pub mod kex;
pub mod mnemonic;
pub mod pow;
pub mod ticket;

pub use crate::address::{Address, AddressError, AddressHash};
pub use crate::apikey::{parse_permissions, ApiKey, Permission, PermissionError};
pub use crate::envelope::{
    compose, decrypt_entry, sign_client_header, sign_server_header, unlock_catalog,
    verify_client_header, verify_server_header, Addressing, AttachmentSpec, BlockSpec, Catalog,
    CatalogEntry, CatalogSeal, Envelope, EnvelopeError, Header, HeaderFrom, HeaderTo, Signatures,
    CRYPTO_SUITE,
};
pub use crate::hash::{sha256, sha256_hex};
pub use crate::invite::{InviteError, InviteToken};
pub use crate::keys::{Capability, KeyError, KeyPair, KeyType, PrivateKey, PublicKey};
pub use crate::kex::{
    dual_key_exchange, dual_key_get_secret, KexError, TransactionId, TXID_COMPONENT_LEN,
};
pub use crate::pow::{verify as verify_pow, PowError, ProofOfWork};
pub use crate::ticket::{Ticket, TICKET_TTL_SECS};
