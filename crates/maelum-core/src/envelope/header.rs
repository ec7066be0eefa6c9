use serde::{Deserialize, Serialize};

use crate::address::AddressHash;
use crate::keys::PublicKey;
use crate::kex::TransactionId;
use crate::pow::ProofOfWork;

/// Crypto suite identifier carried in the header.
pub const CRYPTO_SUITE: &str = "ed25519+aes256gcm";

/// Plaintext message header. Everything a server needs to admit, sign, and
/// route the message without being able to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub from: HeaderFrom,
    pub to: HeaderTo,
    pub catalog: CatalogSeal,
    #[serde(default)]
    pub signatures: Signatures,
}

/// Sender identity: address hash, public key, the hash of the sealed
/// catalog bytes (binding the catalog into the client signature), and the
/// sender's address proof of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderFrom {
    pub addr: AddressHash,
    pub public_key: PublicKey,
    pub sig_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_of_work: Option<ProofOfWork>,
}

/// Recipient identity: address hash plus the fingerprint of the public key
/// the catalog was sealed towards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderTo {
    pub addr: AddressHash,
    pub fingerprint: String,
}

/// Output of the dual key exchange: the transaction id the recipient
/// validates, the catalog key XOR-masked with the shared secret, and the
/// crypto suite in use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSeal {
    pub transaction_id: TransactionId,
    pub encrypted_key: String,
    pub crypto: String,
}

/// Detached signatures over the canonical header bytes. Empty strings mean
/// "not yet signed"; both fields are emptied before computing the client
/// signature, the server field alone before the server signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signatures {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub server: String,
}
