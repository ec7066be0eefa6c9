//! Envelope composition on the sending side.

use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::address::AddressHash;
use crate::aead;
use crate::hash::sha256_hex;
use crate::keys::{KeyPair, PublicKey};
use crate::kex::dual_key_exchange;
use crate::pow::ProofOfWork;

use super::{
    sign_client_header, Catalog, CatalogEntry, CatalogSeal, EnvelopeError, Header, HeaderFrom,
    HeaderTo, Signatures, CRYPTO_SUITE,
};

/// Compression marker recorded in catalog entries for zlib-deflated
/// attachments.
const COMPRESSION_ZLIB: &str = "zlib";

/// Sender and recipient identities needed to compose a message.
/// Addresses appear as their hashes, the only identifier on the wire.
#[derive(Debug, Clone)]
pub struct Addressing {
    pub sender: AddressHash,
    pub sender_key: KeyPair,
    pub recipient: AddressHash,
    pub recipient_key: PublicKey,
}

/// A plaintext message block to include in the envelope.
#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub kind: String,
    pub data: Vec<u8>,
}

/// A plaintext attachment; compressed with zlib before encryption.
#[derive(Debug, Clone)]
pub struct AttachmentSpec {
    pub name: String,
    pub data: Vec<u8>,
}

/// A fully composed message, ready for upload: plaintext header, sealed
/// catalog, and the ciphertext payload per catalog entry.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub header: Header,
    pub sealed_catalog: Vec<u8>,
    pub blocks: Vec<(String, Vec<u8>)>,
    pub attachments: Vec<(String, Vec<u8>)>,
}

/// Composes and seals a complete envelope.
///
/// Every block and attachment gets a fresh 32-byte key and 12-byte nonce
/// recorded in the catalog; the catalog is sealed with a random key `K`
/// that travels to the recipient as `K ⊕ D` alongside the dual-key-exchange
/// transaction id.
pub fn compose(
    addressing: &Addressing,
    subject: &str,
    created_at: u64,
    blocks: Vec<BlockSpec>,
    attachments: Vec<AttachmentSpec>,
    address_pow: Option<ProofOfWork>,
) -> Result<Envelope, EnvelopeError> {
    let mut catalog = Catalog::new(
        addressing.sender,
        addressing.recipient,
        subject,
        created_at,
        Uuid::new_v4().to_string(),
    );

    let mut block_payloads = Vec::with_capacity(blocks.len());
    for block in blocks {
        let (entry, ciphertext) = encrypt_entry(&block.kind, &block.data, None)?;
        block_payloads.push((entry.id.clone(), ciphertext));
        catalog.blocks.push(entry);
    }

    let mut attachment_payloads = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        let compressed = zlib_compress(&attachment.data)?;
        let (entry, ciphertext) =
            encrypt_entry(&attachment.name, &compressed, Some(COMPRESSION_ZLIB))?;
        attachment_payloads.push((entry.id.clone(), ciphertext));
        catalog.attachments.push(entry);
    }

    let catalog_key = aead::generate_key();
    let sealed_catalog = catalog.seal(&catalog_key)?;

    let (shared, transaction_id) = dual_key_exchange(&addressing.recipient_key)?;
    let mut encrypted_key = [0u8; aead::KEY_LEN];
    for (out, (k, d)) in encrypted_key
        .iter_mut()
        .zip(catalog_key.iter().zip(shared.iter()))
    {
        *out = k ^ d;
    }

    let mut header = Header {
        from: HeaderFrom {
            addr: addressing.sender,
            public_key: addressing.sender_key.public.clone(),
            sig_hash: sha256_hex(&sealed_catalog),
            proof_of_work: address_pow,
        },
        to: HeaderTo {
            addr: addressing.recipient,
            fingerprint: addressing.recipient_key.fingerprint(),
        },
        catalog: CatalogSeal {
            transaction_id,
            encrypted_key: BASE64.encode(encrypted_key),
            crypto: CRYPTO_SUITE.to_string(),
        },
        signatures: Signatures::default(),
    };
    sign_client_header(&mut header, &addressing.sender_key.private)?;

    Ok(Envelope {
        header,
        sealed_catalog,
        blocks: block_payloads,
        attachments: attachment_payloads,
    })
}

fn encrypt_entry(
    kind: &str,
    plaintext: &[u8],
    compression: Option<&str>,
) -> Result<(CatalogEntry, Vec<u8>), EnvelopeError> {
    let key = aead::generate_key();
    let iv = aead::generate_nonce();
    let ciphertext = aead::encrypt(&key, &iv, plaintext)?;

    let entry = CatalogEntry {
        id: Uuid::new_v4().to_string(),
        kind: kind.to_string(),
        size: ciphertext.len() as u64,
        compression: compression.map(str::to_string),
        checksum: sha256_hex(&ciphertext),
        iv: BASE64.encode(iv),
        key: BASE64.encode(key),
    };
    Ok((entry, ciphertext))
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
