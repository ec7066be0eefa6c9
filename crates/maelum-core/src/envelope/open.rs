//! Envelope opening on the receiving side.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;

use crate::aead;
use crate::hash::sha256_hex;
use crate::keys::PrivateKey;
use crate::kex::dual_key_get_secret;

use super::{Catalog, CatalogEntry, EnvelopeError, Header};

/// Recovers the catalog key via the dual key exchange and opens the sealed
/// catalog. Fails with [`EnvelopeError::SecretMismatch`] when the private
/// key does not match the published transaction id.
pub fn unlock_catalog(
    header: &Header,
    sealed_catalog: &[u8],
    private: &PrivateKey,
) -> Result<Catalog, EnvelopeError> {
    let shared = dual_key_get_secret(private, &header.catalog.transaction_id)?
        .ok_or(EnvelopeError::SecretMismatch)?;

    let masked = BASE64
        .decode(&header.catalog.encrypted_key)
        .map_err(|_| EnvelopeError::MalformedEncryptedKey)?;
    if masked.len() != aead::KEY_LEN {
        return Err(EnvelopeError::MalformedEncryptedKey);
    }

    let mut catalog_key = [0u8; aead::KEY_LEN];
    for (out, (m, d)) in catalog_key
        .iter_mut()
        .zip(masked.iter().zip(shared.iter()))
    {
        *out = m ^ d;
    }

    Catalog::open(&catalog_key, sealed_catalog)
}

/// Verifies the stored checksum of a fetched payload, decrypts it with the
/// entry's key material, and reverses any recorded compression.
pub fn decrypt_entry(entry: &CatalogEntry, payload: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if sha256_hex(payload) != entry.checksum {
        return Err(EnvelopeError::ChecksumMismatch {
            id: entry.id.clone(),
        });
    }

    let key = BASE64.decode(&entry.key).map_err(|_| EnvelopeError::MalformedEntry {
        id: entry.id.clone(),
        reason: "key is not valid base64",
    })?;
    let iv = BASE64.decode(&entry.iv).map_err(|_| EnvelopeError::MalformedEntry {
        id: entry.id.clone(),
        reason: "iv is not valid base64",
    })?;

    let plaintext = aead::decrypt(&key, &iv, payload)?;

    match entry.compression.as_deref() {
        Some("zlib") => {
            let mut decoder = ZlibDecoder::new(plaintext.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Some(_) => Err(EnvelopeError::MalformedEntry {
            id: entry.id.clone(),
            reason: "unknown compression scheme",
        }),
        None => Ok(plaintext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::envelope::{compose, Addressing, AttachmentSpec, BlockSpec};
    use crate::keys::{KeyPair, KeyType};

    fn compose_sample() -> (crate::envelope::Envelope, KeyPair) {
        let sender_key = KeyPair::generate(KeyType::Ed25519).unwrap();
        let recipient_key = KeyPair::generate(KeyType::Ed25519).unwrap();
        let addressing = Addressing {
            sender: Address::parse("alice!").unwrap().hash(),
            sender_key,
            recipient: Address::parse("bob!").unwrap().hash(),
            recipient_key: recipient_key.public.clone(),
        };
        let envelope = compose(
            &addressing,
            "round trip",
            1_700_000_000,
            vec![
                BlockSpec {
                    kind: "default".to_string(),
                    data: b"first block".to_vec(),
                },
                BlockSpec {
                    kind: "html".to_string(),
                    data: b"<p>second</p>".to_vec(),
                },
            ],
            vec![AttachmentSpec {
                name: "data.bin".to_string(),
                data: vec![0x5a; 4096],
            }],
            None,
        )
        .unwrap();
        (envelope, recipient_key)
    }

    #[test]
    fn full_round_trip_recovers_every_payload() {
        let (envelope, recipient) = compose_sample();
        let catalog =
            unlock_catalog(&envelope.header, &envelope.sealed_catalog, &recipient.private)
                .unwrap();

        assert_eq!(catalog.subject, "round trip");
        assert_eq!(catalog.blocks.len(), 2);
        assert_eq!(catalog.attachments.len(), 1);

        let expected: [&[u8]; 2] = [b"first block", b"<p>second</p>"];
        for ((id, payload), want) in envelope.blocks.iter().zip(expected) {
            let entry = catalog.block(id).unwrap();
            assert_eq!(decrypt_entry(entry, payload).unwrap(), want);
        }

        let (id, payload) = &envelope.attachments[0];
        let entry = catalog.attachment(id).unwrap();
        assert_eq!(entry.compression.as_deref(), Some("zlib"));
        assert_eq!(decrypt_entry(entry, payload).unwrap(), vec![0x5a; 4096]);
    }

    #[test]
    fn wrong_recipient_cannot_unlock() {
        let (envelope, _) = compose_sample();
        let intruder = KeyPair::generate(KeyType::Ed25519).unwrap();
        assert!(matches!(
            unlock_catalog(&envelope.header, &envelope.sealed_catalog, &intruder.private),
            Err(EnvelopeError::SecretMismatch)
        ));
    }

    #[test]
    fn flipped_payload_bit_is_a_checksum_mismatch() {
        let (envelope, recipient) = compose_sample();
        let catalog =
            unlock_catalog(&envelope.header, &envelope.sealed_catalog, &recipient.private)
                .unwrap();
        let (id, payload) = &envelope.blocks[0];
        let entry = catalog.block(id).unwrap();

        let mut tampered = payload.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(
            decrypt_entry(entry, &tampered),
            Err(EnvelopeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn tampered_sealed_catalog_fails_to_open() {
        let (mut envelope, recipient) = compose_sample();
        let last = envelope.sealed_catalog.len() - 1;
        envelope.sealed_catalog[last] ^= 0x01;
        assert!(
            unlock_catalog(&envelope.header, &envelope.sealed_catalog, &recipient.private)
                .is_err()
        );
    }
}
