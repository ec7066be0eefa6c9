//! Detached signatures over the canonical header bytes.
//!
//! The client signature covers the header with both signature fields
//! emptied; the server signature covers the header with the server field
//! alone emptied (the client signature stays in place). Signing never
//! overwrites a signature that is already present; verification fails
//! closed on any missing signature or decoding error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::canonical::to_canonical_vec;
use crate::keys::{KeyError, PrivateKey, PublicKey};

use super::{EnvelopeError, Header};

/// Adds the sender's detached signature to the header.
pub fn sign_client_header(header: &mut Header, key: &PrivateKey) -> Result<(), EnvelopeError> {
    if !header.signatures.client.is_empty() {
        return Ok(());
    }
    let bytes = client_signing_bytes(header)?;
    let signature = key.sign(&bytes)?;
    header.signatures.client = BASE64.encode(signature);
    Ok(())
}

/// Adds the receiving server's routing-key signature to the header.
pub fn sign_server_header(header: &mut Header, key: &PrivateKey) -> Result<(), EnvelopeError> {
    if !header.signatures.server.is_empty() {
        return Ok(());
    }
    let bytes = server_signing_bytes(header)?;
    let signature = key.sign(&bytes)?;
    header.signatures.server = BASE64.encode(signature);
    Ok(())
}

/// Verifies the client signature against the sender key embedded in the
/// header. Cross-checking that key against the resolver is the caller's
/// job.
#[must_use]
pub fn verify_client_header(header: &Header) -> bool {
    if header.signatures.client.is_empty() {
        return false;
    }
    let Ok(signature) = BASE64.decode(&header.signatures.client) else {
        return false;
    };
    let Ok(bytes) = client_signing_bytes(header) else {
        return false;
    };
    header.from.public_key.verify(&bytes, &signature)
}

/// Verifies the server signature against the given routing public key.
#[must_use]
pub fn verify_server_header(header: &Header, routing_key: &PublicKey) -> bool {
    if header.signatures.server.is_empty() {
        return false;
    }
    let Ok(signature) = BASE64.decode(&header.signatures.server) else {
        return false;
    };
    let Ok(bytes) = server_signing_bytes(header) else {
        return false;
    };
    routing_key.verify(&bytes, &signature)
}

fn client_signing_bytes(header: &Header) -> Result<Vec<u8>, KeyError> {
    let mut unsigned = header.clone();
    unsigned.signatures.client.clear();
    unsigned.signatures.server.clear();
    canonical(&unsigned)
}

fn server_signing_bytes(header: &Header) -> Result<Vec<u8>, KeyError> {
    let mut unsigned = header.clone();
    unsigned.signatures.server.clear();
    canonical(&unsigned)
}

fn canonical(header: &Header) -> Result<Vec<u8>, KeyError> {
    to_canonical_vec(header).map_err(|err| KeyError::Signing(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::envelope::{CatalogSeal, HeaderFrom, HeaderTo, Signatures, CRYPTO_SUITE};
    use crate::keys::{KeyPair, KeyType};
    use crate::kex::dual_key_exchange;

    fn header_for(sender: &KeyPair, recipient: &KeyPair) -> Header {
        let (_, txid) = dual_key_exchange(&recipient.public).unwrap();
        Header {
            from: HeaderFrom {
                addr: Address::parse("alice!").unwrap().hash(),
                public_key: sender.public.clone(),
                sig_hash: crate::hash::sha256_hex(b"sealed-catalog"),
                proof_of_work: None,
            },
            to: HeaderTo {
                addr: Address::parse("bob!").unwrap().hash(),
                fingerprint: recipient.public.fingerprint(),
            },
            catalog: CatalogSeal {
                transaction_id: txid,
                encrypted_key: "AAAA".to_string(),
                crypto: CRYPTO_SUITE.to_string(),
            },
            signatures: Signatures::default(),
        }
    }

    #[test]
    fn client_sign_verify_round_trip() {
        let sender = KeyPair::generate(KeyType::Ed25519).unwrap();
        let recipient = KeyPair::generate(KeyType::Ed25519).unwrap();
        let mut header = header_for(&sender, &recipient);

        sign_client_header(&mut header, &sender.private).unwrap();
        assert!(verify_client_header(&header));
    }

    #[test]
    fn server_signature_covers_the_client_signature() {
        let sender = KeyPair::generate(KeyType::Ed25519).unwrap();
        let recipient = KeyPair::generate(KeyType::Ed25519).unwrap();
        let server = KeyPair::generate(KeyType::Ed25519).unwrap();
        let mut header = header_for(&sender, &recipient);

        sign_client_header(&mut header, &sender.private).unwrap();
        sign_server_header(&mut header, &server.private).unwrap();
        assert!(verify_server_header(&header, &server.public));

        // Stripping the client signature invalidates the server signature.
        let mut stripped = header.clone();
        stripped.signatures.client.clear();
        assert!(!verify_server_header(&stripped, &server.public));
    }

    #[test]
    fn signing_does_not_overwrite_an_existing_signature() {
        let sender = KeyPair::generate(KeyType::Ed25519).unwrap();
        let recipient = KeyPair::generate(KeyType::Ed25519).unwrap();
        let mut header = header_for(&sender, &recipient);

        header.signatures.client = "preset".to_string();
        sign_client_header(&mut header, &sender.private).unwrap();
        assert_eq!(header.signatures.client, "preset");

        header.signatures.server = "preset-server".to_string();
        sign_server_header(&mut header, &sender.private).unwrap();
        assert_eq!(header.signatures.server, "preset-server");
    }

    #[test]
    fn mutating_any_signed_field_breaks_verification() {
        let sender = KeyPair::generate(KeyType::Ed25519).unwrap();
        let recipient = KeyPair::generate(KeyType::Ed25519).unwrap();
        let mut header = header_for(&sender, &recipient);
        sign_client_header(&mut header, &sender.private).unwrap();

        let mut tampered = header.clone();
        tampered.from.sig_hash = crate::hash::sha256_hex(b"other-catalog");
        assert!(!verify_client_header(&tampered));

        let mut tampered = header.clone();
        tampered.to.fingerprint.push('0');
        assert!(!verify_client_header(&tampered));

        let mut tampered = header.clone();
        tampered.catalog.encrypted_key = "BBBB".to_string();
        assert!(!verify_client_header(&tampered));
    }

    #[test]
    fn missing_or_garbage_signatures_fail_closed() {
        let sender = KeyPair::generate(KeyType::Ed25519).unwrap();
        let recipient = KeyPair::generate(KeyType::Ed25519).unwrap();
        let mut header = header_for(&sender, &recipient);

        assert!(!verify_client_header(&header));

        header.signatures.client = "A".to_string();
        assert!(!verify_client_header(&header));

        header.signatures.client = BASE64.encode(b"foobar");
        assert!(!verify_client_header(&header));

        assert!(!verify_server_header(&header, &sender.public));
    }
}
