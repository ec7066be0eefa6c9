use sha2::{Digest, Sha256};

/// Computes the SHA-256 digest of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    digest
        .as_slice()
        .try_into()
        .expect("digest should be 32 bytes")
}

/// Computes the SHA-256 digest of `data` as a lowercase hex string.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}
