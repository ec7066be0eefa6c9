use serde::{Deserialize, Serialize};

use crate::address::AddressHash;
use crate::aead::{self, AeadError};

/// The encrypted inner manifest: who, what, and the per-entry keys needed
/// to decrypt blocks and attachments. Readable by the recipient only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub from: AddressHash,
    pub to: AddressHash,
    pub subject: String,
    pub created_at: u64,
    pub thread_id: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<CatalogEntry>,
    #[serde(default)]
    pub attachments: Vec<CatalogEntry>,
}

/// One block or attachment: identity, stored size and checksum of the
/// ciphertext, and the symmetric key material to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    pub checksum: String,
    pub iv: String,
    pub key: String,
}

impl Catalog {
    /// Creates an empty catalog between two parties.
    #[must_use]
    pub fn new(
        from: AddressHash,
        to: AddressHash,
        subject: impl Into<String>,
        created_at: u64,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            subject: subject.into(),
            created_at,
            thread_id: thread_id.into(),
            flags: Vec::new(),
            labels: Vec::new(),
            blocks: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Looks up a block entry by id.
    #[must_use]
    pub fn block(&self, id: &str) -> Option<&CatalogEntry> {
        self.blocks.iter().find(|entry| entry.id == id)
    }

    /// Looks up an attachment entry by id.
    #[must_use]
    pub fn attachment(&self, id: &str) -> Option<&CatalogEntry> {
        self.attachments.iter().find(|entry| entry.id == id)
    }

    /// Iterates every entry id the upload must cover before finalisation.
    pub fn entry_ids(&self) -> impl Iterator<Item = (&str, bool)> {
        self.blocks
            .iter()
            .map(|entry| (entry.id.as_str(), false))
            .chain(
                self.attachments
                    .iter()
                    .map(|entry| (entry.id.as_str(), true)),
            )
    }

    /// Seals the catalog JSON under `key` as `nonce ∥ ciphertext`.
    pub fn seal(&self, key: &[u8]) -> Result<Vec<u8>, super::EnvelopeError> {
        let plaintext = serde_json::to_vec(self)?;
        Ok(aead::seal(key, &plaintext)?)
    }

    /// Opens a sealed catalog blob.
    pub fn open(key: &[u8], blob: &[u8]) -> Result<Self, super::EnvelopeError> {
        let plaintext = aead::open(key, blob)?;
        Ok(serde_json::from_slice(&plaintext).map_err(|_| AeadError::Decryption)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn sample_catalog() -> Catalog {
        let mut catalog = Catalog::new(
            Address::parse("alice!").unwrap().hash(),
            Address::parse("bob!").unwrap().hash(),
            "hello",
            1_700_000_000,
            "thread-1",
        );
        catalog.blocks.push(CatalogEntry {
            id: "b-1".to_string(),
            kind: "default".to_string(),
            size: 42,
            compression: None,
            checksum: "00".repeat(32),
            iv: "aXY=".to_string(),
            key: "a2V5".to_string(),
        });
        catalog
    }

    #[test]
    fn seal_open_round_trip() {
        let catalog = sample_catalog();
        let key = aead::generate_key();
        let sealed = catalog.seal(&key).unwrap();
        let opened = Catalog::open(&key, &sealed).unwrap();
        assert_eq!(catalog, opened);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealed = sample_catalog().seal(&aead::generate_key()).unwrap();
        assert!(Catalog::open(&aead::generate_key(), &sealed).is_err());
    }

    #[test]
    fn entry_lookup_by_id() {
        let catalog = sample_catalog();
        assert!(catalog.block("b-1").is_some());
        assert!(catalog.block("missing").is_none());
        assert!(catalog.attachment("b-1").is_none());
    }

    #[test]
    fn entry_ids_cover_blocks_then_attachments() {
        let mut catalog = sample_catalog();
        catalog.attachments.push(CatalogEntry {
            id: "a-1".to_string(),
            kind: "file".to_string(),
            size: 1,
            compression: Some("zlib".to_string()),
            checksum: "11".repeat(32),
            iv: "aXY=".to_string(),
            key: "a2V5".to_string(),
        });
        let ids: Vec<_> = catalog.entry_ids().collect();
        assert_eq!(ids, vec![("b-1", false), ("a-1", true)]);
    }
}
