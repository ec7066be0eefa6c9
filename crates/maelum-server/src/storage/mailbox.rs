//! Account mailboxes: registered accounts, their boxes, and the per-box
//! message index.
//!
//! Box ids 1–4 are reserved (`INBOX`, `TRASH`, `DRAFTS`, `SPAM`);
//! user-created boxes start at 5. Messages arrive by directory rename from
//! the processing section and are recorded in a per-box index for reverse
//! chronological listing.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use maelum_core::{AddressHash, PublicKey};

use super::{write_atomic, MessageStore};

pub const INBOX: u32 = 1;
pub const TRASH: u32 = 2;
pub const DRAFTS: u32 = 3;
pub const SPAM: u32 = 4;
pub const FIRST_CUSTOM_BOX: u32 = 5;

const ACCOUNT_FILE: &str = "account.json";
const BOX_META_FILE: &str = ".meta.json";
const BOX_INDEX_FILE: &str = ".index.json";

/// A registered account: the key it authenticates with plus any extra
/// authorised keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub address_hash: AddressHash,
    pub public_key: PublicKey,
    #[serde(default)]
    pub auth_keys: Vec<AuthKey>,
    pub created_at: u64,
}

/// An additional key authorised to read the mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthKey {
    pub public_key: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Box metadata surfaced by the listing API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxInfo {
    pub id: u32,
    pub name: String,
    pub total: usize,
}

/// One index entry per delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: Uuid,
    pub received_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoxMeta {
    name: String,
}

impl MessageStore {
    fn account_dir(&self, hash: &AddressHash) -> PathBuf {
        self.accounts_dir().join(hash.to_string())
    }

    fn account_path(&self, hash: &AddressHash) -> PathBuf {
        self.account_dir(hash).join(ACCOUNT_FILE)
    }

    /// Directory of one box.
    #[must_use]
    pub fn box_dir(&self, hash: &AddressHash, box_id: u32) -> PathBuf {
        self.account_dir(hash).join("boxes").join(box_id.to_string())
    }

    /// Directory of one delivered message.
    #[must_use]
    pub fn boxed_message_dir(&self, hash: &AddressHash, box_id: u32, id: Uuid) -> PathBuf {
        self.box_dir(hash, box_id).join(id.to_string())
    }

    /// Registers an account and creates the reserved boxes.
    pub async fn create_account(
        &self,
        hash: AddressHash,
        public_key: PublicKey,
        now: u64,
    ) -> Result<()> {
        if self.account(&hash).await?.is_some() {
            bail!("account {hash} already exists");
        }
        for box_id in [INBOX, TRASH, DRAFTS, SPAM] {
            let dir = self.box_dir(&hash, box_id);
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating box directory {}", dir.display()))?;
        }
        let record = AccountRecord {
            address_hash: hash,
            public_key,
            auth_keys: Vec::new(),
            created_at: now,
        };
        self.write_account(&record).await
    }

    /// Loads an account record, if registered.
    pub async fn account(&self, hash: &AddressHash) -> Result<Option<AccountRecord>> {
        let path = self.account_path(hash);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("decoding account record {}", path.display())
            })?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Adds an authorised key to the account.
    pub async fn add_auth_key(&self, hash: &AddressHash, key: AuthKey) -> Result<()> {
        let mut record = self
            .account(hash)
            .await?
            .with_context(|| format!("account {hash} is not registered"))?;
        record.auth_keys.push(key);
        self.write_account(&record).await
    }

    async fn write_account(&self, record: &AccountRecord) -> Result<()> {
        let path = self.account_path(&record.address_hash);
        let bytes = serde_json::to_vec_pretty(record).context("encoding account record")?;
        write_atomic(&path, &bytes).await
    }

    /// Creates a user box, returning its id (≥ 5).
    pub async fn create_box(&self, hash: &AddressHash, name: &str) -> Result<u32> {
        let boxes = self.list_boxes(hash).await?;
        let next = boxes
            .iter()
            .map(|info| info.id)
            .max()
            .map_or(FIRST_CUSTOM_BOX, |max| max.max(FIRST_CUSTOM_BOX - 1) + 1);
        let dir = self.box_dir(hash, next);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating box directory {}", dir.display()))?;
        let meta = serde_json::to_vec(&BoxMeta {
            name: name.to_string(),
        })?;
        write_atomic(&dir.join(BOX_META_FILE), &meta).await?;
        Ok(next)
    }

    /// Renames a user box. Reserved boxes cannot be renamed.
    pub async fn rename_box(&self, hash: &AddressHash, box_id: u32, name: &str) -> Result<()> {
        if box_id < FIRST_CUSTOM_BOX {
            bail!("box {box_id} is reserved");
        }
        let dir = self.box_dir(hash, box_id);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            bail!("box {box_id} does not exist");
        }
        let meta = serde_json::to_vec(&BoxMeta {
            name: name.to_string(),
        })?;
        write_atomic(&dir.join(BOX_META_FILE), &meta).await
    }

    /// Deletes a user box and everything in it.
    pub async fn delete_box(&self, hash: &AddressHash, box_id: u32) -> Result<()> {
        if box_id < FIRST_CUSTOM_BOX {
            bail!("box {box_id} is reserved");
        }
        let dir = self.box_dir(hash, box_id);
        fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("removing box directory {}", dir.display()))
    }

    /// Lists the account's boxes with message counts.
    pub async fn list_boxes(&self, hash: &AddressHash) -> Result<Vec<BoxInfo>> {
        let boxes_dir = self.account_dir(hash).join("boxes");
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&boxes_dir)
            .await
            .with_context(|| format!("listing boxes under {}", boxes_dir.display()))?;
        while let Some(entry) = entries.next_entry().await.context("reading box entry")? {
            let Some(box_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let name = match box_id {
                INBOX => "INBOX".to_string(),
                TRASH => "TRASH".to_string(),
                DRAFTS => "DRAFTS".to_string(),
                SPAM => "SPAM".to_string(),
                _ => self.box_name(hash, box_id).await?,
            };
            let total = self.box_index(hash, box_id).await?.len();
            out.push(BoxInfo {
                id: box_id,
                name,
                total,
            });
        }
        out.sort_by_key(|info| info.id);
        Ok(out)
    }

    async fn box_name(&self, hash: &AddressHash, box_id: u32) -> Result<String> {
        let path = self.box_dir(hash, box_id).join(BOX_META_FILE);
        match fs::read(&path).await {
            Ok(bytes) => {
                let meta: BoxMeta = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decoding box metadata {}", path.display()))?;
                Ok(meta.name)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(box_id.to_string()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Records a delivered message in the box index.
    pub async fn index_message(
        &self,
        hash: &AddressHash,
        box_id: u32,
        id: Uuid,
        received_at: u64,
    ) -> Result<()> {
        let mut index = self.box_index(hash, box_id).await?;
        if index.iter().any(|meta| meta.id == id) {
            return Ok(());
        }
        index.push(MessageMeta { id, received_at });
        self.write_box_index(hash, box_id, &index).await
    }

    /// Drops a message from the box index.
    pub async fn unindex_message(&self, hash: &AddressHash, box_id: u32, id: Uuid) -> Result<()> {
        let mut index = self.box_index(hash, box_id).await?;
        index.retain(|meta| meta.id != id);
        self.write_box_index(hash, box_id, &index).await
    }

    /// Lists messages in a box, newest first, paginated.
    pub async fn list_messages(
        &self,
        hash: &AddressHash,
        box_id: u32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageMeta>> {
        let mut index = self.box_index(hash, box_id).await?;
        index.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.id.cmp(&a.id)));
        Ok(index.into_iter().skip(offset).take(limit).collect())
    }

    /// Moves a message between two boxes of the same account.
    pub async fn move_boxed_message(
        &self,
        hash: &AddressHash,
        from_box: u32,
        to_box: u32,
        id: Uuid,
    ) -> Result<()> {
        let source = self.boxed_message_dir(hash, from_box, id);
        let target = self.boxed_message_dir(hash, to_box, id);
        if !fs::try_exists(&source).await.unwrap_or(false) {
            bail!("message {id} not found in box {from_box}");
        }
        if !fs::try_exists(&self.box_dir(hash, to_box)).await.unwrap_or(false) {
            bail!("box {to_box} does not exist");
        }
        let received_at = self
            .box_index(hash, from_box)
            .await?
            .iter()
            .find(|meta| meta.id == id)
            .map_or(0, |meta| meta.received_at);
        fs::rename(&source, &target)
            .await
            .with_context(|| format!("moving message {id} from box {from_box} to {to_box}"))?;
        self.unindex_message(hash, from_box, id).await?;
        self.index_message(hash, to_box, id, received_at).await
    }

    async fn box_index(&self, hash: &AddressHash, box_id: u32) -> Result<Vec<MessageMeta>> {
        let path = self.box_dir(hash, box_id).join(BOX_INDEX_FILE);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding box index {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn write_box_index(
        &self,
        hash: &AddressHash,
        box_id: u32,
        index: &[MessageMeta],
    ) -> Result<()> {
        let path = self.box_dir(hash, box_id).join(BOX_INDEX_FILE);
        let bytes = serde_json::to_vec(index).context("encoding box index")?;
        write_atomic(&path, &bytes).await
    }
}
