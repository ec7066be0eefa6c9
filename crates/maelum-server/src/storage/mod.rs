//! On-disk message store.
//!
//! A message lives in exactly one section at a time; section changes are
//! same-filesystem directory renames, so observers never see a partial
//! message in two places. File writes go to `*.tmp` and rename into place.

pub mod mailbox;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::fs;
use uuid::Uuid;

pub const MESSAGES_DIR: &str = "messages";
pub const ACCOUNTS_DIR: &str = "accounts";
pub const STATE_DIR: &str = "state";
pub const ROUTING_FILE: &str = "routing.json";

pub const HEADER_FILE: &str = "header.json";
pub const CATALOG_FILE: &str = "catalog";

/// Lifecycle stage of a message on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Incoming,
    Processing,
    Outbox,
    Dead,
}

impl Section {
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Section::Incoming => "incoming",
            Section::Processing => "processing",
            Section::Outbox => "outbox",
            Section::Dead => "dead",
        }
    }

    #[must_use]
    pub const fn all() -> [Section; 4] {
        [
            Section::Incoming,
            Section::Processing,
            Section::Outbox,
            Section::Dead,
        ]
    }
}

#[derive(Clone)]
pub struct MessageStore {
    data_dir: PathBuf,
}

impl MessageStore {
    /// Creates the section and account layout under `data_dir`.
    pub async fn bootstrap(data_dir: &Path) -> Result<Self> {
        for section in Section::all() {
            let dir = data_dir.join(MESSAGES_DIR).join(section.dir_name());
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating section directory {}", dir.display()))?;
        }
        let accounts = data_dir.join(ACCOUNTS_DIR);
        fs::create_dir_all(&accounts)
            .await
            .with_context(|| format!("creating accounts directory {}", accounts.display()))?;
        let state = data_dir.join(STATE_DIR);
        fs::create_dir_all(&state)
            .await
            .with_context(|| format!("creating state directory {}", state.display()))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join(STATE_DIR)
    }

    #[must_use]
    pub fn routing_path(&self) -> PathBuf {
        self.data_dir.join(ROUTING_FILE)
    }

    #[must_use]
    pub fn section_dir(&self, section: Section) -> PathBuf {
        self.data_dir.join(MESSAGES_DIR).join(section.dir_name())
    }

    #[must_use]
    pub fn message_dir(&self, section: Section, id: Uuid) -> PathBuf {
        self.section_dir(section).join(id.to_string())
    }

    #[must_use]
    pub fn accounts_dir(&self) -> PathBuf {
        self.data_dir.join(ACCOUNTS_DIR)
    }

    /// Returns `true` if the message directory (or a file inside it)
    /// exists in the section.
    pub async fn message_exists(&self, section: Section, id: Uuid, file: Option<&str>) -> bool {
        let mut path = self.message_dir(section, id);
        if let Some(file) = file {
            path = path.join(file);
        }
        fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Writes `contents` into the message directory via a `*.tmp` rename.
    pub async fn write_message_file(
        &self,
        section: Section,
        id: Uuid,
        file: &str,
        contents: &[u8],
    ) -> Result<()> {
        let dir = self.message_dir(section, id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating message directory {}", dir.display()))?;
        write_atomic(&dir.join(file), contents).await
    }

    /// Reads a file from a message directory.
    pub async fn read_message_file(
        &self,
        section: Section,
        id: Uuid,
        file: &str,
    ) -> Result<Vec<u8>> {
        let path = self.message_dir(section, id).join(file);
        fs::read(&path)
            .await
            .with_context(|| format!("reading message file {}", path.display()))
    }

    /// Moves a message between sections atomically. Fails if the target
    /// already exists, preserving section exclusivity.
    pub async fn move_message(&self, from: Section, to: Section, id: Uuid) -> Result<()> {
        let source = self.message_dir(from, id);
        let target = self.message_dir(to, id);
        if fs::try_exists(&target).await.unwrap_or(false) {
            bail!(
                "message {id} already present in section {}",
                to.dir_name()
            );
        }
        fs::rename(&source, &target).await.with_context(|| {
            format!(
                "moving message {id} from {} to {}",
                from.dir_name(),
                to.dir_name()
            )
        })
    }

    /// Removes a message directory. Idempotent: removing an absent message
    /// succeeds.
    pub async fn remove_message(&self, section: Section, id: Uuid) -> Result<()> {
        let dir = self.message_dir(section, id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing message directory {}", dir.display()))
            }
        }
    }

    /// Lists the message ids currently present in a section. Entries that
    /// are not UUID-named directories (lock dirs, stray files) are skipped.
    pub async fn list_section(&self, section: Section) -> Result<Vec<Uuid>> {
        let dir = self.section_dir(section);
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing section {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("reading section entry")?
        {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|name| Uuid::parse_str(name).ok()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// Writes `contents` to `path` through a `.tmp` sibling and rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} into place", tmp.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn bootstrap_creates_every_section() {
        let dir = tempdir().unwrap();
        let store = MessageStore::bootstrap(dir.path()).await.unwrap();
        for section in Section::all() {
            assert!(store.section_dir(section).is_dir());
        }
        assert!(store.accounts_dir().is_dir());
    }

    #[tokio::test]
    async fn message_files_round_trip() {
        let dir = tempdir().unwrap();
        let store = MessageStore::bootstrap(dir.path()).await.unwrap();
        let id = Uuid::new_v4();

        store
            .write_message_file(Section::Incoming, id, HEADER_FILE, b"{}")
            .await
            .unwrap();
        assert!(store.message_exists(Section::Incoming, id, Some(HEADER_FILE)).await);
        assert_eq!(
            store
                .read_message_file(Section::Incoming, id, HEADER_FILE)
                .await
                .unwrap(),
            b"{}"
        );
        // No stray tmp file remains.
        let dir_listing: Vec<_> = std::fs::read_dir(store.message_dir(Section::Incoming, id))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(dir_listing, vec![std::ffi::OsString::from(HEADER_FILE)]);
    }

    #[tokio::test]
    async fn moves_preserve_section_exclusivity() {
        let dir = tempdir().unwrap();
        let store = MessageStore::bootstrap(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        store
            .write_message_file(Section::Incoming, id, HEADER_FILE, b"{}")
            .await
            .unwrap();

        store
            .move_message(Section::Incoming, Section::Processing, id)
            .await
            .unwrap();
        assert!(!store.message_exists(Section::Incoming, id, None).await);
        assert!(store.message_exists(Section::Processing, id, None).await);

        // Moving again fails: the source is gone.
        assert!(store
            .move_message(Section::Incoming, Section::Processing, id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = MessageStore::bootstrap(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        store
            .write_message_file(Section::Outbox, id, HEADER_FILE, b"{}")
            .await
            .unwrap();

        store.remove_message(Section::Outbox, id).await.unwrap();
        store.remove_message(Section::Outbox, id).await.unwrap();
        assert!(!store.message_exists(Section::Outbox, id, None).await);
    }

    #[tokio::test]
    async fn list_section_skips_non_message_entries() {
        let dir = tempdir().unwrap();
        let store = MessageStore::bootstrap(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        store
            .write_message_file(Section::Processing, id, HEADER_FILE, b"{}")
            .await
            .unwrap();
        std::fs::create_dir(store.section_dir(Section::Processing).join(format!("{id}.lock.123")))
            .unwrap();

        let ids = store.list_section(Section::Processing).await.unwrap();
        assert_eq!(ids, vec![id]);
    }
}
