//! Server-side repositories: tickets, proof-of-work challenges,
//! subscriptions, and API keys.
//!
//! Tickets and challenges are short-lived reservations owned by this
//! process and live in memory; subscriptions and API keys survive restarts
//! through JSON snapshots in the state directory. Validity transitions are
//! compare-and-set under the repository lock, so a sticky `valid` bit can
//! never be unset and a ticket can be consumed exactly once.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use maelum_core::{AddressHash, ApiKey, Ticket};

use crate::storage::write_atomic;

const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const APIKEYS_FILE: &str = "apikeys.json";

/// Seconds a proof-of-work challenge stays open.
pub const CHALLENGE_TTL_SECS: u64 = 30 * 60;

/// In-memory ticket store.
#[derive(Default)]
pub struct TicketRepo {
    tickets: Mutex<HashMap<Uuid, Ticket>>,
}

impl TicketRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, ticket: Ticket) {
        self.tickets
            .lock()
            .expect("ticket table poisoned")
            .insert(ticket.id, ticket);
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Ticket> {
        self.tickets
            .lock()
            .expect("ticket table poisoned")
            .get(&id)
            .cloned()
    }

    /// Consumes the ticket. Exactly one caller observes `Some`; concurrent
    /// finalise/abort calls race on this removal.
    pub fn remove(&self, id: Uuid) -> Option<Ticket> {
        self.tickets
            .lock()
            .expect("ticket table poisoned")
            .remove(&id)
    }

    /// Ids of tickets that are still alive at `now`. Used by the GC sweep
    /// to decide which incoming trees are reclaimable.
    #[must_use]
    pub fn live_ids(&self, now: u64) -> HashSet<Uuid> {
        self.tickets
            .lock()
            .expect("ticket table poisoned")
            .values()
            .filter(|ticket| !ticket.is_expired(now))
            .map(|ticket| ticket.id)
            .collect()
    }

    /// Drops expired tickets.
    pub fn prune(&self, now: u64) {
        self.tickets
            .lock()
            .expect("ticket table poisoned")
            .retain(|_, ticket| !ticket.is_expired(now));
    }
}

/// A proof-of-work challenge keyed on `(from, to, day)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowChallenge {
    pub challenge: String,
    pub bits: u8,
    pub valid: bool,
    pub created_at: u64,
    pub expires_at: u64,
}

impl PowChallenge {
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

type ChallengeKey = (AddressHash, AddressHash, u64);

/// In-memory proof-of-work challenge store.
#[derive(Default)]
pub struct ChallengeRepo {
    by_tuple: Mutex<HashMap<ChallengeKey, PowChallenge>>,
}

impl ChallengeRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live challenge for the tuple and current day, creating
    /// a fresh one when none exists or the previous one expired.
    pub fn get_or_create(
        &self,
        from: AddressHash,
        to: AddressHash,
        bits: u8,
        now: u64,
    ) -> PowChallenge {
        let key = (from, to, now / 86_400);
        let mut table = self.by_tuple.lock().expect("challenge table poisoned");
        match table.get(&key) {
            Some(existing) if !existing.is_expired(now) => existing.clone(),
            _ => {
                let mut raw = [0u8; 16];
                OsRng.fill_bytes(&mut raw);
                let challenge = PowChallenge {
                    challenge: hex::encode(raw),
                    bits,
                    valid: false,
                    created_at: now,
                    expires_at: now + CHALLENGE_TTL_SECS,
                };
                table.insert(key, challenge.clone());
                challenge
            }
        }
    }

    /// Marks a challenge valid after a successful proof. The bit is
    /// sticky: later failed attempts never clear it. Expired challenges
    /// cannot be validated. Returns the challenge state after the attempt.
    pub fn mark_valid(
        &self,
        from: AddressHash,
        to: AddressHash,
        challenge: &str,
        now: u64,
    ) -> Option<PowChallenge> {
        let key = (from, to, now / 86_400);
        let mut table = self.by_tuple.lock().expect("challenge table poisoned");
        let entry = table.get_mut(&key)?;
        if entry.challenge != challenge {
            return None;
        }
        if entry.valid {
            return Some(entry.clone());
        }
        if entry.is_expired(now) {
            return None;
        }
        entry.valid = true;
        Some(entry.clone())
    }

    /// Looks up the current challenge for a tuple without creating one.
    #[must_use]
    pub fn get(&self, from: AddressHash, to: AddressHash, now: u64) -> Option<PowChallenge> {
        let key = (from, to, now / 86_400);
        self.by_tuple
            .lock()
            .expect("challenge table poisoned")
            .get(&key)
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct Subscription {
    from: AddressHash,
    to: AddressHash,
    subscription_id: String,
}

/// Persistent subscription store. An active subscription lets a sender
/// skip proof of work for one recipient.
pub struct SubscriptionRepo {
    path: PathBuf,
    entries: Mutex<HashSet<Subscription>>,
}

impl SubscriptionRepo {
    pub async fn load(state_dir: PathBuf) -> Result<Self> {
        let path = state_dir.join(SUBSCRIPTIONS_FILE);
        let entries = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding subscriptions {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn has(&self, from: &AddressHash, to: &AddressHash, subscription_id: &str) -> bool {
        self.entries
            .lock()
            .expect("subscription table poisoned")
            .contains(&Subscription {
                from: *from,
                to: *to,
                subscription_id: subscription_id.to_string(),
            })
    }

    pub async fn add(
        &self,
        from: AddressHash,
        to: AddressHash,
        subscription_id: String,
    ) -> Result<()> {
        self.entries
            .lock()
            .expect("subscription table poisoned")
            .insert(Subscription {
                from,
                to,
                subscription_id,
            });
        self.save().await
    }

    pub async fn remove(
        &self,
        from: &AddressHash,
        to: &AddressHash,
        subscription_id: &str,
    ) -> Result<()> {
        self.entries
            .lock()
            .expect("subscription table poisoned")
            .remove(&Subscription {
                from: *from,
                to: *to,
                subscription_id: subscription_id.to_string(),
            });
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let snapshot: Vec<Subscription> = {
            let entries = self.entries.lock().expect("subscription table poisoned");
            entries.iter().cloned().collect()
        };
        let bytes = serde_json::to_vec(&snapshot).context("encoding subscriptions")?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Persistent API key store with lazy expiry purge.
pub struct ApiKeyRepo {
    path: PathBuf,
    keys: Mutex<HashMap<String, ApiKey>>,
}

impl ApiKeyRepo {
    pub async fn load(state_dir: PathBuf) -> Result<Self> {
        let path = state_dir.join(APIKEYS_FILE);
        let keys = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding api keys {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            keys: Mutex::new(keys),
        })
    }

    pub async fn store(&self, key: ApiKey) -> Result<()> {
        self.keys
            .lock()
            .expect("api key table poisoned")
            .insert(key.id.clone(), key);
        self.save().await
    }

    /// Fetches a key by id. Expired keys are purged on sight and reported
    /// as absent.
    pub async fn get(&self, id: &str, now: u64) -> Result<Option<ApiKey>> {
        let (key, purged) = {
            let mut keys = self.keys.lock().expect("api key table poisoned");
            match keys.get(id) {
                Some(key) if key.is_expired(now) => {
                    keys.remove(id);
                    (None, true)
                }
                Some(key) => (Some(key.clone()), false),
                None => (None, false),
            }
        };
        if purged {
            self.save().await?;
        }
        Ok(key)
    }

    async fn save(&self) -> Result<()> {
        let snapshot: Vec<ApiKey> = {
            let keys = self.keys.lock().expect("api key table poisoned");
            keys.values().cloned().collect()
        };
        let map: HashMap<String, ApiKey> = snapshot
            .into_iter()
            .map(|key| (key.id.clone(), key))
            .collect();
        let bytes = serde_json::to_vec(&map).context("encoding api keys")?;
        write_atomic(&self.path, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maelum_core::{Address, Permission, TICKET_TTL_SECS};

    fn hashes() -> (AddressHash, AddressHash) {
        (
            Address::parse("alice!").unwrap().hash(),
            Address::parse("bob!").unwrap().hash(),
        )
    }

    #[test]
    fn ticket_remove_is_single_shot() {
        let repo = TicketRepo::new();
        let (from, to) = hashes();
        let ticket = Ticket::new(from, to, None, 1_000);
        let id = ticket.id;
        repo.store(ticket);

        assert!(repo.remove(id).is_some());
        assert!(repo.remove(id).is_none());
    }

    #[test]
    fn expired_tickets_leave_the_live_set() {
        let repo = TicketRepo::new();
        let (from, to) = hashes();
        let ticket = Ticket::new(from, to, None, 1_000);
        let id = ticket.id;
        repo.store(ticket);

        assert!(repo.live_ids(1_001).contains(&id));
        assert!(!repo.live_ids(1_000 + TICKET_TTL_SECS).contains(&id));

        repo.prune(1_000 + TICKET_TTL_SECS);
        assert!(repo.get(id).is_none());
    }

    #[test]
    fn challenge_is_stable_within_its_window() {
        let repo = ChallengeRepo::new();
        let (from, to) = hashes();
        let first = repo.get_or_create(from, to, 22, 1_000);
        let second = repo.get_or_create(from, to, 22, 1_100);
        assert_eq!(first.challenge, second.challenge);
    }

    #[test]
    fn expired_challenge_is_replaced_and_cannot_be_validated() {
        let repo = ChallengeRepo::new();
        let (from, to) = hashes();
        let first = repo.get_or_create(from, to, 22, 1_000);
        let expired_at = 1_000 + CHALLENGE_TTL_SECS;

        assert!(repo.mark_valid(from, to, &first.challenge, expired_at).is_none());

        let replacement = repo.get_or_create(from, to, 22, expired_at);
        assert_ne!(replacement.challenge, first.challenge);
    }

    #[test]
    fn valid_bit_is_sticky() {
        let repo = ChallengeRepo::new();
        let (from, to) = hashes();
        let challenge = repo.get_or_create(from, to, 22, 1_000);

        let validated = repo.mark_valid(from, to, &challenge.challenge, 1_100).unwrap();
        assert!(validated.valid);

        // Even past expiry, an already-valid challenge stays valid.
        let after = repo
            .mark_valid(from, to, &challenge.challenge, 1_000 + CHALLENGE_TTL_SECS - 1)
            .unwrap();
        assert!(after.valid);

        // A wrong challenge string never validates.
        assert!(repo.mark_valid(from, to, "other", 1_100).is_none());
    }

    #[tokio::test]
    async fn subscriptions_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (from, to) = hashes();
        {
            let repo = SubscriptionRepo::load(dir.path().to_path_buf()).await.unwrap();
            repo.add(from, to, "sub-1".to_string()).await.unwrap();
            assert!(repo.has(&from, &to, "sub-1"));
        }
        let repo = SubscriptionRepo::load(dir.path().to_path_buf()).await.unwrap();
        assert!(repo.has(&from, &to, "sub-1"));
        assert!(!repo.has(&from, &to, "sub-2"));

        repo.remove(&from, &to, "sub-1").await.unwrap();
        assert!(!repo.has(&from, &to, "sub-1"));
    }

    #[tokio::test]
    async fn api_keys_expire_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ApiKeyRepo::load(dir.path().to_path_buf()).await.unwrap();
        let key = ApiKey::new(
            [Permission::Mail].into_iter().collect(),
            Some(5_000),
        );
        let id = key.id.clone();
        repo.store(key).await.unwrap();

        assert!(repo.get(&id, 4_999).await.unwrap().is_some());
        assert!(repo.get(&id, 5_000).await.unwrap().is_none());
        // Purged for good.
        assert!(repo.get(&id, 4_999).await.unwrap().is_none());
    }
}
