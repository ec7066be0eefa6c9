//! Upload tickets: short-lived reservations gating the multi-step upload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::AddressHash;
use crate::pow::ProofOfWork;

/// Seconds a ticket (and its challenge) stays usable after creation.
pub const TICKET_TTL_SECS: u64 = 30 * 60;

/// A reservation for one message upload between two address hashes.
///
/// Created on the first upload request, reusable across the upload steps,
/// removed on finalise or delete, reclaimed by the GC sweep on expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub from: AddressHash,
    pub to: AddressHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work: Option<ProofOfWork>,
    pub valid: bool,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Ticket {
    /// Creates a fresh, not-yet-valid ticket.
    #[must_use]
    pub fn new(
        from: AddressHash,
        to: AddressHash,
        subscription_id: Option<String>,
        now: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            subscription_id,
            work: None,
            valid: false,
            created_at: now,
            expires_at: now + TICKET_TTL_SECS,
        }
    }

    /// Returns `true` once the ticket lifetime has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Returns `true` if the ticket admits uploads at `now`.
    #[must_use]
    pub fn is_usable(&self, now: u64) -> bool {
        self.valid && !self.is_expired(now)
    }
}
