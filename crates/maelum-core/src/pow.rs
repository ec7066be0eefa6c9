//! Proof of work gating untrusted senders.
//!
//! A proof is a nonce such that `SHA-256(challenge ∥ varint(nonce))` has at
//! least `bits` leading zero bits. The solver searches nonces
//! incrementally, optionally sharded across CPU cores; verification is a
//! single hash and a bit-prefix check.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors returned when parsing serialized proofs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PowError {
    #[error("malformed proof of work string; expected \"bits$challenge$nonce\"")]
    MalformedProof,
}

/// A proof-of-work challenge, optionally solved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWork {
    pub bits: u8,
    pub challenge: String,
    pub nonce: u64,
    pub done: bool,
}

impl ProofOfWork {
    /// Creates an unsolved challenge.
    #[must_use]
    pub fn new(bits: u8, challenge: impl Into<String>) -> Self {
        Self {
            bits,
            challenge: challenge.into(),
            nonce: 0,
            done: false,
        }
    }

    /// Creates a proof with a known nonce (already worked).
    #[must_use]
    pub fn with_nonce(bits: u8, challenge: impl Into<String>, nonce: u64) -> Self {
        Self {
            bits,
            challenge: challenge.into(),
            nonce,
            done: true,
        }
    }

    /// Returns `true` if the proof has been worked and its nonce satisfies
    /// the advertised difficulty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.done && verify(&self.challenge, self.nonce, self.bits)
    }

    /// Searches for a satisfying nonce on the current thread, starting at
    /// `self.nonce`.
    pub fn work(&mut self) {
        let mut nonce = self.nonce;
        while !verify(&self.challenge, nonce, self.bits) {
            nonce += 1;
        }
        self.nonce = nonce;
        self.done = true;
    }

    /// Searches for a satisfying nonce with `cores` worker threads, each
    /// walking a stride of the nonce space. The smallest-effort winner is
    /// whichever shard finds a solution first.
    pub fn work_parallel(&mut self, cores: usize) {
        let cores = cores.max(1) as u64;
        let found = AtomicBool::new(false);
        let winner = AtomicU64::new(u64::MAX);
        let bits = self.bits;
        let challenge = self.challenge.as_str();

        std::thread::scope(|scope| {
            for shard in 0..cores {
                let found = &found;
                let winner = &winner;
                scope.spawn(move || {
                    let mut nonce = shard;
                    while !found.load(Ordering::Relaxed) {
                        if verify(challenge, nonce, bits) {
                            winner.fetch_min(nonce, Ordering::SeqCst);
                            found.store(true, Ordering::SeqCst);
                            return;
                        }
                        nonce += cores;
                    }
                });
            }
        });

        self.nonce = winner.load(Ordering::SeqCst);
        self.done = true;
    }
}

impl fmt::Display for ProofOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}${}", self.bits, self.challenge, self.nonce)
    }
}

impl FromStr for ProofOfWork {
    type Err = PowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '$');
        let bits = parts
            .next()
            .and_then(|v| v.parse::<u8>().ok())
            .ok_or(PowError::MalformedProof)?;
        let challenge = parts.next().ok_or(PowError::MalformedProof)?;
        let nonce = parts
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(PowError::MalformedProof)?;
        Ok(Self::with_nonce(bits, challenge, nonce))
    }
}

/// Verifies that `SHA-256(challenge ∥ varint(nonce))` has at least `bits`
/// leading zero bits.
#[must_use]
pub fn verify(challenge: &str, nonce: u64, bits: u8) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(varint(nonce));
    let digest = hasher.finalize();
    has_leading_zero_bits(&digest, bits)
}

/// Unsigned LEB128 encoding of `value`.
fn varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn has_leading_zero_bits(digest: &[u8], bits: u8) -> bool {
    if bits == 0 {
        return true;
    }

    let full_bytes = (bits / 8) as usize;
    let remaining_bits = bits % 8;

    if digest.iter().take(full_bytes).any(|&byte| byte != 0) {
        return false;
    }

    if remaining_bits == 0 {
        return true;
    }

    if full_bytes >= digest.len() {
        return false;
    }

    let mask = 0xffu8 << (8 - remaining_bits);
    digest[full_bytes] & mask == 0
}
