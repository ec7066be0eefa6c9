//! Invite tokens: a server's signed permission to register an account.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::address::AddressHash;
use crate::keys::{KeyError, PrivateKey, PublicKey};

/// Errors returned when creating or parsing invite tokens.
#[derive(Debug, Error)]
pub enum InviteError {
    #[error("malformed invite token")]
    Malformed,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// A signed `{address_hash, routing_id, expiry}` tuple issued by a server's
/// routing key; required to first-register the address on that server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteToken {
    pub address_hash: AddressHash,
    pub routing_id: String,
    pub expires_at: u64,
    pub signature: Vec<u8>,
}

impl InviteToken {
    /// Issues a token for `address_hash`, signed with the server's routing
    /// key.
    pub fn new(
        address_hash: AddressHash,
        routing_id: impl Into<String>,
        expires_at: u64,
        routing_key: &PrivateKey,
    ) -> Result<Self, InviteError> {
        let routing_id = routing_id.into();
        let signature = routing_key.sign(&signing_bytes(&address_hash, &routing_id, expires_at))?;
        Ok(Self {
            address_hash,
            routing_id,
            expires_at,
            signature,
        })
    }

    /// Verifies the token signature against the issuing routing key and
    /// checks it has not expired. Fails closed on any decoding error.
    #[must_use]
    pub fn is_valid(&self, routing_key: &PublicKey, now: u64) -> bool {
        if now >= self.expires_at {
            return false;
        }
        routing_key.verify(
            &signing_bytes(&self.address_hash, &self.routing_id, self.expires_at),
            &self.signature,
        )
    }
}

fn signing_bytes(address_hash: &AddressHash, routing_id: &str, expires_at: u64) -> Vec<u8> {
    format!("{address_hash}:{routing_id}:{expires_at}").into_bytes()
}

impl fmt::Display for InviteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = format!(
            "{}:{}:{}:{}",
            self.address_hash,
            self.routing_id,
            self.expires_at,
            BASE64.encode(&self.signature)
        );
        f.write_str(&BASE64.encode(inner))
    }
}

impl FromStr for InviteToken {
    type Err = InviteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64.decode(s).map_err(|_| InviteError::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| InviteError::Malformed)?;

        let mut parts = decoded.splitn(4, ':');
        let address_hash = parts
            .next()
            .and_then(|v| AddressHash::parse(v).ok())
            .ok_or(InviteError::Malformed)?;
        let routing_id = parts.next().ok_or(InviteError::Malformed)?.to_string();
        let expires_at = parts
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(InviteError::Malformed)?;
        let signature = parts
            .next()
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(InviteError::Malformed)?;

        Ok(Self {
            address_hash,
            routing_id,
            expires_at,
            signature,
        })
    }
}
