//! Canonical address parsing and the deterministic address hash.
//!
//! Addresses have the form `local!` or `local@organisation!`. The canonical
//! string is lowercase; its SHA-256 hex digest is the only identifier that
//! ever appears on the wire.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::hash::sha256;

const PART_MAX_LEN: usize = 64;

/// Errors returned when parsing addresses or address hashes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must end with '!'")]
    MissingTerminator,
    #[error("address part is empty")]
    EmptyPart,
    #[error("address part exceeds {PART_MAX_LEN} characters")]
    PartTooLong,
    #[error("invalid character {0:?} in address")]
    InvalidCharacter(char),
    #[error("address contains more than one '@'")]
    MultipleOrgSeparators,
    #[error("address hash must be 64 hexadecimal characters")]
    InvalidHash,
}

/// A validated, normalised address `local[@org]!`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    local: String,
    org: Option<String>,
}

impl Address {
    /// Parses and normalises an address. Input is lowercased before
    /// validation.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim().to_ascii_lowercase();
        let stripped = input
            .strip_suffix('!')
            .ok_or(AddressError::MissingTerminator)?;

        let mut parts = stripped.split('@');
        let local = parts.next().unwrap_or_default();
        let org = parts.next();
        if parts.next().is_some() {
            return Err(AddressError::MultipleOrgSeparators);
        }

        validate_part(local, true)?;
        if let Some(org) = org {
            validate_part(org, false)?;
        }

        Ok(Self {
            local: local.to_string(),
            org: org.map(str::to_string),
        })
    }

    /// Returns the local part of the address.
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Returns the organisation part, if any.
    #[must_use]
    pub fn org(&self) -> Option<&str> {
        self.org.as_deref()
    }

    /// Computes the address hash over the canonical string form.
    #[must_use]
    pub fn hash(&self) -> AddressHash {
        AddressHash::from(sha256(self.to_string().as_bytes()))
    }

    /// Computes the hash of the organisation part alone, if present.
    #[must_use]
    pub fn org_hash(&self) -> Option<AddressHash> {
        self.org
            .as_deref()
            .map(|org| AddressHash::from(sha256(org.as_bytes())))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.org {
            Some(org) => write!(f, "{}@{}!", self.local, org),
            None => write!(f, "{}!", self.local),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_part(part: &str, allow_underscore: bool) -> Result<(), AddressError> {
    if part.is_empty() {
        return Err(AddressError::EmptyPart);
    }
    if part.len() > PART_MAX_LEN {
        return Err(AddressError::PartTooLong);
    }

    let mut chars = part.chars();
    let first = chars.next().ok_or(AddressError::EmptyPart)?;
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return Err(AddressError::InvalidCharacter(first));
    }
    for ch in chars {
        let ok = ch.is_ascii_lowercase()
            || ch.is_ascii_digit()
            || ch == '.'
            || ch == '-'
            || (allow_underscore && ch == '_');
        if !ok {
            return Err(AddressError::InvalidCharacter(ch));
        }
    }
    Ok(())
}

/// SHA-256 of a canonical address, carried on the wire as 64 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressHash([u8; 32]);

impl AddressHash {
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses a 64-character lowercase hex string.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        if input.len() != 64 {
            return Err(AddressError::InvalidHash);
        }
        let bytes = hex::decode(input).map_err(|_| AddressError::InvalidHash)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| AddressError::InvalidHash)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for AddressHash {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl TryFrom<&str> for AddressHash {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl FromStr for AddressHash {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<[u8]> for AddressHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for AddressHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct AddressHashVisitor;

impl Visitor<'_> for AddressHashVisitor {
    type Value = AddressHash;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a 64-character hexadecimal address hash")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: DeError,
    {
        AddressHash::parse(v).map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for AddressHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(AddressHashVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_org_addresses() {
        let plain = Address::parse("alice!").unwrap();
        assert_eq!(plain.local(), "alice");
        assert_eq!(plain.org(), None);
        assert_eq!(plain.to_string(), "alice!");

        let org = Address::parse("bob@acme!").unwrap();
        assert_eq!(org.local(), "bob");
        assert_eq!(org.org(), Some("acme"));
        assert_eq!(org.to_string(), "bob@acme!");
    }

    #[test]
    fn normalises_to_lowercase() {
        let addr = Address::parse("Alice@ACME!").unwrap();
        assert_eq!(addr.to_string(), "alice@acme!");
        assert_eq!(addr.hash(), Address::parse("alice@acme!").unwrap().hash());
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(Address::parse("alice").is_err());
        assert!(Address::parse("!").is_err());
        assert!(Address::parse("@acme!").is_err());
        assert!(Address::parse("a@b@c!").is_err());
        assert!(Address::parse("-alice!").is_err());
        assert!(Address::parse("al ice!").is_err());
        assert!(Address::parse("alice@ac_me!").is_err());
    }

    #[test]
    fn underscore_allowed_only_in_local_part() {
        assert!(Address::parse("al_ice!").is_ok());
        assert!(Address::parse("al_ice@acme!").is_ok());
        assert!(Address::parse("alice@ac_me!").is_err());
    }

    #[test]
    fn hash_is_sha256_of_canonical_form() {
        let addr = Address::parse("example!").unwrap();
        assert_eq!(
            addr.hash().to_string(),
            crate::hash::sha256_hex(b"example!")
        );
    }

    #[test]
    fn address_hash_round_trips_through_hex() {
        let hash = Address::parse("alice!").unwrap().hash();
        let parsed = AddressHash::parse(&hash.to_string()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn address_hash_rejects_bad_input() {
        assert!(AddressHash::parse("abc").is_err());
        assert!(AddressHash::parse(&"zz".repeat(32)).is_err());
    }
}
