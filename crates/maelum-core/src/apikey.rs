//! Management API keys with scoped permissions and expiry.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned when parsing permissions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("unknown permission: {0}")]
    Unknown(String),
}

/// The closed set of management permissions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Trigger an immediate processor retry sweep.
    Flush,
    /// Inject mail on behalf of the server.
    Mail,
    /// Generate account invites.
    Invite,
    /// Mint further (non-admin) API keys.
    ApiKeys,
}

impl Permission {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Permission::Flush => "flush",
            Permission::Mail => "mail",
            Permission::Invite => "invite",
            Permission::ApiKeys => "apikeys",
        }
    }

    /// Every permission, in wire order.
    #[must_use]
    pub const fn all() -> [Permission; 4] {
        [
            Permission::Flush,
            Permission::Mail,
            Permission::Invite,
            Permission::ApiKeys,
        ]
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flush" => Ok(Permission::Flush),
            "mail" => Ok(Permission::Mail),
            "invite" => Ok(Permission::Invite),
            "apikeys" => Ok(Permission::ApiKeys),
            other => Err(PermissionError::Unknown(other.to_string())),
        }
    }
}

/// Parses a list of permission names, rejecting any unknown entry.
pub fn parse_permissions(names: &[String]) -> Result<BTreeSet<Permission>, PermissionError> {
    names.iter().map(|name| name.parse()).collect()
}

/// A bearer key identifying a management actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub is_admin: bool,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<u64>,
}

impl ApiKey {
    /// Mints a regular key with an explicit permission subset.
    #[must_use]
    pub fn new(permissions: BTreeSet<Permission>, valid_until: Option<u64>) -> Self {
        Self {
            id: generate_key_id(),
            is_admin: false,
            permissions,
            valid_until,
        }
    }

    /// Mints an admin key; admin implies every permission and never
    /// expires. Only reachable from the local CLI.
    #[must_use]
    pub fn new_admin() -> Self {
        Self {
            id: generate_key_id(),
            is_admin: true,
            permissions: BTreeSet::new(),
            valid_until: None,
        }
    }

    /// Exact set-membership permission check; admin passes everything.
    #[must_use]
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.is_admin || self.permissions.contains(&permission)
    }

    /// Returns `true` once the key has expired.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.valid_until.is_some_and(|until| now >= until)
    }
}

fn generate_key_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("BMK-{}", BASE64_URL.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_has_every_permission() {
        let key = ApiKey::new_admin();
        for permission in Permission::all() {
            assert!(key.has_permission(permission));
        }
        assert!(!key.is_expired(u64::MAX - 1));
    }

    #[test]
    fn regular_key_checks_exact_membership() {
        let perms = [Permission::Mail, Permission::Invite].into_iter().collect();
        let key = ApiKey::new(perms, Some(10_000));
        assert!(key.has_permission(Permission::Mail));
        assert!(key.has_permission(Permission::Invite));
        assert!(!key.has_permission(Permission::Flush));
        assert!(!key.has_permission(Permission::ApiKeys));
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let key = ApiKey::new(BTreeSet::new(), Some(500));
        assert!(!key.is_expired(499));
        assert!(key.is_expired(500));
    }

    #[test]
    fn permission_names_round_trip() {
        for permission in Permission::all() {
            assert_eq!(
                permission.as_str().parse::<Permission>().unwrap(),
                permission
            );
        }
        assert!("FLUSH".parse::<Permission>().is_ok());
        assert!("root".parse::<Permission>().is_err());
    }

    #[test]
    fn parse_permissions_rejects_unknown_entries() {
        let ok = parse_permissions(&["mail".to_string(), "flush".to_string()]).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(parse_permissions(&["mail".to_string(), "bogus".to_string()]).is_err());
    }

    #[test]
    fn key_ids_are_unique_and_prefixed() {
        let a = ApiKey::new_admin();
        let b = ApiKey::new_admin();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("BMK-"));
    }
}
