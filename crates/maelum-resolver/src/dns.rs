//! Reserved-name proof via DNS TXT records.
//!
//! Top-level names on the allow-list of DNS-verified domains may only be
//! claimed by whoever controls the matching domain, proven by a
//! `_bitmaelum TXT <fingerprint>` record. The TXT transport is injected so
//! deployments wire in a live resolver and tests supply a table.

use std::collections::HashMap;
use std::io;

use maelum_core::{Address, PublicKey};

use crate::ResolveError;

/// TXT record transport.
pub trait TxtLookup: Send + Sync {
    /// Returns the TXT strings published at `name`, or an I/O error when
    /// the lookup itself fails.
    fn lookup(&self, name: &str) -> io::Result<Vec<String>>;
}

/// Table-backed lookup for tests and fixed deployments.
#[derive(Debug, Default)]
pub struct StaticTxtLookup {
    records: HashMap<String, Vec<String>>,
}

impl StaticTxtLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.records.entry(name.into()).or_default().push(value.into());
    }
}

impl TxtLookup for StaticTxtLookup {
    fn lookup(&self, name: &str) -> io::Result<Vec<String>> {
        Ok(self.records.get(name).cloned().unwrap_or_default())
    }
}

/// Checks whether an address claims a reserved top-level name, and if so
/// whether the claimant's key fingerprint is proven on one of the allowed
/// domains.
pub struct ReservedNameGuard {
    allowed_domains: Vec<String>,
    txt: Box<dyn TxtLookup>,
}

impl ReservedNameGuard {
    #[must_use]
    pub fn new(allowed_domains: Vec<String>, txt: Box<dyn TxtLookup>) -> Self {
        Self {
            allowed_domains: allowed_domains
                .into_iter()
                .map(|domain| domain.to_ascii_lowercase())
                .collect(),
            txt,
        }
    }

    /// Returns the allow-listed domains whose first label equals the
    /// address's top-level name.
    fn matching_domains(&self, address: &Address) -> Vec<&str> {
        // Org-scoped names hang off the organisation, not the top level.
        if address.org().is_some() {
            return Vec::new();
        }
        self.allowed_domains
            .iter()
            .filter(|domain| {
                domain
                    .split('.')
                    .next()
                    .is_some_and(|label| label == address.local())
            })
            .map(String::as_str)
            .collect()
    }

    /// Enforces the reserved-name rule before publication. Non-reserved
    /// names pass unconditionally; reserved names need a
    /// `_bitmaelum.<domain>` TXT record carrying the key fingerprint.
    pub fn check(&self, address: &Address, key: &PublicKey) -> Result<(), ResolveError> {
        let domains = self.matching_domains(address);
        if domains.is_empty() {
            return Ok(());
        }

        let fingerprint = key.fingerprint();
        for domain in domains {
            let name = format!("_bitmaelum.{domain}");
            match self.txt.lookup(&name) {
                Ok(records) if records.iter().any(|record| record.trim() == fingerprint) => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, domain = %domain, "reserved name TXT lookup failed");
                }
            }
        }

        Err(ResolveError::ReservedName {
            name: address.to_string(),
        })
    }
}
