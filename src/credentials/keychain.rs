//! OS keychain source.
//!
//! Entries live under the service `stax` with the install name (or `global`)
//! as the user field; the password is a JSON-encoded [`CredentialRecord`].
//!
//! A keychain that cannot be reached (headless session, locked keychain, no
//! native backend) answers [`Lookup::Unavailable`] and the resolver moves on.

use super::sources::{CredentialRecord, Lookup, SecretSource};
use super::DiagnosticReport;

/// Service name used for all stax keychain entries.
pub const SERVICE: &str = "stax";

/// User field of the entry shared by every install.
pub const GLOBAL_USER: &str = "global";

#[derive(Debug, Clone)]
pub struct KeychainSource {
    service: String,
}

impl Default for KeychainSource {
    fn default() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }
}

enum Entry {
    Found(CredentialRecord),
    Missing,
    Unavailable(String),
    Failed(String),
}

impl KeychainSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, user: &str) -> Entry {
        let entry = match keyring::Entry::new(&self.service, user) {
            Ok(e) => e,
            Err(e) => return Entry::Unavailable(e.to_string()),
        };
        match entry.get_password() {
            Ok(json) => match serde_json::from_str::<CredentialRecord>(&json) {
                Ok(record) => Entry::Found(record),
                Err(e) => Entry::Failed(format!(
                    "keychain entry {}/{} is not a credential record: {}",
                    self.service, user, e
                )),
            },
            Err(keyring::Error::NoEntry) => Entry::Missing,
            Err(e) => Entry::Unavailable(e.to_string()),
        }
    }

    /// Check whether the OS keychain backend is functional.
    ///
    /// Performs a real round-trip check: writes a test value, reads it back,
    /// and deletes it. Catches the case where `keyring` falls back to a
    /// non-persistent mock store.
    pub fn available(&self) -> bool {
        let entry = match keyring::Entry::new(&self.service, "__stax_keychain_check__") {
            Ok(e) => e,
            Err(_) => return false,
        };

        let check_value = "__stax_keychain_check_value__";
        if entry.set_password(check_value).is_err() {
            return false;
        }

        let ok = entry
            .get_password()
            .map(|v| v == check_value)
            .unwrap_or(false);

        let _ = entry.delete_credential();
        ok
    }
}

impl SecretSource for KeychainSource {
    fn describe(&self) -> String {
        format!("keychain (service '{}')", self.service)
    }

    fn lookup(&self, install: &str) -> Lookup {
        let specific = match self.read(install) {
            Entry::Found(r) => Some(r),
            Entry::Missing => None,
            Entry::Unavailable(reason) => return Lookup::Unavailable(reason),
            Entry::Failed(e) => return Lookup::Failed(e),
        };
        let global = match self.read(GLOBAL_USER) {
            Entry::Found(r) => Some(r),
            Entry::Missing => None,
            Entry::Unavailable(reason) if specific.is_none() => {
                return Lookup::Unavailable(reason);
            }
            Entry::Unavailable(_) => None,
            Entry::Failed(e) if specific.is_none() => return Lookup::Failed(e),
            Entry::Failed(e) => {
                tracing::debug!(error = %e, "ignoring unreadable global keychain entry");
                None
            }
        };

        let record = match (specific, global) {
            (Some(s), Some(g)) => s.or(&g),
            (Some(s), None) => s,
            (None, Some(g)) => g,
            (None, None) => return Lookup::Missing,
        };
        match record.into_credentials() {
            Ok(creds) if creds.is_empty() => Lookup::Missing,
            Ok(creds) => Lookup::Found(creds),
            Err(e) => Lookup::Failed(e),
        }
    }

    fn diagnose(&self) -> DiagnosticReport {
        if !self.available() {
            return DiagnosticReport::warning(
                "keychain",
                "OS keychain is not available on this host",
            )
            .with_detail(["credentials will be read from the environment or file".to_string()]);
        }
        match self.read(GLOBAL_USER) {
            Entry::Found(_) => DiagnosticReport::ok("keychain", "global entry present"),
            Entry::Missing => DiagnosticReport::ok("keychain", "available, no global entry"),
            Entry::Unavailable(reason) => DiagnosticReport::warning("keychain", reason),
            Entry::Failed(e) => DiagnosticReport::error("keychain", e),
        }
    }
}
