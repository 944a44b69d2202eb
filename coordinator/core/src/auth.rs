//! Account Authentication
//!
//! Workers authenticate once at registration with an account key issued by
//! the external account service. The directory holds the active key set and
//! answers the single question the registry asks: which account, if any,
//! does this proof belong to. Key comparison is constant-time so a
//! registration probe cannot learn key prefixes from timing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::CoordinatorError;

/// Expected account key length: sixteen decimal digits.
const ACCOUNT_KEY_LEN: usize = 16;

/// One issued account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Stable account identifier referenced by nodes and tasks.
    pub account_id: String,
    /// The account key. Issued once by the external account service.
    pub key: String,
    /// Suspended accounts keep their key but fail authentication.
    pub active: bool,
}

/// In-memory directory of issued account keys.
#[derive(Clone, Default)]
pub struct AccountDirectory {
    inner: Arc<RwLock<HashMap<String, AccountRecord>>>,
}

impl AccountDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an account record.
    pub fn insert(&self, record: AccountRecord) {
        self.inner.write().insert(record.account_id.clone(), record);
    }

    /// Remove an account. Nodes already registered stay connected; new
    /// registrations with the key fail.
    pub fn remove(&self, account_id: &str) -> Option<AccountRecord> {
        self.inner.write().remove(account_id)
    }

    /// Number of known accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Validate an account proof and resolve the owning account id.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Auth`] for malformed, unknown, or
    /// suspended keys.
    pub fn verify(&self, key: &str) -> Result<String, CoordinatorError> {
        if !Self::plausible_format(key) {
            return Err(CoordinatorError::Auth(
                "malformed account key".to_string(),
            ));
        }

        let inner = self.inner.read();

        // Scan every record so lookup time does not depend on whether or
        // where a match exists.
        let mut matched: Option<&AccountRecord> = None;
        for record in inner.values() {
            let eq = record.key.as_bytes().ct_eq(key.as_bytes());
            if bool::from(eq) {
                matched = Some(record);
            }
        }

        match matched {
            Some(record) if record.active => Ok(record.account_id.clone()),
            Some(_) => Err(CoordinatorError::Auth("account suspended".to_string())),
            None => Err(CoordinatorError::Auth("unknown account key".to_string())),
        }
    }

    /// Whether a key even has the issued shape.
    #[must_use]
    pub fn plausible_format(key: &str) -> bool {
        key.len() == ACCOUNT_KEY_LEN && key.bytes().all(|b| b.is_ascii_digit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with(key: &str, active: bool) -> AccountDirectory {
        let dir = AccountDirectory::new();
        dir.insert(AccountRecord {
            account_id: "acct-1".to_string(),
            key: key.to_string(),
            active,
        });
        dir
    }

    #[test]
    fn test_valid_key_resolves_account() {
        let dir = directory_with("1234567890123456", true);
        assert_eq!(dir.verify("1234567890123456").unwrap(), "acct-1");
    }

    #[test]
    fn test_malformed_keys_rejected() {
        let dir = directory_with("1234567890123456", true);
        assert!(dir.verify("").is_err());
        assert!(dir.verify("12345").is_err());
        assert!(dir.verify("123456789012345x").is_err());
        assert!(dir.verify("12345678901234567890").is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = directory_with("1234567890123456", true);
        assert!(matches!(
            dir.verify("6543210987654321"),
            Err(CoordinatorError::Auth(_))
        ));
    }

    #[test]
    fn test_suspended_account_rejected() {
        let dir = directory_with("1234567890123456", false);
        assert!(matches!(
            dir.verify("1234567890123456"),
            Err(CoordinatorError::Auth(_))
        ));
    }

    #[test]
    fn test_remove_revokes_future_registrations() {
        let dir = directory_with("1234567890123456", true);
        assert!(dir.verify("1234567890123456").is_ok());
        dir.remove("acct-1");
        assert!(dir.verify("1234567890123456").is_err());
    }
}
