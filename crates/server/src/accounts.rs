//! Accounts and caller privileges.
//!
//! Accounts come from the `[auth]` section of the configuration. Passwords
//! are stored as hex SHA-256 digests and compared in constant time.

use std::collections::HashMap;

use protocol::{Role, SessionInfo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A configured account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Login name.
    pub username: String,
    /// Hex SHA-256 of the password.
    pub password_sha256: String,
    /// Privilege level.
    #[serde(default)]
    pub role: Role,
}

/// Hex SHA-256 digest of a password, as stored in the configuration.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Account name.
    pub username: String,
    /// Account role.
    pub role: Role,
}

impl Caller {
    /// Check if the caller may delete entries.
    pub fn can_delete(&self) -> bool {
        self.role.is_admin()
    }

    /// Session view returned to the front end.
    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            username: self.username.clone(),
            role: self.role,
        }
    }
}

/// Lookup table of configured accounts.
#[derive(Debug, Clone, Default)]
pub struct AccountStore {
    accounts: HashMap<String, Account>,
}

impl AccountStore {
    /// Build the store from configured accounts.
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|a| (a.username.clone(), a))
                .collect(),
        }
    }

    /// Check a username and password.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<Caller> {
        let account = self.accounts.get(username)?;
        let supplied = hash_password(password);
        let expected = account.password_sha256.to_ascii_lowercase();
        constant_time_eq(supplied.as_bytes(), expected.as_bytes()).then(|| Caller {
            username: account.username.clone(),
            role: account.role,
        })
    }

    /// Number of configured accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no account is configured.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
