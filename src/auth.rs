//! Credential store
//!
//! Users are configured by plaintext secret; only the 56-byte hex form of
//! `SHA224(secret)` is kept and compared.

use dashmap::DashSet;
use sha2::{Digest, Sha224};

use crate::core::hooks::Authenticator;

/// Length of a credential on the wire
pub const CREDENTIAL_LEN: usize = 56;

/// Hash password using SHA224
pub fn hash_password(password: &str) -> [u8; 28] {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 28];
    hash.copy_from_slice(&result);
    hash
}

/// Convert password to its lowercase hex credential
pub fn password_to_hex(password: &str) -> [u8; CREDENTIAL_LEN] {
    let mut hex_bytes = [0u8; CREDENTIAL_LEN];
    // 28 bytes always encode to exactly 56 hex chars
    let _ = hex::encode_to_slice(hash_password(password), &mut hex_bytes);
    hex_bytes
}

/// Set of authorized credentials
///
/// Sharded, so `validate` on the accept path never waits on a global lock
/// and the set can be replaced while serving.
#[derive(Debug, Default)]
pub struct UserStore {
    users: DashSet<[u8; CREDENTIAL_LEN]>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from plaintext secrets
    pub fn from_secrets<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        for secret in secrets {
            store.add_user(secret.as_ref());
        }
        store
    }

    /// Authorize `secret`. Returns false if it was already present.
    pub fn add_user(&self, secret: &str) -> bool {
        self.users.insert(password_to_hex(secret))
    }

    /// Revoke `secret`. Returns false if it was not present.
    pub fn remove_user(&self, secret: &str) -> bool {
        self.users.remove(&password_to_hex(secret)).is_some()
    }

    /// Swap the whole user list.
    ///
    /// New credentials are inserted before stale ones are removed, so a user
    /// present in both lists is never briefly rejected.
    pub fn replace_users<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fresh: Vec<[u8; CREDENTIAL_LEN]> = secrets
            .into_iter()
            .map(|s| password_to_hex(s.as_ref()))
            .collect();
        for credential in &fresh {
            self.users.insert(*credential);
        }
        self.users.retain(|credential| fresh.contains(credential));
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for UserStore {
    fn validate(&self, credential: &str) -> bool {
        let Ok(key) = <[u8; CREDENTIAL_LEN]>::try_from(credential.as_bytes()) else {
            return false;
        };
        self.users.contains(&key)
    }
}
