//! KvStore trait - the capability every storage backend provides.
//!
//! Keys are slash-separated paths (`pods/default/web`, `nodes/n1`) kept in
//! lexicographic order so a kind's objects can be listed by prefix. Values
//! are opaque bytes. Every key carries a version that starts at 1 and
//! increases by one on each successful compare-and-swap.
//!
//! Mutation only happens through [`KvStore::compare_and_swap`] and
//! [`KvStore::delete`], both conditional on the caller's expected version.

use async_trait::async_trait;
use std::time::SystemTime;

use crate::error::{RegistryError, Result};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// A stored entry with metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The key.
    pub key: String,
    /// The value (opaque bytes).
    pub value: Vec<u8>,
    /// Version of this value (per key).
    pub version: u64,
    /// When the key was first written.
    pub created_at: SystemTime,
    /// When the key was last written.
    pub updated_at: SystemTime,
}

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(RegistryError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(RegistryError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(RegistryError::InvalidKey(format!(
            "key must not start or end with '/': {}",
            key
        )));
    }
    if key.split('/').any(str::is_empty) {
        return Err(RegistryError::InvalidKey(format!(
            "key has an empty segment: {}",
            key
        )));
    }
    Ok(())
}

/// The key-value capability consumed by the registry.
///
/// Implementations must make `compare_and_swap` and `delete` atomic with
/// respect to every other writer of the same key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get an entry by key.
    ///
    /// Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Write `value` only if the current version equals `expected_version`.
    ///
    /// An `expected_version` of 0 means the key must not exist. Returns the
    /// new version (`expected_version + 1`). Fails with `AlreadyExists` when
    /// creating over an existing key, `NotFound` when updating an absent
    /// key, and `Conflict` on any other version mismatch.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<u64>;

    /// Remove a key only if its current version equals `expected_version`.
    async fn delete(&self, key: &str, expected_version: u64) -> Result<()>;

    /// List entries whose key starts with `prefix`, in lexicographic order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<Entry>>;

    /// Get the current version of a key (0 if not exists).
    async fn version(&self, key: &str) -> Result<u64> {
        Ok(self.get(key).await?.map(|e| e.version).unwrap_or(0))
    }
}

/// Map a version mismatch to the error the store contract promises.
pub(crate) fn mismatch(key: &str, expected: u64, found: u64) -> RegistryError {
    match (expected, found) {
        (0, _) => RegistryError::AlreadyExists(key.to_string()),
        (_, 0) => RegistryError::NotFound(key.to_string()),
        _ => RegistryError::Conflict {
            key: key.to_string(),
            expected,
            found,
        },
    }
}
