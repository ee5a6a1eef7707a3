//! In-memory key-value store.
//!
//! Not durable - data is lost on process exit. Compare-and-swap is the
//! check-then-write sequence performed under the map's write lock, so it is
//! atomic against every other writer in the process.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::Result;
use crate::store::{mismatch, validate_key, Entry, KvStore};

/// In-memory implementation of KvStore.
///
/// Uses a BTreeMap for ordered key iteration and RwLock for concurrency.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of entries in the store.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        validate_key(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<u64> {
        validate_key(key)?;

        let mut data = self.data.write();
        let current = data.get(key);
        let current_version = current.map(|e| e.version).unwrap_or(0);

        if current_version != expected_version {
            return Err(mismatch(key, expected_version, current_version));
        }

        let now = SystemTime::now();
        let new_version = current_version + 1;
        let entry = Entry {
            key: key.to_string(),
            value,
            version: new_version,
            created_at: current.map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
        };
        data.insert(key.to_string(), entry);

        Ok(new_version)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        validate_key(key)?;

        let mut data = self.data.write();
        let current_version = data.get(key).map(|e| e.version).unwrap_or(0);
        if current_version == 0 || current_version != expected_version {
            return Err(mismatch(key, expected_version.max(1), current_version));
        }
        data.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<Entry>> {
        let data = self.data.read();
        let entries = data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect();
        Ok(entries)
    }
}
