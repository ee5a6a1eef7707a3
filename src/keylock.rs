//! Per-key async lock that serializes a key's commit with its publication.
//!
//! Entries are held as `Weak` references and removed as soon as the last
//! guard for a key drops, so the map only ever contains keys with a write
//! in flight.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Weak<Mutex<()>>>;

/// Held while a write to `key` is committed and published.
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    key: String,
    locks: Arc<LockMap>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Only `self.lock` remains once no other task holds or awaits the key.
        if Arc::strong_count(&self.lock) == 1 {
            self.locks
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

#[derive(Clone, Default)]
pub struct KeyLocks {
    locks: Arc<LockMap>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Different keys never contend.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = self.get_or_create(key);
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            lock,
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.to_string()) {
                Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    /// Number of keys with a live lock.
    pub fn active(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}
