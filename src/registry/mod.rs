//! Generic CRUD+watch registry over a [`KvStore`].
//!
//! A [`Registry`] owns one kind's key space (`<prefix>/...`). Writes are
//! guarded by the caller's expected resource version and committed with a
//! single compare-and-swap; every committed write is published to the
//! [`EventSystem`] exactly once.
//!
//! Commit and publish for a key run under that key's lock inside a spawned
//! task, so events for one key leave in commit order and a caller that
//! stops waiting cannot strand a committed write without its event.

mod event;
mod log;
mod node;
mod pod;

pub use event::{EventRegistry, DEFAULT_EVENT_NAMESPACE};
pub use log::{trim_content, LogRegistry};
pub use node::NodeRegistry;
pub use pod::{PodRegistry, PodValidator};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::Resource;
use crate::codec::{Codec, VersioningCodec};
use crate::error::{RegistryError, Result};
use crate::keylock::KeyLocks;
use crate::store::{validate_key, Entry, KvStore};
use crate::watch::{ChangeEvent, EventSystem, EventType, WatchStream};

/// Default bound for [`Registry::guaranteed_update`] retries.
pub const DEFAULT_MAX_UPDATE_RETRIES: u32 = 5;

/// Typed CRUD and watch over one kind's key space.
pub struct Registry<T: Resource, C: Codec = VersioningCodec> {
    store: Arc<dyn KvStore>,
    codec: C,
    events: EventSystem,
    locks: KeyLocks,
    max_update_retries: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource, C: Codec> Clone for Registry<T, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            codec: self.codec.clone(),
            events: self.events.clone(),
            locks: self.locks.clone(),
            max_update_retries: self.max_update_retries,
            _kind: PhantomData,
        }
    }
}

impl<T: Resource, C: Codec> Registry<T, C> {
    /// A registry with its own key locks and the default retry bound.
    pub fn new(store: Arc<dyn KvStore>, codec: C, events: EventSystem) -> Self {
        Self {
            store,
            codec,
            events,
            locks: KeyLocks::new(),
            max_update_retries: DEFAULT_MAX_UPDATE_RETRIES,
            _kind: PhantomData,
        }
    }

    /// Bound the conflict retries of [`Registry::guaranteed_update`].
    pub fn with_max_update_retries(mut self, retries: u32) -> Self {
        self.max_update_retries = retries;
        self
    }

    /// Share key locks with other registries over the same store, so
    /// per-key event order holds across every handle.
    pub fn with_locks(mut self, locks: KeyLocks) -> Self {
        self.locks = locks;
        self
    }

    /// The codec objects are stored with.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Create the object at `key`. The stored version is 1.
    pub async fn create(&self, key: &str, mut obj: T) -> Result<T> {
        self.ensure_open()?;
        self.check_object_key(key, &obj)?;

        let meta = obj.metadata_mut();
        meta.resource_version = 1;
        if meta.uid.is_none() {
            meta.uid = Some(Uuid::new_v4().to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(SystemTime::now());
        }
        let bytes = self.codec.encode(&obj)?;
        let event = ChangeEvent::new(key, EventType::Added, &obj, bytes.clone());

        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();
        self.commit(key, event, async move {
            store.compare_and_swap(&owned_key, 0, bytes).await
        })
        .await?;

        debug!(kind = T::KIND, key, "created");
        Ok(obj)
    }

    /// Replace the object at `key` if its stored version is `expected_version`.
    pub async fn update(&self, key: &str, mut obj: T, expected_version: u64) -> Result<T> {
        self.ensure_open()?;
        self.check_object_key(key, &obj)?;

        let current = self.load_live(key, expected_version).await?;
        // Identity assigned at creation survives updates.
        match self.codec.decode::<T>(&current.value) {
            Ok(stored) => {
                let stored = stored.metadata();
                let meta = obj.metadata_mut();
                meta.uid = stored.uid.clone();
                meta.creation_timestamp = stored.creation_timestamp;
            }
            Err(err) => {
                warn!(key, error = %err, "replacing undecodable entry, identity not carried over");
                let meta = obj.metadata_mut();
                if meta.uid.is_none() {
                    meta.uid = Some(Uuid::new_v4().to_string());
                }
                if meta.creation_timestamp.is_none() {
                    meta.creation_timestamp = Some(SystemTime::now());
                }
            }
        }
        obj.metadata_mut().resource_version = expected_version + 1;

        let bytes = self.codec.encode(&obj)?;
        let event = ChangeEvent::new(key, EventType::Modified, &obj, bytes.clone());

        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();
        self.commit(key, event, async move {
            store
                .compare_and_swap(&owned_key, expected_version, bytes)
                .await
        })
        .await?;

        debug!(kind = T::KIND, key, version = expected_version + 1, "updated");
        Ok(obj)
    }

    /// Remove the object at `key` if its stored version is `expected_version`.
    ///
    /// Returns the final state, stamped with the version of the delete. An
    /// entry that no longer decodes is still removed; it yields `None` and
    /// its `Deleted` event carries no snapshot.
    pub async fn delete(&self, key: &str, expected_version: u64) -> Result<Option<T>> {
        self.ensure_open()?;
        self.check_key(key)?;

        let current = self.load_live(key, expected_version).await?;
        let deleted_version = expected_version + 1;
        let (obj, event) = match self.codec.decode::<T>(&current.value) {
            Ok(mut obj) => {
                obj.metadata_mut().resource_version = deleted_version;
                let bytes = self.codec.encode(&obj)?;
                let event = ChangeEvent::new(key, EventType::Deleted, &obj, bytes);
                (Some(obj), event)
            }
            Err(err) => {
                warn!(key, error = %err, "deleting undecodable entry");
                let event = ChangeEvent::without_snapshot::<T>(key, EventType::Deleted, deleted_version);
                (None, event)
            }
        };

        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();
        self.commit(key, event, async move {
            store.delete(&owned_key, expected_version).await?;
            Ok(deleted_version)
        })
        .await?;

        debug!(kind = T::KIND, key, "deleted");
        Ok(obj)
    }

    /// The live object at `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        self.check_key(key)?;
        match self.store.get(key).await? {
            Some(entry) => Ok(Some(self.codec.decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Live objects under `prefix`, in key order.
    ///
    /// The store is scanned once; entries that fail to decode are skipped.
    pub async fn list(&self, prefix: &str) -> Result<ListIter<T, C>> {
        let prefix = self.scoped_prefix(prefix)?;
        let entries = self.store.list_prefix(&prefix).await?;
        Ok(ListIter {
            entries: entries.into_iter(),
            codec: self.codec.clone(),
            _kind: PhantomData,
        })
    }

    /// Every live object of this kind.
    pub async fn list_all(&self) -> Result<Vec<T>> {
        Ok(self.list(T::PREFIX).await?.collect())
    }

    /// Stream changes under `prefix` committed after this call returns.
    pub fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let prefix = self.scoped_prefix(prefix)?;
        Ok(self.events.watch(prefix))
    }

    /// Read-modify-write with retry on `Conflict`.
    ///
    /// `mutate` is re-applied to a fresh read after each conflict, so it
    /// must be safe to run more than once.
    pub async fn guaranteed_update<F>(&self, key: &str, mut mutate: F) -> Result<T>
    where
        F: FnMut(&mut T) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            let mut obj = self
                .get(key)
                .await?
                .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
            let version = obj.metadata().resource_version;
            mutate(&mut obj)?;

            match self.update(key, obj, version).await {
                Err(err) if err.is_conflict() && attempt < self.max_update_retries => {
                    attempt += 1;
                    debug!(kind = T::KIND, key, attempt, "retrying after conflict");
                }
                result => return result,
            }
        }
    }

    /// Create `obj` at the key derived from its identity.
    pub async fn create_object(&self, obj: T) -> Result<T> {
        let key = obj.key();
        self.create(&key, obj).await
    }

    /// Update `obj` at its derived key, expecting its own resource version.
    pub async fn update_object(&self, obj: T) -> Result<T> {
        let key = obj.key();
        let version = obj.metadata().resource_version;
        self.update(&key, obj, version).await
    }

    /// Read the entry at `key` and check it against `expected_version`.
    async fn load_live(&self, key: &str, expected_version: u64) -> Result<Entry> {
        let current = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        if current.version != expected_version {
            return Err(RegistryError::Conflict {
                key: key.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }
        Ok(current)
    }

    /// Run `write` and publish `event` under the key lock, detached from the
    /// caller so both complete even if the caller goes away.
    async fn commit<F>(&self, key: &str, event: ChangeEvent, write: F) -> Result<u64>
    where
        F: std::future::Future<Output = Result<u64>> + Send + 'static,
    {
        let locks = self.locks.clone();
        let events = self.events.clone();
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            let _guard = locks.lock(&owned_key).await;
            let version = write.await?;
            if version != event.resource_version {
                warn!(
                    key = %owned_key,
                    expected = event.resource_version,
                    got = version,
                    "store returned unexpected version"
                );
            }
            events.publish(event);
            Ok(version)
        });

        task.await
            .map_err(|e| RegistryError::StoreUnavailable(format!("write task failed: {}", e)))?
    }

    fn ensure_open(&self) -> Result<()> {
        if self.events.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        Ok(())
    }

    fn check_key(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let in_kind = key
            .strip_prefix(T::PREFIX)
            .map_or(false, |rest| rest.starts_with('/'));
        if !in_kind {
            return Err(RegistryError::InvalidInput(format!(
                "key {} is outside the {} key space",
                key,
                T::PREFIX
            )));
        }
        Ok(())
    }

    fn check_object_key(&self, key: &str, obj: &T) -> Result<()> {
        self.check_key(key)?;
        let derived = obj.key();
        if derived != key {
            return Err(RegistryError::InvalidInput(format!(
                "key {} does not match object identity {}",
                key, derived
            )));
        }
        Ok(())
    }

    /// Restrict a list/watch prefix to this kind's key space.
    fn scoped_prefix(&self, prefix: &str) -> Result<String> {
        let trimmed = prefix.trim_end_matches('/');
        if trimmed == T::PREFIX {
            return Ok(format!("{}/", T::PREFIX));
        }
        match trimmed.strip_prefix(T::PREFIX) {
            Some(rest) if rest.starts_with('/') => Ok(prefix.to_string()),
            _ => Err(RegistryError::InvalidInput(format!(
                "prefix {} is outside the {} key space",
                prefix,
                T::PREFIX
            ))),
        }
    }
}

/// Lazy, single-pass iterator over listed objects.
pub struct ListIter<T, C> {
    entries: std::vec::IntoIter<Entry>,
    codec: C,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource, C: Codec> Iterator for ListIter<T, C> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        for entry in self.entries.by_ref() {
            match self.codec.decode(&entry.value) {
                Ok(obj) => return Some(obj),
                Err(err) => warn!(key = %entry.key, error = %err, "skipping undecodable entry"),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.entries.len()))
    }
}
