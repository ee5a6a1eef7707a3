//! Event registry.
//!
//! Events record what happened to other objects. They live under
//! `events/<namespace>/<name>`; events about cluster-scoped objects use
//! [`DEFAULT_EVENT_NAMESPACE`].

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::Registry;
use crate::api::{object_key, Event, EventSeverity, ObjectMeta, ObjectReference, Resource};
use crate::codec::{Codec, VersioningCodec};
use crate::error::{RegistryError, Result};
use crate::store::KvStore;
use crate::validation::validate_event;
use crate::watch::{EventSystem, WatchStream};

/// Namespace used for events about cluster-scoped objects.
pub const DEFAULT_EVENT_NAMESPACE: &str = "default";

/// Recorded events under `events/<namespace>/<name>`.
#[derive(Clone)]
pub struct EventRegistry<C: Codec = VersioningCodec> {
    inner: Registry<Event, C>,
    source: String,
}

impl<C: Codec> EventRegistry<C> {
    /// An event registry with its own key locks and no source.
    pub fn new(store: Arc<dyn KvStore>, codec: C, events: EventSystem) -> Self {
        Self::from_registry(Registry::new(store, codec, events))
    }

    /// Wrap an existing generic registry, sharing its locks.
    pub fn from_registry(inner: Registry<Event, C>) -> Self {
        Self {
            inner,
            source: String::new(),
        }
    }

    /// Component name stamped on events made by [`record`](Self::record).
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn registry(&self) -> &Registry<Event, C> {
        &self.inner
    }

    /// Validate and store a fully formed event.
    pub async fn create_event(&self, event: Event) -> Result<Event> {
        validate_event(&event)?;
        self.inner.create_object(event).await
    }

    /// Record an event about `involved` with a generated name.
    pub async fn record<T: Resource>(
        &self,
        involved: &T,
        severity: EventSeverity,
        reason: &str,
        message: impl Into<String>,
    ) -> Result<Event> {
        let involved_object = ObjectReference::to(involved);
        let namespace = involved_object
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_EVENT_NAMESPACE.to_string());
        let name = format!("{}.{}", involved_object.name, Uuid::new_v4().simple());

        let event = Event {
            metadata: ObjectMeta::namespaced(namespace, name),
            involved_object,
            reason: reason.to_string(),
            message: message.into(),
            source: self.source.clone(),
            severity,
        };
        let event = self.create_event(event).await?;
        debug!(
            kind = %event.involved_object.kind,
            object = %event.involved_object.name,
            reason,
            "recorded event"
        );
        Ok(event)
    }

    /// The event `namespace/name`, or `NotFound`.
    pub async fn get_event(&self, namespace: &str, name: &str) -> Result<Event> {
        let key = object_key(Event::PREFIX, Some(namespace), name);
        self.inner
            .get(&key)
            .await?
            .ok_or(RegistryError::NotFound(key))
    }

    /// Delete the event if it is still at `expected_version`.
    pub async fn delete_event(
        &self,
        namespace: &str,
        name: &str,
        expected_version: u64,
    ) -> Result<Option<Event>> {
        let key = object_key(Event::PREFIX, Some(namespace), name);
        self.inner.delete(&key, expected_version).await
    }

    pub async fn list_events(&self) -> Result<Vec<Event>> {
        self.inner.list_all().await
    }

    /// Events whose involved object has this kind and name, oldest first.
    pub async fn list_events_for_object(&self, kind: &str, name: &str) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .inner
            .list(Event::PREFIX)
            .await?
            .filter(|e| e.involved_object.kind == kind && e.involved_object.name == name)
            .collect();
        events.sort_by_key(|e| e.metadata.creation_timestamp);
        Ok(events)
    }

    pub fn watch(&self) -> Result<WatchStream> {
        self.inner.watch(Event::PREFIX)
    }
}
