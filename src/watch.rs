//! Change notification: the event system and watch streams.
//!
//! Every committed registry write is published as a [`ChangeEvent`]. Each
//! listener owns a bounded queue; publishing never waits on a listener. When
//! a queue is full the oldest event is dropped, and the next item the
//! listener receives is [`Notification::ResyncRequired`] so it can re-list.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::Resource;
use crate::codec::Codec;
use crate::error::{RegistryError, Result};

/// Type of change that occurred to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Key was created (did not exist before).
    Added,
    /// Key was updated.
    Modified,
    /// Key was deleted.
    Deleted,
}

/// A committed change to one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: String,
    pub key: String,
    pub namespace: Option<String>,
    pub name: String,
    pub event_type: EventType,
    pub resource_version: u64,
    /// Encoded object as of this change. For `Deleted` it is the final
    /// state, stamped with the version of the delete. `None` when the
    /// deleted entry could not be decoded.
    pub object: Option<Arc<Vec<u8>>>,
}

impl ChangeEvent {
    pub fn new<T: Resource>(
        key: impl Into<String>,
        event_type: EventType,
        obj: &T,
        object: Vec<u8>,
    ) -> Self {
        let meta = obj.metadata();
        Self {
            kind: T::KIND.to_string(),
            key: key.into(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            event_type,
            resource_version: meta.resource_version,
            object: Some(Arc::new(object)),
        }
    }

    /// An event for `key` with no object snapshot. Name and namespace are
    /// taken from the key segments.
    pub fn without_snapshot<T: Resource>(
        key: impl Into<String>,
        event_type: EventType,
        resource_version: u64,
    ) -> Self {
        let key = key.into();
        let mut segments = key.split('/').skip(1);
        let namespace = if T::NAMESPACED {
            segments.next().map(str::to_string)
        } else {
            None
        };
        let name = segments.last().unwrap_or_default().to_string();
        Self {
            kind: T::KIND.to_string(),
            key,
            namespace,
            name,
            event_type,
            resource_version,
            object: None,
        }
    }

    /// Decode the object snapshot.
    pub fn decode<T: Resource, C: Codec>(&self, codec: &C) -> Result<T> {
        match &self.object {
            Some(bytes) => codec.decode(bytes),
            None => Err(RegistryError::Encoding(format!(
                "{} event for {} carries no snapshot",
                T::KIND,
                self.key
            ))),
        }
    }
}

/// An item delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Event(ChangeEvent),
    /// Events were dropped because the listener fell behind; its view is
    /// stale until it lists again.
    ResyncRequired { missed: u64 },
}

impl Notification {
    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            Notification::Event(event) => Some(event),
            Notification::ResyncRequired { .. } => None,
        }
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<ChangeEvent>,
    missed: u64,
    closed: bool,
}

struct ListenerQueue {
    prefix: String,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    overflow: AtomicU64,
}

impl ListenerQueue {
    fn push(&self, event: ChangeEvent) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.events.len() >= self.capacity {
            state.events.pop_front();
            if state.missed == 0 {
                warn!(prefix = %self.prefix, "listener queue full, dropping oldest events");
            }
            state.missed += 1;
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        state.events.push_back(event);
        drop(state);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Notification> {
        let mut state = self.state.lock();
        if state.missed > 0 {
            let missed = std::mem::take(&mut state.missed);
            return Some(Notification::ResyncRequired { missed });
        }
        state.events.pop_front().map(Notification::Event)
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stop accepting events; queued ones stay available to drain.
    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Stop accepting events and release everything queued.
    fn release(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.events.clear();
        state.missed = 0;
        drop(state);
        self.notify.notify_one();
    }
}

/// A listener table entry. The queue leaves the table once `owner` is
/// cancelled.
struct Registration {
    queue: Arc<ListenerQueue>,
    owner: CancellationToken,
}

struct Inner {
    listeners: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    published: AtomicU64,
    capacity: usize,
    shutdown: CancellationToken,
    /// Cancelled when the last handle drops; stops the shutdown watcher.
    dropped: CancellationToken,
}

impl Inner {
    /// Empty the table and close every queue, leaving queued events to
    /// drain. Returns how many listeners were closed.
    fn close_listeners(&self) -> usize {
        let drained: Vec<_> = self.listeners.lock().drain().collect();
        for (_, registration) in &drained {
            registration.queue.close();
        }
        drained.len()
    }

    /// Unregister listeners whose owner has been cancelled.
    fn prune_cancelled(&self) {
        let released: Vec<Registration> = {
            let mut listeners = self.listeners.lock();
            let cancelled: Vec<u64> = listeners
                .iter()
                .filter(|(_, r)| r.owner.is_cancelled())
                .map(|(id, _)| *id)
                .collect();
            cancelled
                .into_iter()
                .filter_map(|id| listeners.remove(&id))
                .collect()
        };
        for registration in released {
            registration.queue.release();
            debug!(prefix = %registration.queue.prefix, "listener owner cancelled");
        }
    }

    /// Bring the table in line with the shutdown token and owner tokens.
    fn sync_lifecycle(&self) {
        if self.shutdown.is_cancelled() {
            self.close_listeners();
        } else {
            self.prune_cancelled();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dropped.cancel();
    }
}

/// In-process publish/subscribe bus for registry changes.
///
/// Cheap to clone; all clones share one listener table.
#[derive(Clone)]
pub struct EventSystem {
    inner: Arc<Inner>,
}

impl EventSystem {
    /// Create an event system that stops when `shutdown` is cancelled.
    ///
    /// Inside a tokio runtime a watcher task closes the listener table as
    /// soon as the token fires. Every publish, subscribe and count also
    /// checks the token, so the table closes without a runtime too.
    pub fn new(capacity: usize, shutdown: CancellationToken) -> Self {
        let inner = Arc::new(Inner {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            capacity: capacity.max(1),
            shutdown: shutdown.clone(),
            dropped: CancellationToken::new(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            let dropped = inner.dropped.clone();
            handle.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Some(inner) = weak.upgrade() {
                            let closed = inner.close_listeners();
                            info!(listeners = closed, "event system shut down by token");
                        }
                    }
                    _ = dropped.cancelled() => {}
                }
            });
        }

        Self { inner }
    }

    /// Deliver `event` to every listener whose prefix matches its key.
    ///
    /// Never blocks. A no-op once the system is shut down.
    pub fn publish(&self, event: ChangeEvent) {
        self.inner.sync_lifecycle();
        if self.is_shut_down() {
            return;
        }
        let targets: Vec<Arc<ListenerQueue>> = self
            .inner
            .listeners
            .lock()
            .values()
            .filter(|r| event.key.starts_with(&r.queue.prefix))
            .map(|r| Arc::clone(&r.queue))
            .collect();

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        for queue in targets {
            queue.push(event.clone());
        }
    }

    /// Register a listener for keys starting with `prefix`.
    pub fn subscribe(&self, prefix: impl Into<String>) -> Listener {
        self.subscribe_until(prefix, self.inner.shutdown.child_token())
    }

    /// Register a listener that unregisters itself when `owner` is cancelled.
    ///
    /// Cancellation takes effect whether or not the listener is being
    /// polled: the next publish drops it from the table.
    pub fn subscribe_until(&self, prefix: impl Into<String>, owner: CancellationToken) -> Listener {
        self.inner.sync_lifecycle();
        let prefix = prefix.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ListenerQueue {
            prefix: prefix.clone(),
            capacity: self.inner.capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            overflow: AtomicU64::new(0),
        });

        if self.is_shut_down() || owner.is_cancelled() {
            queue.close();
        } else {
            self.inner.listeners.lock().insert(
                id,
                Registration {
                    queue: Arc::clone(&queue),
                    owner: owner.clone(),
                },
            );
        }
        debug!(id, prefix = %prefix, "listener subscribed");

        Listener {
            id,
            queue,
            system: self.clone(),
            owner,
        }
    }

    /// Remove a listener and release its queue. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let removed = self.inner.listeners.lock().remove(&id);
        if let Some(registration) = removed {
            registration.queue.release();
            debug!(id, "listener unsubscribed");
        }
    }

    /// Register a listener and wrap it as a stream.
    pub fn watch(&self, prefix: impl Into<String>) -> WatchStream {
        WatchStream::new(self.subscribe(prefix))
    }

    /// Close every listener queue and turn further publishes into no-ops.
    ///
    /// Listeners may still drain what was queued before shutdown.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let closed = self.inner.close_listeners();
        info!(listeners = closed, "event system shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Listeners still registered. Cancelled owners are pruned first.
    pub fn listener_count(&self) -> usize {
        self.inner.sync_lifecycle();
        self.inner.listeners.lock().len()
    }

    /// Total events published since construction.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

/// A registered subscription. Dropping it unsubscribes.
pub struct Listener {
    id: u64,
    queue: Arc<ListenerQueue>,
    system: EventSystem,
    owner: CancellationToken,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.queue.prefix
    }

    /// Events dropped from this listener's queue so far.
    pub fn overflow_count(&self) -> u64 {
        self.queue.overflow.load(Ordering::Relaxed)
    }

    /// Take the next queued item without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.queue.pop()
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the listener is unsubscribed, its owner is
    /// cancelled, or the system has shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.queue.is_closed() {
                return None;
            }
            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = self.owner.cancelled() => {
                    self.system.unsubscribe(self.id);
                    return None;
                }
                _ = self.system.inner.shutdown.cancelled() => {
                    self.queue.close();
                }
            }
        }
    }

    /// Unregister now; later `recv` calls return `None`.
    pub fn cancel(&self) {
        self.system.unsubscribe(self.id);
        self.queue.release();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.system.unsubscribe(self.id);
    }
}

/// A cancellable stream of notifications for one key prefix.
pub struct WatchStream {
    id: u64,
    system: EventSystem,
    inner: BoxStream<'static, Notification>,
}

impl WatchStream {
    pub fn new(listener: Listener) -> Self {
        let id = listener.id;
        let system = listener.system.clone();
        let inner = stream::unfold(listener, |mut listener| async move {
            listener.recv().await.map(|item| (item, listener))
        })
        .boxed();
        Self { id, system, inner }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unregister the listener; the stream ends after this call.
    pub fn cancel(&self) {
        self.system.unsubscribe(self.id);
    }

    /// Only the change events, skipping resync markers.
    pub fn events(self) -> impl Stream<Item = ChangeEvent> {
        self.filter_map(|item| async move { item.into_event() })
    }
}

impl Stream for WatchStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Node;
    use crate::codec::VersioningCodec;
    use std::time::Duration;

    fn node_event(name: &str, event_type: EventType, version: u64) -> ChangeEvent {
        let mut node = Node::new(name, "t3.small");
        node.metadata.resource_version = version;
        let bytes = crate::codec::Codec::encode(&VersioningCodec, &node).unwrap();
        ChangeEvent::new(format!("nodes/{}", name), event_type, &node, bytes)
    }

    fn system(capacity: usize) -> EventSystem {
        EventSystem::new(capacity, CancellationToken::new())
    }

    #[test]
    fn test_event_type_serialize() {
        let json = serde_json::to_string(&EventType::Added).unwrap();
        assert_eq!(json, "\"Added\"");
    }

    #[tokio::test]
    async fn test_prefix_filtering() {
        let events = system(16);
        let mut nodes = events.subscribe("nodes/");

        events.publish(node_event("n1", EventType::Added, 1));
        let mut pod = node_event("p1", EventType::Added, 1);
        pod.key = "pods/default/p1".to_string();
        events.publish(pod);

        let got = nodes.recv().await.unwrap().into_event().unwrap();
        assert_eq!(got.key, "nodes/n1");
        assert!(nodes.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_per_key_order() {
        let events = system(16);
        let mut listener = events.subscribe("nodes/");

        events.publish(node_event("n1", EventType::Added, 1));
        events.publish(node_event("n1", EventType::Modified, 2));
        events.publish(node_event("n1", EventType::Deleted, 3));

        let mut versions = vec![];
        while let Some(item) = listener.try_recv() {
            versions.push(item.into_event().unwrap().resource_version);
        }
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_signals_resync() {
        let events = system(2);
        let mut listener = events.subscribe("nodes/");

        for v in 1..=5 {
            events.publish(node_event("n1", EventType::Modified, v));
        }

        assert_eq!(listener.overflow_count(), 3);
        assert_eq!(
            listener.recv().await,
            Some(Notification::ResyncRequired { missed: 3 })
        );
        let remaining: Vec<u64> = std::iter::from_fn(|| listener.try_recv())
            .map(|n| n.into_event().unwrap().resource_version)
            .collect();
        assert_eq!(remaining, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_publish() {
        let events = system(1);
        let _stalled = events.subscribe("nodes/");
        let mut fast = events.subscribe("nodes/");

        for v in 1..=1000 {
            events.publish(node_event("n1", EventType::Modified, v));
            fast.try_recv();
        }
        assert_eq!(events.published_count(), 1000);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let events = system(4);
        let listener = events.subscribe("nodes/");
        let id = listener.id();

        events.unsubscribe(id);
        events.unsubscribe(id);
        assert_eq!(events.listener_count(), 0);
        drop(listener);
        assert_eq!(events.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let events = system(4);
        {
            let _listener = events.subscribe("nodes/");
            assert_eq!(events.listener_count(), 1);
        }
        assert_eq!(events.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_owner_cancellation_ends_listener() {
        let events = system(4);
        let owner = CancellationToken::new();
        let mut listener = events.subscribe_until("nodes/", owner.clone());

        let handle = tokio::spawn(async move { listener.recv().await });
        tokio::task::yield_now().await;
        owner.cancel();

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert_eq!(events.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_ends() {
        let events = system(4);
        let mut listener = events.subscribe("nodes/");

        events.publish(node_event("n1", EventType::Added, 1));
        events.shutdown();
        events.publish(node_event("n2", EventType::Added, 1));

        let first = listener.recv().await.unwrap().into_event().unwrap();
        assert_eq!(first.key, "nodes/n1");
        assert!(listener.recv().await.is_none());
        assert!(events.is_shut_down());
    }

    #[tokio::test]
    async fn test_external_token_shuts_down() {
        let token = CancellationToken::new();
        let events = EventSystem::new(4, token.clone());
        let mut listener = events.subscribe("nodes/");

        token.cancel();
        let got = tokio::time::timeout(Duration::from_secs(1), listener.recv())
            .await
            .unwrap();
        assert!(got.is_none());
        events.publish(node_event("n1", EventType::Added, 1));
        assert_eq!(events.published_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_owner_unregisters_without_recv() {
        let events = system(4);
        let owner = CancellationToken::new();
        let mut listener = events.subscribe_until("nodes/", owner.clone());
        events.publish(node_event("n1", EventType::Added, 1));

        owner.cancel();
        events.publish(node_event("n2", EventType::Added, 1));

        assert_eq!(events.listener_count(), 0);
        assert!(listener.try_recv().is_none());
        assert!(listener.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_with_cancelled_owner() {
        let events = system(4);
        let owner = CancellationToken::new();
        owner.cancel();
        let mut listener = events.subscribe_until("nodes/", owner);

        events.publish(node_event("n1", EventType::Added, 1));
        assert_eq!(events.listener_count(), 0);
        assert!(listener.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_external_token_closes_listener_table() {
        let token = CancellationToken::new();
        let events = EventSystem::new(4, token.clone());
        let mut listener = events.subscribe("nodes/");
        events.publish(node_event("n1", EventType::Added, 1));

        token.cancel();
        assert_eq!(events.listener_count(), 0);
        // Queued events still drain after the table closes.
        let first = listener.try_recv().unwrap().into_event().unwrap();
        assert_eq!(first.key, "nodes/n1");
        assert!(listener.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_watcher_closes_table_unprompted() {
        let token = CancellationToken::new();
        let events = EventSystem::new(4, token.clone());
        let listener = events.subscribe("nodes/");

        token.cancel();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(events.inner.listeners.lock().len(), 0);
        assert!(listener.queue.is_closed());
    }

    #[test]
    fn test_new_outside_runtime() {
        let token = CancellationToken::new();
        let events = EventSystem::new(4, token.clone());
        let _listener = events.subscribe("nodes/");
        token.cancel();
        assert_eq!(events.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_stream_cancel() {
        let events = system(4);
        let mut stream = events.watch("nodes/");

        events.publish(node_event("n1", EventType::Added, 1));
        let item = stream.next().await.unwrap();
        assert!(matches!(item, Notification::Event(_)));

        stream.cancel();
        assert_eq!(events.listener_count(), 0);
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_decode_snapshot() {
        let event = node_event("n1", EventType::Added, 1);
        let node: Node = event.decode(&VersioningCodec).unwrap();
        assert_eq!(node.metadata.name, "n1");
        assert_eq!(node.metadata.resource_version, 1);
    }

    #[test]
    fn test_event_without_snapshot() {
        let event = ChangeEvent::without_snapshot::<crate::api::Pod>(
            "pods/default/web",
            EventType::Deleted,
            2,
        );
        assert_eq!(event.namespace.as_deref(), Some("default"));
        assert_eq!(event.name, "web");
        assert_eq!(event.kind, "Pod");
        assert!(event.object.is_none());
        assert!(matches!(
            event.decode::<crate::api::Pod, _>(&VersioningCodec),
            Err(RegistryError::Encoding(_))
        ));

        let node = ChangeEvent::without_snapshot::<Node>("nodes/n1", EventType::Deleted, 2);
        assert_eq!(node.namespace, None);
        assert_eq!(node.name, "n1");
    }
}
