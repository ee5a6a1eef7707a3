//! Shared wiring for every registry in a process.
//!
//! A [`RegistryContext`] owns the store, the event system and the shutdown
//! token. Registries built from one context share all three, plus the
//! per-key write locks.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::Resource;
use crate::cloud::CloudClient;
use crate::codec::VersioningCodec;
use crate::config::{RegistryConfig, StoreBackend};
use crate::error::Result;
use crate::keylock::KeyLocks;
use crate::memory::MemoryStore;
use crate::registry::{EventRegistry, LogRegistry, NodeRegistry, PodRegistry, PodValidator, Registry};
use crate::sqlite::SqliteStore;
use crate::store::KvStore;
use crate::validation::StatefulValidator;
use crate::watch::EventSystem;

/// One handle per resource kind, all over the same context.
#[derive(Clone)]
pub struct Registries {
    pub nodes: NodeRegistry,
    pub pods: PodRegistry,
    pub events: EventRegistry,
    pub logs: LogRegistry,
}

/// Store, event system, key locks and shutdown token for one process.
#[derive(Clone)]
pub struct RegistryContext {
    store: Arc<dyn KvStore>,
    events: EventSystem,
    locks: KeyLocks,
    shutdown: CancellationToken,
    config: RegistryConfig,
}

impl RegistryContext {
    /// A context over `store`. The event system stops when the context's
    /// shutdown token is cancelled.
    pub fn new(store: Arc<dyn KvStore>, config: RegistryConfig) -> Self {
        let shutdown = CancellationToken::new();
        let events = EventSystem::new(config.events.queue_capacity, shutdown.clone());
        Self {
            store,
            events,
            locks: KeyLocks::new(),
            shutdown,
            config,
        }
    }

    /// Open the configured store backend and build a context over it.
    pub async fn from_config(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn KvStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => {
                Arc::new(SqliteStore::open_with(&config.store.path, &config.store).await?)
            }
        };
        info!(backend = ?config.store.backend, "registry store opened");
        Ok(Self::new(store, config))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    pub fn events(&self) -> &EventSystem {
        &self.events
    }

    /// Token cancelled when the context shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A generic registry for `T` over this context.
    pub fn registry<T: Resource>(&self) -> Registry<T> {
        Registry::new(self.store(), VersioningCodec, self.events.clone())
            .with_max_update_retries(self.config.registry.max_update_retries)
            .with_locks(self.locks.clone())
    }

    pub fn node_registry(&self) -> NodeRegistry {
        NodeRegistry::from_registry(self.registry())
    }

    pub fn pod_registry(&self, validator: Arc<dyn PodValidator>) -> PodRegistry {
        PodRegistry::from_registry(self.registry(), validator)
    }

    pub fn event_registry(&self) -> EventRegistry {
        EventRegistry::from_registry(self.registry())
    }

    pub fn log_registry(&self) -> LogRegistry {
        LogRegistry::from_registry(self.registry())
    }

    /// Pod validation backed by `cloud`, configured from this context.
    pub async fn stateful_validator(&self, cloud: Arc<dyn CloudClient>) -> Result<StatefulValidator> {
        StatefulValidator::connect(cloud, &self.config.validation).await
    }

    /// Every per-kind registry, sharing this context.
    pub fn registries(&self, validator: Arc<dyn PodValidator>) -> Registries {
        Registries {
            nodes: self.node_registry(),
            pods: self.pod_registry(validator),
            events: self.event_registry(),
            logs: self.log_registry(),
        }
    }

    /// Stop accepting writes and end every watch. Reads keep working.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("registry context shutting down");
        }
        self.events.shutdown();
    }
}
