//! # instance-registry
//!
//! Versioned object registry and change notification for a cloud-instance
//! node provider.
//!
//! Nodes, pods, events and logs are stored as encoded objects in a
//! key-value store, with:
//!
//! - **Hierarchical keys**: `<kind>/<name>` or `<kind>/<namespace>/<name>`
//! - **Optimistic concurrency**: every write names the version it expects
//! - **Change events**: each committed write is published once to every
//!   matching watcher, in per-key commit order
//!
//! ## Backends
//!
//! - [`SqliteStore`]: Embedded SQLite database (production)
//! - [`MemoryStore`]: In-memory store (testing and development)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use instance_registry::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> instance_registry::Result<()> {
//!     instance_registry::logging::init();
//!     let ctx = RegistryContext::from_config(RegistryConfig::load(None)?).await?;
//!     let nodes = ctx.node_registry();
//!
//!     let mut node = Node::new("node-1", "t3.small");
//!     node.spec.boot_image = "ami-0abc".to_string();
//!     let node = nodes.create_node(node).await?;
//!     println!("created at version {}", node.metadata.resource_version);
//!
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Watching
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use instance_registry::prelude::*;
//!
//! # async fn run(ctx: RegistryContext) -> instance_registry::Result<()> {
//! let mut changes = ctx.node_registry().watch()?;
//! while let Some(notification) = changes.next().await {
//!     match notification {
//!         Notification::Event(event) => println!("{:?} {}", event.event_type, event.key),
//!         Notification::ResyncRequired { missed } => println!("missed {missed}, relisting"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod api;
pub mod cloud;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod keylock;
pub mod logging;
pub mod logs;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod validation;
pub mod watch;

// Re-export main types
pub use api::{Event, Log, Node, ObjectMeta, Pod, Resource};
pub use codec::{Codec, VersioningCodec};
pub use config::RegistryConfig;
pub use context::{Registries, RegistryContext};
pub use error::{RegistryError, Result};
pub use memory::MemoryStore;
pub use registry::{EventRegistry, LogRegistry, NodeRegistry, PodRegistry, PodValidator, Registry};
pub use sqlite::SqliteStore;
pub use store::{Entry, KvStore, MAX_KEY_LENGTH};
pub use watch::{ChangeEvent, EventSystem, EventType, Notification, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::api::{Event, Log, Node, NodePhase, ObjectMeta, Pod, PodPhase, Resource};
    pub use crate::config::RegistryConfig;
    pub use crate::context::{Registries, RegistryContext};
    pub use crate::error::{RegistryError, Result};
    pub use crate::memory::MemoryStore;
    pub use crate::registry::{EventRegistry, LogRegistry, NodeRegistry, PodRegistry, PodValidator};
    pub use crate::sqlite::SqliteStore;
    pub use crate::store::KvStore;
    pub use crate::watch::{ChangeEvent, EventType, Notification, WatchStream};
}
