//! Node registry.
//!
//! Nodes are cluster-scoped and keyed `nodes/<name>`. Every write is
//! checked by [`validate_node`] before it reaches the store.

use std::sync::Arc;
use tracing::info;

use super::Registry;
use crate::api::{object_key, Node, NodePhase, Resource};
use crate::codec::{Codec, VersioningCodec};
use crate::error::{RegistryError, Result};
use crate::store::KvStore;
use crate::validation::validate_node;
use crate::watch::{EventSystem, WatchStream};

/// Cluster-scoped node objects under `nodes/<name>`.
#[derive(Clone)]
pub struct NodeRegistry<C: Codec = VersioningCodec> {
    inner: Registry<Node, C>,
}

impl<C: Codec> NodeRegistry<C> {
    /// A node registry with its own key locks.
    pub fn new(store: Arc<dyn KvStore>, codec: C, events: EventSystem) -> Self {
        Self::from_registry(Registry::new(store, codec, events))
    }

    /// Wrap an existing generic registry, sharing its locks.
    pub fn from_registry(inner: Registry<Node, C>) -> Self {
        Self { inner }
    }

    pub fn registry(&self) -> &Registry<Node, C> {
        &self.inner
    }

    /// Validate and create the node. Its stored version is 1.
    pub async fn create_node(&self, node: Node) -> Result<Node> {
        validate_node(&node)?;
        let node = self.inner.create_object(node).await?;
        info!(node = %node.metadata.name, instance_type = %node.spec.instance_type, "node created");
        Ok(node)
    }

    /// Replace the node, expecting its carried resource version.
    pub async fn update_node(&self, node: Node) -> Result<Node> {
        validate_node(&node)?;
        self.inner.update_object(node).await
    }

    /// Apply `mutate` to the current node, retrying on conflict.
    pub async fn update_node_with<F>(&self, name: &str, mut mutate: F) -> Result<Node>
    where
        F: FnMut(&mut Node) -> Result<()>,
    {
        self.inner
            .guaranteed_update(&node_key(name), |node| {
                mutate(node)?;
                validate_node(node)
            })
            .await
    }

    /// Delete the node if it is still at `expected_version`.
    ///
    /// Returns its final state, or `None` if the stored entry was unreadable.
    pub async fn delete_node(&self, name: &str, expected_version: u64) -> Result<Option<Node>> {
        let node = self.inner.delete(&node_key(name), expected_version).await?;
        info!(node = %name, "node deleted");
        Ok(node)
    }

    /// The node called `name`, or `NotFound`.
    pub async fn get_node(&self, name: &str) -> Result<Node> {
        let key = node_key(name);
        self.inner
            .get(&key)
            .await?
            .ok_or(RegistryError::NotFound(key))
    }

    /// Every node, by name.
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.inner.list_all().await
    }

    /// Nodes whose instance has reported at least one address.
    pub async fn list_nodes_with_addresses(&self) -> Result<Vec<Node>> {
        self.list_filtered(|n| !n.status.addresses.is_empty()).await
    }

    pub async fn list_nodes_by_phase(&self, phase: NodePhase) -> Result<Vec<Node>> {
        self.list_filtered(|n| n.status.phase == phase).await
    }

    /// The node backed by cloud instance `instance_id`, if any.
    pub async fn get_node_by_instance_id(&self, instance_id: &str) -> Result<Option<Node>> {
        Ok(self
            .inner
            .list(Node::PREFIX)
            .await?
            .find(|n| n.status.instance_id.as_deref() == Some(instance_id)))
    }

    pub fn watch(&self) -> Result<WatchStream> {
        self.inner.watch(Node::PREFIX)
    }

    async fn list_filtered(&self, keep: impl Fn(&Node) -> bool) -> Result<Vec<Node>> {
        Ok(self.inner.list(Node::PREFIX).await?.filter(|n| keep(n)).collect())
    }
}

fn node_key(name: &str) -> String {
    object_key(Node::PREFIX, None, name)
}
