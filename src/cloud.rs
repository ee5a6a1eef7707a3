//! Cloud provider capability.
//!
//! Vendor adapters live outside this crate and implement [`CloudClient`].
//! [`InMemoryCloud`] is the in-process variant used for tests and local runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::api::{NetworkAddress, Node};
use crate::error::{RegistryError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetAttributes {
    pub id: String,
    pub name: String,
    pub cidr: String,
    pub availability_zone: String,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartNodeResult {
    pub instance_id: String,
    pub availability_zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInstance {
    pub id: String,
    pub node_name: String,
    pub spot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

/// Operations the provider needs from a cloud vendor. All are network-bound
/// and fallible.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn start_node(&self, node: &Node, metadata: &str) -> Result<StartNodeResult>;

    async fn start_spot_node(&self, node: &Node, metadata: &str) -> Result<StartNodeResult>;

    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<CloudInstance>>;

    /// Block until the node's instance is running and return its addresses.
    async fn wait_for_running(&self, node: &Node) -> Result<Vec<NetworkAddress>>;

    /// Open `ports` to `source_ranges` on the provider's security groups.
    async fn ensure_security_groups(&self, ports: &[u16], source_ranges: &[String]) -> Result<()>;

    /// Credentials for pulling `image` from the vendor's container registry.
    async fn get_registry_auth(&self, image: &str) -> Result<RegistryAuth>;

    /// Subnets available for placing instances.
    async fn subnets(&self) -> Result<Vec<SubnetAttributes>>;
}

#[derive(Default)]
struct CloudState {
    instances: BTreeMap<String, CloudInstance>,
    open_ports: HashSet<u16>,
    failing: HashSet<String>,
}

/// In-process cloud: instances are map entries and start instantly.
#[derive(Clone, Default)]
pub struct InMemoryCloud {
    state: Arc<Mutex<CloudState>>,
    subnets: Arc<Vec<SubnetAttributes>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subnets(subnets: Vec<SubnetAttributes>) -> Self {
        Self {
            subnets: Arc::new(subnets),
            ..Self::default()
        }
    }

    /// Make every later start of `node_name` fail.
    pub fn fail_starts_for(&self, node_name: impl Into<String>) {
        self.state.lock().failing.insert(node_name.into());
    }

    pub fn is_port_open(&self, port: u16) -> bool {
        self.state.lock().open_ports.contains(&port)
    }

    fn launch(&self, node: &Node, spot: bool) -> Result<StartNodeResult> {
        let mut state = self.state.lock();
        if state.failing.contains(&node.metadata.name) {
            return Err(RegistryError::Cloud(format!(
                "insufficient capacity for {}",
                node.metadata.name
            )));
        }
        let id = format!("i-{:08x}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        state.instances.insert(
            id.clone(),
            CloudInstance {
                id: id.clone(),
                node_name: node.metadata.name.clone(),
                spot,
            },
        );
        let availability_zone = self
            .subnets
            .first()
            .map(|s| s.availability_zone.clone())
            .unwrap_or_default();
        Ok(StartNodeResult {
            instance_id: id,
            availability_zone,
        })
    }
}

#[async_trait]
impl CloudClient for InMemoryCloud {
    async fn start_node(&self, node: &Node, _metadata: &str) -> Result<StartNodeResult> {
        self.launch(node, false)
    }

    async fn start_spot_node(&self, node: &Node, _metadata: &str) -> Result<StartNodeResult> {
        self.launch(node, true)
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        match self.state.lock().instances.remove(instance_id) {
            Some(_) => Ok(()),
            None => Err(RegistryError::Cloud(format!(
                "instance {} does not exist",
                instance_id
            ))),
        }
    }

    async fn list_instances(&self) -> Result<Vec<CloudInstance>> {
        Ok(self.state.lock().instances.values().cloned().collect())
    }

    async fn wait_for_running(&self, node: &Node) -> Result<Vec<NetworkAddress>> {
        let instance_id = node.status.instance_id.as_deref().ok_or_else(|| {
            RegistryError::Cloud(format!("node {} has no instance", node.metadata.name))
        })?;
        let state = self.state.lock();
        let index = state
            .instances
            .keys()
            .position(|id| id == instance_id)
            .ok_or_else(|| RegistryError::Cloud(format!("instance {} is gone", instance_id)))?;
        Ok(vec![NetworkAddress::private_ip(format!(
            "10.0.{}.{}",
            index / 250,
            index % 250 + 4
        ))])
    }

    async fn ensure_security_groups(&self, ports: &[u16], _source_ranges: &[String]) -> Result<()> {
        self.state.lock().open_ports.extend(ports.iter().copied());
        Ok(())
    }

    async fn get_registry_auth(&self, image: &str) -> Result<RegistryAuth> {
        let server = image.split('/').next().unwrap_or_default().to_string();
        Ok(RegistryAuth {
            server,
            username: "AWS".to_string(),
            password: String::new(),
        })
    }

    async fn subnets(&self) -> Result<Vec<SubnetAttributes>> {
        Ok(self.subnets.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_stop() {
        let cloud = InMemoryCloud::new();
        let mut node = Node::new("n1", "t3.small");

        let started = cloud.start_node(&node, "").await.unwrap();
        node.status.instance_id = Some(started.instance_id.clone());

        let addresses = cloud.wait_for_running(&node).await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(cloud.list_instances().await.unwrap().len(), 1);

        cloud.stop_instance(&started.instance_id).await.unwrap();
        assert!(cloud.list_instances().await.unwrap().is_empty());
        assert!(cloud.stop_instance(&started.instance_id).await.is_err());
    }

    #[tokio::test]
    async fn test_spot_and_failures() {
        let cloud = InMemoryCloud::new();
        cloud.fail_starts_for("bad");

        cloud
            .start_spot_node(&Node::new("good", "t3.small"), "")
            .await
            .unwrap();
        let err = cloud
            .start_node(&Node::new("bad", "t3.small"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Cloud(_)));

        let instances = cloud.list_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert!(instances[0].spot);
    }

    #[tokio::test]
    async fn test_security_groups_and_auth() {
        let cloud = InMemoryCloud::new();
        cloud
            .ensure_security_groups(&[6421], &["0.0.0.0/0".to_string()])
            .await
            .unwrap();
        assert!(cloud.is_port_open(6421));

        let auth = cloud
            .get_registry_auth("123.dkr.ecr.us-east-1.amazonaws.com/app:1")
            .await
            .unwrap();
        assert_eq!(auth.server, "123.dkr.ecr.us-east-1.amazonaws.com");
    }
}
