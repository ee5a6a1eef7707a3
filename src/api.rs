//! Domain objects stored in the registry.
//!
//! Every kind carries an [`ObjectMeta`] and implements [`Resource`], which
//! ties the type to its kind name and key prefix.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Identity and bookkeeping shared by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Assigned by the registry on every write; callers treat it as opaque.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

/// A kind that can be stored in a registry.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name carried in encoded envelopes and change events.
    const KIND: &'static str;
    /// First key segment for every object of this kind.
    const PREFIX: &'static str;
    /// Whether keys include a namespace segment.
    const NAMESPACED: bool;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Key derived from the object's identity.
    fn key(&self) -> String {
        let meta = self.metadata();
        object_key(Self::PREFIX, meta.namespace.as_deref(), &meta.name)
    }
}

/// Build the key for `name` (and `namespace`, for namespaced kinds).
pub fn object_key(prefix: &str, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}/{}", prefix, ns, name),
        None => format!("{}/{}", prefix, name),
    }
}

/// Points at another object, e.g. the subject of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectReference {
    pub fn to<T: Resource>(obj: &T) -> Self {
        let meta = obj.metadata();
        Self {
            kind: T::KIND.to_string(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    PublicIP,
    PrivateIP,
    PublicDNS,
    PrivateDNS,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAddress {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub address: String,
}

impl NetworkAddress {
    pub fn private_ip(address: impl Into<String>) -> Self {
        Self {
            address_type: AddressType::PrivateIP,
            address: address.into(),
        }
    }
}

// Nodes

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    Creating,
    Created,
    Available,
    Claimed,
    Cleaning,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub instance_type: String,
    pub boot_image: String,
    #[serde(default)]
    pub spot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_pod_name: Option<String>,
}

/// A cloud instance that can host one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn new(name: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::cluster(name),
            spec: NodeSpec {
                instance_type: instance_type.into(),
                boot_image: String::new(),
                spot: false,
            },
            status: NodeStatus::default(),
        }
    }
}

impl Resource for Node {
    const KIND: &'static str = "Node";
    const PREFIX: &'static str = "nodes";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// Pods

/// Pod lifecycle as driven by the reconciler.
///
/// `Pending -> Dispatching -> Running -> Succeeded | Failed`, with
/// `Terminating` reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Dispatching,
    Running,
    Succeeded,
    Failed,
    Terminating,
}

impl PodPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub spot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_instance_id: Option<String>,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// A single-container pod.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, image: &str) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: image.to_string(),
                    command: Vec::new(),
                }],
                ..Default::default()
            },
            status: PodStatus::default(),
        }
    }
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";
    const PREFIX: &'static str = "pods";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// Events

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    #[default]
    Normal,
    Warning,
}

/// A recorded occurrence concerning another object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub metadata: ObjectMeta,
    pub involved_object: ObjectReference,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub severity: EventSeverity,
}

impl Resource for Event {
    const KIND: &'static str = "Event";
    const PREFIX: &'static str = "events";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// Logs

/// Captured output of one container, uploaded by the node agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub metadata: ObjectMeta,
    pub parent_object: ObjectReference,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub content: String,
}

impl Resource for Log {
    const KIND: &'static str = "Log";
    const PREFIX: &'static str = "logs";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
