//! Object encoding for stored values.
//!
//! [`VersioningCodec`] wraps each object in a JSON envelope tagged with its
//! kind and resource version:
//!
//! ```text
//! {"kind":"Pod","apiVersion":"v1","resourceVersion":3,"object":{...}}
//! ```
//!
//! The layout is internal to the registry and not a stable wire format.

use serde::{Deserialize, Serialize};

use crate::api::{ObjectMeta, Resource};
use crate::error::{RegistryError, Result};

pub const API_VERSION: &str = "v1";

/// Converts objects to and from stored bytes.
///
/// Implementations check structure only; business rules live in the
/// resource registries.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Resource>(&self, obj: &T) -> Result<Vec<u8>>;
    fn decode<T: Resource>(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a, T> {
    kind: &'a str,
    api_version: &'a str,
    resource_version: u64,
    object: &'a T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    kind: String,
    api_version: String,
    resource_version: u64,
    object: T,
}

/// JSON codec that embeds the resource version in every envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersioningCodec;

impl Codec for VersioningCodec {
    fn encode<T: Resource>(&self, obj: &T) -> Result<Vec<u8>> {
        check_identity::<T>(obj.metadata())?;
        let envelope = EnvelopeRef {
            kind: T::KIND,
            api_version: API_VERSION,
            resource_version: obj.metadata().resource_version,
            object: obj,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn decode<T: Resource>(&self, bytes: &[u8]) -> Result<T> {
        let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
        if envelope.kind != T::KIND {
            return Err(RegistryError::Encoding(format!(
                "expected kind {}, found {}",
                T::KIND,
                envelope.kind
            )));
        }
        if envelope.api_version != API_VERSION {
            return Err(RegistryError::Encoding(format!(
                "unsupported apiVersion {}",
                envelope.api_version
            )));
        }
        let meta = envelope.object.metadata();
        if meta.resource_version != envelope.resource_version {
            return Err(RegistryError::Encoding(format!(
                "envelope version {} disagrees with object version {}",
                envelope.resource_version, meta.resource_version
            )));
        }
        check_identity::<T>(meta)?;
        Ok(envelope.object)
    }
}

/// Structural identity rules: a name always, a namespace exactly when the
/// kind is namespaced.
pub fn check_identity<T: Resource>(meta: &ObjectMeta) -> Result<()> {
    if meta.name.is_empty() {
        return Err(RegistryError::Encoding(format!(
            "{} is missing a name",
            T::KIND
        )));
    }
    match (&meta.namespace, T::NAMESPACED) {
        (Some(ns), true) if !ns.is_empty() => Ok(()),
        (None, false) => Ok(()),
        (_, true) => Err(RegistryError::Encoding(format!(
            "{} {} is missing a namespace",
            T::KIND,
            meta.name
        ))),
        (Some(_), false) => Err(RegistryError::Encoding(format!(
            "{} {} is cluster-scoped but has a namespace",
            T::KIND,
            meta.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Node, Pod};

    #[test]
    fn test_round_trip_keeps_version() {
        let codec = VersioningCodec;
        let mut pod = Pod::new("default", "p1", "nginx");
        pod.metadata.resource_version = 7;
        pod.metadata.uid = Some("abc".to_string());

        let bytes = codec.encode(&pod).unwrap();
        let decoded: Pod = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, pod);
        assert_eq!(decoded.metadata.resource_version, 7);
    }

    #[test]
    fn test_envelope_layout() {
        let mut node = Node::new("n1", "t3.small");
        node.metadata.resource_version = 2;
        let bytes = VersioningCodec.encode(&node).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["kind"], "Node");
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["resourceVersion"], 2);
        assert_eq!(value["object"]["metadata"]["name"], "n1");
    }

    #[test]
    fn test_encode_requires_name() {
        let pod = Pod::new("default", "", "nginx");
        let err = VersioningCodec.encode(&pod).unwrap_err();
        assert!(matches!(err, RegistryError::Encoding(_)));
    }

    #[test]
    fn test_encode_requires_namespace_for_pods() {
        let mut pod = Pod::new("default", "p1", "nginx");
        pod.metadata.namespace = None;
        assert!(VersioningCodec.encode(&pod).is_err());
    }

    #[test]
    fn test_encode_rejects_namespaced_node() {
        let mut node = Node::new("n1", "t3.small");
        node.metadata.namespace = Some("default".to_string());
        assert!(VersioningCodec.encode(&node).is_err());
    }

    #[test]
    fn test_decode_wrong_kind() {
        let bytes = VersioningCodec.encode(&Node::new("n1", "t3.small")).unwrap();
        let err = VersioningCodec.decode::<Pod>(&bytes).unwrap_err();
        assert!(matches!(err, RegistryError::Encoding(_)));
    }

    #[test]
    fn test_decode_version_mismatch() {
        let bytes = br#"{"kind":"Node","apiVersion":"v1","resourceVersion":3,
            "object":{"metadata":{"name":"n1","resourceVersion":2},
            "spec":{"instanceType":"t3.small","bootImage":""}}}"#;
        let err = VersioningCodec.decode::<Node>(bytes).unwrap_err();
        assert!(err.to_string().contains("disagrees"));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            VersioningCodec.decode::<Node>(b"not json"),
            Err(RegistryError::Encoding(_))
        ));
    }
}
