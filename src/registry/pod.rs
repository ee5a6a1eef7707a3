//! Pod registry with admission checks.
//!
//! Pods are keyed `pods/<namespace>/<name>`. A [`PodValidator`] fills
//! defaults on create and vets every write.

use std::sync::Arc;
use tracing::{debug, info};

use super::Registry;
use crate::api::{object_key, Pod, PodPhase, Resource};
use crate::codec::{Codec, VersioningCodec};
use crate::error::{RegistryError, Result};
use crate::store::KvStore;
use crate::watch::{EventSystem, WatchStream};

/// Admission checks run before any pod write.
pub trait PodValidator: Send + Sync {
    fn validate_pod(&self, pod: &Pod) -> Result<()>;

    /// Fill unset fields before validation. Only applied on create.
    fn apply_defaults(&self, _pod: &mut Pod) {}
}

/// Namespaced pod objects under `pods/<namespace>/<name>`.
///
/// The registry stores whatever phase it is given; transition legality is
/// the reconciler's concern.
#[derive(Clone)]
pub struct PodRegistry<C: Codec = VersioningCodec> {
    inner: Registry<Pod, C>,
    validator: Arc<dyn PodValidator>,
}

impl<C: Codec> PodRegistry<C> {
    /// A pod registry with its own key locks.
    pub fn new(
        store: Arc<dyn KvStore>,
        codec: C,
        events: EventSystem,
        validator: Arc<dyn PodValidator>,
    ) -> Self {
        Self::from_registry(Registry::new(store, codec, events), validator)
    }

    /// Wrap an existing generic registry, sharing its locks.
    pub fn from_registry(inner: Registry<Pod, C>, validator: Arc<dyn PodValidator>) -> Self {
        Self { inner, validator }
    }

    pub fn registry(&self) -> &Registry<Pod, C> {
        &self.inner
    }

    /// Apply defaults, validate, then create. The stored version is 1.
    pub async fn create_pod(&self, mut pod: Pod) -> Result<Pod> {
        self.validator.apply_defaults(&mut pod);
        self.validator.validate_pod(&pod)?;
        let pod = self.inner.create_object(pod).await?;
        info!(pod = %pod.key(), "pod created");
        Ok(pod)
    }

    /// Replace the pod, expecting its carried resource version.
    pub async fn update_pod(&self, pod: Pod) -> Result<Pod> {
        self.validator.validate_pod(&pod)?;
        self.inner.update_object(pod).await
    }

    /// Apply `mutate` to the current pod, retrying on conflict.
    pub async fn update_pod_with<F>(&self, namespace: &str, name: &str, mut mutate: F) -> Result<Pod>
    where
        F: FnMut(&mut Pod) -> Result<()>,
    {
        let validator = Arc::clone(&self.validator);
        self.inner
            .guaranteed_update(&pod_key(namespace, name), |pod| {
                mutate(pod)?;
                validator.validate_pod(pod)
            })
            .await
    }

    /// Move the pod to `Terminating`. Pods that already finished keep
    /// their terminal phase.
    pub async fn mark_terminating(&self, namespace: &str, name: &str) -> Result<Pod> {
        let pod = self
            .inner
            .guaranteed_update(&pod_key(namespace, name), |pod| {
                if !pod.status.phase.is_terminal() {
                    pod.status.phase = PodPhase::Terminating;
                }
                Ok(())
            })
            .await?;
        debug!(pod = %pod.key(), phase = %pod.status.phase, "termination requested");
        Ok(pod)
    }

    /// Delete the pod if it is still at `expected_version`.
    ///
    /// Returns its final state, or `None` if the stored entry was unreadable.
    pub async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        expected_version: u64,
    ) -> Result<Option<Pod>> {
        let key = pod_key(namespace, name);
        let pod = self.inner.delete(&key, expected_version).await?;
        info!(pod = %key, "pod deleted");
        Ok(pod)
    }

    /// The pod `namespace/name`, or `NotFound`.
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let key = pod_key(namespace, name);
        self.inner
            .get(&key)
            .await?
            .ok_or(RegistryError::NotFound(key))
    }

    /// Every pod in every namespace.
    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.inner.list_all().await
    }

    pub async fn list_pods_in_namespace(&self, namespace: &str) -> Result<Vec<Pod>> {
        let prefix = format!("{}/{}/", Pod::PREFIX, namespace);
        Ok(self.inner.list(&prefix).await?.collect())
    }

    pub async fn list_pods_by_phase(&self, phase: PodPhase) -> Result<Vec<Pod>> {
        self.list_filtered(|p| p.status.phase == phase).await
    }

    /// Pods currently bound to `node_name`.
    pub async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        self.list_filtered(|p| p.status.bound_node_name.as_deref() == Some(node_name))
            .await
    }

    /// The pod running on the cloud instance `instance_id`, if any.
    pub async fn get_pod_for_instance(&self, instance_id: &str) -> Result<Option<Pod>> {
        Ok(self
            .inner
            .list(Pod::PREFIX)
            .await?
            .find(|p| p.status.bound_instance_id.as_deref() == Some(instance_id)))
    }

    /// Watch every pod, or only one namespace.
    pub fn watch(&self, namespace: Option<&str>) -> Result<WatchStream> {
        match namespace {
            Some(ns) => self.inner.watch(&format!("{}/{}/", Pod::PREFIX, ns)),
            None => self.inner.watch(Pod::PREFIX),
        }
    }

    async fn list_filtered(&self, keep: impl Fn(&Pod) -> bool) -> Result<Vec<Pod>> {
        Ok(self.inner.list(Pod::PREFIX).await?.filter(|p| keep(p)).collect())
    }
}

fn pod_key(namespace: &str, name: &str) -> String {
    object_key(Pod::PREFIX, Some(namespace), name)
}
