//! Container log registry.
//!
//! Logs uploaded from instances are stored whole under
//! `logs/<namespace>/<name>`, each pointing back at its pod. Reads can trim
//! to a line or byte tail.

use std::sync::Arc;
use uuid::Uuid;

use super::Registry;
use crate::api::{object_key, Log, ObjectMeta, ObjectReference, Pod, Resource};
use crate::codec::{Codec, VersioningCodec};
use crate::error::{RegistryError, Result};
use crate::store::KvStore;
use crate::validation::validate_log;
use crate::watch::{EventSystem, WatchStream};

/// Uploaded container output under `logs/<namespace>/<name>`.
#[derive(Clone)]
pub struct LogRegistry<C: Codec = VersioningCodec> {
    inner: Registry<Log, C>,
}

impl<C: Codec> LogRegistry<C> {
    /// A log registry with its own key locks.
    pub fn new(store: Arc<dyn KvStore>, codec: C, events: EventSystem) -> Self {
        Self::from_registry(Registry::new(store, codec, events))
    }

    /// Wrap an existing generic registry, sharing its locks.
    pub fn from_registry(inner: Registry<Log, C>) -> Self {
        Self { inner }
    }

    pub fn registry(&self) -> &Registry<Log, C> {
        &self.inner
    }

    /// Validate and store a log.
    pub async fn create_log(&self, log: Log) -> Result<Log> {
        validate_log(&log)?;
        self.inner.create_object(log).await
    }

    /// Store `content` captured from `container` of `pod`.
    pub async fn record_log(
        &self,
        pod: &Pod,
        container: &str,
        instance_id: &str,
        content: impl Into<String>,
    ) -> Result<Log> {
        let parent_object = ObjectReference::to(pod);
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = format!("{}.{}.{}", pod.metadata.name, container, Uuid::new_v4().simple());
        self.create_log(Log {
            metadata: ObjectMeta::namespaced(namespace, name),
            parent_object,
            container_name: container.to_string(),
            instance_id: instance_id.to_string(),
            content: content.into(),
        })
        .await
    }

    /// The log `namespace/name`, untrimmed, or `NotFound`.
    pub async fn get_log(&self, namespace: &str, name: &str) -> Result<Log> {
        let key = object_key(Log::PREFIX, Some(namespace), name);
        self.inner
            .get(&key)
            .await?
            .ok_or(RegistryError::NotFound(key))
    }

    /// Delete the log if it is still at `expected_version`.
    pub async fn delete_log(
        &self,
        namespace: &str,
        name: &str,
        expected_version: u64,
    ) -> Result<Option<Log>> {
        let key = object_key(Log::PREFIX, Some(namespace), name);
        self.inner.delete(&key, expected_version).await
    }

    /// Every stored log, untrimmed.
    pub async fn list_logs(&self) -> Result<Vec<Log>> {
        self.inner.list_all().await
    }

    /// The newest log for `container` of the pod `namespace/pod`, trimmed
    /// to its last `tail_lines` lines and then its last `limit_bytes` bytes.
    ///
    /// An empty `container` matches any container of the pod.
    pub async fn find_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<usize>,
        limit_bytes: Option<usize>,
    ) -> Result<Log> {
        let prefix = format!("{}/{}/", Log::PREFIX, namespace);
        let newest = self
            .inner
            .list(&prefix)
            .await?
            .filter(|log| {
                log.parent_object.kind == Pod::KIND
                    && log.parent_object.name == pod
                    && (container.is_empty() || log.container_name == container)
            })
            .max_by_key(|log| log.metadata.creation_timestamp);

        let mut log = newest.ok_or_else(|| {
            RegistryError::NotFound(format!("logs for {}/{} container {:?}", namespace, pod, container))
        })?;
        log.content = trim_content(&log.content, tail_lines, limit_bytes).to_string();
        Ok(log)
    }

    pub fn watch(&self) -> Result<WatchStream> {
        self.inner.watch(Log::PREFIX)
    }
}

/// Keep the last `tail_lines` lines, then at most the last `limit_bytes`
/// bytes, cut forward to a char boundary.
pub fn trim_content(content: &str, tail_lines: Option<usize>, limit_bytes: Option<usize>) -> &str {
    let mut out = content;
    if let Some(lines) = tail_lines {
        out = tail(out, lines);
    }
    if let Some(limit) = limit_bytes {
        if out.len() > limit {
            let mut start = out.len() - limit;
            while !out.is_char_boundary(start) {
                start += 1;
            }
            out = &out[start..];
        }
    }
    out
}

fn tail(content: &str, lines: usize) -> &str {
    if lines == 0 {
        return "";
    }
    // A trailing newline terminates the last line rather than starting one.
    let body = content.strip_suffix('\n').unwrap_or(content);
    let mut seen = 0;
    for (i, b) in body.bytes().enumerate().rev() {
        if b == b'\n' {
            seen += 1;
            if seen == lines {
                return &content[i + 1..];
            }
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use tokio_util::sync::CancellationToken;

    fn registry() -> LogRegistry {
        let events = EventSystem::new(64, CancellationToken::new());
        LogRegistry::new(Arc::new(MemoryStore::new()), VersioningCodec, events)
    }

    #[test]
    fn test_trim_content() {
        let content = "one\ntwo\nthree\n";
        assert_eq!(trim_content(content, None, None), content);
        assert_eq!(trim_content(content, Some(2), None), "two\nthree\n");
        assert_eq!(trim_content(content, Some(10), None), content);
        assert_eq!(trim_content(content, Some(0), None), "");
        assert_eq!(trim_content("a\nb", Some(1), None), "b");
        assert_eq!(trim_content(content, None, Some(6)), "three\n");
        assert_eq!(trim_content(content, Some(2), Some(3)), "ee\n");
        // Never splits a multi-byte char.
        assert_eq!(trim_content("aé", None, Some(1)), "");
        assert_eq!(trim_content("aé", None, Some(2)), "é");
    }

    #[tokio::test]
    async fn test_find_newest_log() {
        let reg = registry();
        let pod = Pod::new("default", "web", "nginx");
        let other = Pod::new("default", "api", "nginx");

        reg.record_log(&pod, "main", "i-1", "old\n").await.unwrap();
        reg.record_log(&other, "main", "i-2", "other\n").await.unwrap();
        reg.record_log(&pod, "main", "i-1", "l1\nl2\nl3\n").await.unwrap();
        reg.record_log(&pod, "sidecar", "i-1", "side\n").await.unwrap();

        let log = reg
            .find_log("default", "web", "main", None, None)
            .await
            .unwrap();
        assert_eq!(log.content, "l1\nl2\nl3\n");
        assert_eq!(log.instance_id, "i-1");

        let log = reg
            .find_log("default", "web", "main", Some(1), None)
            .await
            .unwrap();
        assert_eq!(log.content, "l3\n");

        let any = reg.find_log("default", "web", "", None, None).await.unwrap();
        assert_eq!(any.content, "side\n");
    }

    #[tokio::test]
    async fn test_find_log_missing() {
        let reg = registry();
        let err = reg
            .find_log("default", "web", "main", None, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
