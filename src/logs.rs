//! Container log retrieval: stored logs, optionally followed by the node
//! agent's live stream.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::{stream_logs_path, ByteStream, NodeAgentClient};
use crate::api::{Node, PodPhase};
use crate::error::Result;
use crate::registry::{LogRegistry, NodeRegistry, PodRegistry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail_lines: Option<usize>,
    pub limit_bytes: Option<usize>,
    pub timestamps: bool,
}

pub struct ContainerLogs {
    pods: PodRegistry,
    nodes: NodeRegistry,
    logs: LogRegistry,
    agent: Arc<dyn NodeAgentClient>,
}

impl ContainerLogs {
    pub fn new(
        pods: PodRegistry,
        nodes: NodeRegistry,
        logs: LogRegistry,
        agent: Arc<dyn NodeAgentClient>,
    ) -> Self {
        Self {
            pods,
            nodes,
            logs,
            agent,
        }
    }

    /// Output of `container` in `namespace/pod`.
    ///
    /// Without `follow`, or when the pod is not running on a node with a
    /// known address, this is the stored log. Otherwise the stored log is
    /// followed by the agent's live stream.
    pub async fn fetch(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &LogOptions,
    ) -> Result<ByteStream> {
        info!(namespace, pod, container, follow = opts.follow, "fetching container logs");
        let node = if opts.follow {
            self.node_for_running_pod(namespace, pod).await
        } else {
            None
        };

        let Some(node) = node.filter(|n| !n.status.addresses.is_empty()) else {
            debug!(pod, "pulling stored logs");
            let log = self
                .logs
                .find_log(namespace, pod, container, opts.tail_lines, opts.limit_bytes)
                .await?;
            return Ok(stream::once(async move { Ok(log.content.into_bytes()) }).boxed());
        };

        debug!(pod, node = %node.metadata.name, "tailing logs from node agent");
        let path = stream_logs_path(container, opts.timestamps);
        let live = self.agent.stream_logs(&node.status.addresses, &path).await?;
        // A pod that has not uploaded anything yet still has a live stream.
        let stored = match self
            .logs
            .find_log(namespace, pod, container, opts.tail_lines, opts.limit_bytes)
            .await
        {
            Ok(log) => log.content.into_bytes(),
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };

        let head = (!stored.is_empty()).then_some(Ok(stored));
        Ok(stream::iter(head).chain(live).boxed())
    }

    async fn node_for_running_pod(&self, namespace: &str, pod: &str) -> Option<Node> {
        let pod = self.pods.get_pod(namespace, pod).await.ok()?;
        if pod.status.phase != PodPhase::Running {
            return None;
        }
        let node_name = pod.status.bound_node_name?;
        self.nodes.get_node(&node_name).await.ok()
    }
}

/// Drain `stream` into one buffer.
pub async fn read_all(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
