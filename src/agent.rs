//! Client capability for the agent running on each node.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::api::NetworkAddress;
use crate::error::Result;

/// Live output from a node agent, one chunk per frame.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeAgentClient: Send + Sync {
    /// Upload a named package to the node reachable at `addresses`.
    async fn deploy_package(&self, addresses: &[NetworkAddress], name: &str, data: Vec<u8>) -> Result<()>;

    /// Open a byte stream from the agent endpoint at `path`.
    async fn stream_logs(&self, addresses: &[NetworkAddress], path: &str) -> Result<ByteStream>;
}

/// Agent endpoint streaming `container`'s output.
pub fn stream_logs_path(container: &str, with_metadata: bool) -> String {
    let mut path = format!("rest/v1/logs/{}", container);
    if with_metadata {
        path.push_str("?metadata=1");
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_logs_path() {
        assert_eq!(stream_logs_path("main", false), "rest/v1/logs/main");
        assert_eq!(stream_logs_path("main", true), "rest/v1/logs/main?metadata=1");
    }
}
