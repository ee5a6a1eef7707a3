//! Bounded fan-out for independent cloud calls.

use futures::stream::{self, StreamExt};
use std::future::Future;
use tracing::{info, warn};

use crate::api::Node;
use crate::cloud::{CloudClient, StartNodeResult};
use crate::error::Result;

/// Run `tasks` with at most `limit` in flight.
///
/// Every task runs to completion before anything is reported. Results come
/// back in task order; on failure the error of the lowest-indexed failing
/// task is returned.
pub async fn run_bounded<T, F>(tasks: Vec<F>, limit: usize) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    let total = tasks.len();
    let mut results: Vec<(usize, Result<T>)> = stream::iter(
        tasks
            .into_iter()
            .enumerate()
            .map(|(i, task)| async move { (i, task.await) }),
    )
    .buffer_unordered(limit.max(1))
    .collect()
    .await;
    results.sort_by_key(|(i, _)| *i);

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        warn!(failed, total, "bounded tasks finished with failures");
    }
    results.into_iter().map(|(_, r)| r).collect()
}

/// Start every node in parallel, `limit` at a time, recording each
/// instance id on its node.
pub async fn start_nodes(
    cloud: &dyn CloudClient,
    nodes: &mut [Node],
    limit: usize,
) -> Result<Vec<StartNodeResult>> {
    let tasks = nodes
        .iter()
        .map(|node| async move {
            if node.spec.spot {
                cloud.start_spot_node(node, "").await
            } else {
                cloud.start_node(node, "").await
            }
        })
        .collect();
    let started = run_bounded(tasks, limit).await?;

    for (node, result) in nodes.iter_mut().zip(&started) {
        node.status.instance_id = Some(result.instance_id.clone());
    }
    info!(count = started.len(), "all nodes started");
    Ok(started)
}

/// Stop every instance, `limit` at a time.
pub async fn stop_instances(cloud: &dyn CloudClient, instance_ids: &[String], limit: usize) -> Result<()> {
    let tasks = instance_ids
        .iter()
        .map(|id| cloud.stop_instance(id))
        .collect();
    run_bounded(tasks, limit).await?;
    Ok(())
}
