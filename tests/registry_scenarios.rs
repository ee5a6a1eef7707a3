//! End-to-end registry behaviour over both store backends.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use instance_registry::api::Container;
use instance_registry::cloud::{CloudClient, InMemoryCloud, SubnetAttributes};
use instance_registry::config::StoreBackend;
use instance_registry::pool::start_nodes;
use instance_registry::prelude::*;
use tokio_util::sync::CancellationToken;

fn node(name: &str) -> Node {
    let mut node = Node::new(name, "t3.small");
    node.spec.boot_image = "ami-0abc".to_string();
    node
}

async fn memory_context() -> RegistryContext {
    RegistryContext::from_config(RegistryConfig::default())
        .await
        .unwrap()
}

async fn registries(ctx: &RegistryContext) -> Registries {
    let cloud = InMemoryCloud::with_subnets(vec![SubnetAttributes {
        id: "subnet-1".to_string(),
        name: "private".to_string(),
        cidr: "172.20.1.0/24".to_string(),
        availability_zone: "us-east-1a".to_string(),
        public: false,
    }]);
    let validator = ctx.stateful_validator(Arc::new(cloud)).await.unwrap();
    ctx.registries(Arc::new(validator))
}

async fn next_event(stream: &mut WatchStream) -> ChangeEvent {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for event")
        .and_then(Notification::into_event)
        .expect("stream ended")
}

#[tokio::test]
async fn pod_create_update_delete_emits_events_in_order() {
    let ctx = memory_context().await;
    let regs = registries(&ctx).await;
    let mut watch = regs.pods.watch(Some("default")).unwrap();

    let pod = regs
        .pods
        .create_pod(Pod::new("default", "p1", "nginx:1.25"))
        .await
        .unwrap();
    assert_eq!(pod.metadata.resource_version, 1);

    let mut running = pod.clone();
    running.status.phase = PodPhase::Running;
    let running = regs.pods.update_pod(running).await.unwrap();
    assert_eq!(running.metadata.resource_version, 2);

    regs.pods.delete_pod("default", "p1", 2).await.unwrap();
    assert!(regs
        .pods
        .get_pod("default", "p1")
        .await
        .unwrap_err()
        .is_not_found());

    let kinds: Vec<(EventType, u64)> = [
        next_event(&mut watch).await,
        next_event(&mut watch).await,
        next_event(&mut watch).await,
    ]
    .into_iter()
    .map(|e| (e.event_type, e.resource_version))
    .collect();
    assert_eq!(
        kinds,
        vec![
            (EventType::Added, 1),
            (EventType::Modified, 2),
            (EventType::Deleted, 3),
        ]
    );
}

#[tokio::test]
async fn racing_updates_have_one_winner() {
    let ctx = memory_context().await;
    let nodes = ctx.node_registry();

    let mut current = nodes.create_node(node("n1")).await.unwrap();
    for _ in 0..2 {
        current = nodes.update_node(current).await.unwrap();
    }
    assert_eq!(current.metadata.resource_version, 3);

    let mut a = current.clone();
    a.status.phase = NodePhase::Available;
    let mut b = current.clone();
    b.status.phase = NodePhase::Terminating;

    let (ra, rb) = tokio::join!(
        {
            let nodes = nodes.clone();
            tokio::spawn(async move { nodes.update_node(a).await })
        },
        {
            let nodes = nodes.clone();
            tokio::spawn(async move { nodes.update_node(b).await })
        }
    );
    let results = [ra.unwrap(), rb.unwrap()];
    let winners: Vec<&Node> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].metadata.resource_version, 4);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(RegistryError::Conflict { expected: 3, found: 4, .. }))));

    let stored = nodes.get_node("n1").await.unwrap();
    assert_eq!(stored.status.phase, winners[0].status.phase);
}

#[tokio::test]
async fn node_listener_ignores_pod_writes() {
    let ctx = memory_context().await;
    let regs = registries(&ctx).await;
    let mut listener = ctx.events().subscribe("nodes/");

    let (n, p) = tokio::join!(
        regs.nodes.create_node(node("n1")),
        regs.pods.create_pod(Pod::new("default", "p1", "nginx"))
    );
    n.unwrap();
    p.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), listener.recv())
        .await
        .unwrap()
        .and_then(Notification::into_event)
        .unwrap();
    assert_eq!(event.key, "nodes/n1");
    assert_eq!(event.event_type, EventType::Added);
    assert!(listener.try_recv().is_none());
}

#[tokio::test]
async fn invalid_pod_is_rejected_before_write() {
    let ctx = memory_context().await;
    let regs = registries(&ctx).await;

    let mut pod = Pod::new("default", "p1", "nginx");
    pod.spec.placement.subnet_id = Some("subnet-1".to_string());
    pod.spec.private_ip = Some("10.9.9.9".to_string());
    pod.spec.containers.push(Container {
        name: "Bad Name".to_string(),
        image: "busybox".to_string(),
        command: vec![],
    });

    let err = regs.pods.create_pod(pod).await.unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, RegistryError::InvalidInput(_)));
    assert!(msg.contains("outside the VPC"));
    assert!(msg.contains("not a valid DNS label"));
    assert!(regs.pods.list_pods().await.unwrap().is_empty());
    assert_eq!(ctx.events().published_count(), 0);
}

#[tokio::test]
async fn sqlite_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RegistryConfig::default();
    config.store.backend = StoreBackend::Sqlite;
    config.store.path = dir.path().join("registry.db");

    {
        let ctx = RegistryContext::from_config(config.clone()).await.unwrap();
        let nodes = ctx.node_registry();
        nodes.create_node(node("n1")).await.unwrap();
        nodes
            .update_node_with("n1", |n| {
                n.status.phase = NodePhase::Available;
                Ok(())
            })
            .await
            .unwrap();
        ctx.shutdown();
    }

    let ctx = RegistryContext::from_config(config).await.unwrap();
    let n1 = ctx.node_registry().get_node("n1").await.unwrap();
    assert_eq!(n1.status.phase, NodePhase::Available);
    assert_eq!(n1.metadata.resource_version, 2);
}

#[tokio::test]
async fn started_nodes_become_addressable() {
    let ctx = memory_context().await;
    let nodes = ctx.node_registry();
    let cloud = InMemoryCloud::new();

    let mut batch = vec![node("n1"), node("n2"), node("n3")];
    start_nodes(&cloud, &mut batch, 2).await.unwrap();

    for mut n in batch {
        n.status.addresses = cloud.wait_for_running(&n).await.unwrap();
        n.status.phase = NodePhase::Created;
        nodes.create_node(n).await.unwrap();
    }

    let ready = nodes.list_nodes_with_addresses().await.unwrap();
    assert_eq!(ready.len(), 3);
    assert!(ready
        .iter()
        .all(|n| n.status.addresses[0].address.starts_with("10.0.")));

    let id = ready[1].status.instance_id.clone().unwrap();
    let found = nodes.get_node_by_instance_id(&id).await.unwrap().unwrap();
    assert_eq!(found.metadata.name, ready[1].metadata.name);
}

#[tokio::test]
async fn shutdown_ends_watches_and_rejects_writes() {
    let ctx = memory_context().await;
    let nodes = ctx.node_registry();
    let mut watch = nodes.watch().unwrap();
    nodes.create_node(node("n1")).await.unwrap();

    ctx.shutdown();
    // Events queued before shutdown are still delivered.
    assert_eq!(next_event(&mut watch).await.key, "nodes/n1");
    assert!(watch.next().await.is_none());

    let err = nodes.create_node(node("n2")).await.unwrap_err();
    assert!(matches!(err, RegistryError::ShutDown));
}

#[tokio::test]
async fn cancelled_watchers_leave_the_table() {
    let ctx = memory_context().await;
    let nodes = ctx.node_registry();
    let owner = CancellationToken::new();
    let _idle = ctx.events().subscribe_until("nodes/", owner.clone());
    assert_eq!(ctx.events().listener_count(), 1);

    owner.cancel();
    nodes.create_node(node("n1")).await.unwrap();
    assert_eq!(ctx.events().listener_count(), 0);
}

#[tokio::test]
async fn cancelling_the_context_token_closes_watches() {
    let ctx = memory_context().await;
    let mut watch = ctx.node_registry().watch().unwrap();

    ctx.shutdown_token().cancel();
    assert_eq!(ctx.events().listener_count(), 0);
    let end = tokio::time::timeout(Duration::from_secs(1), watch.next())
        .await
        .unwrap();
    assert!(end.is_none());
}
