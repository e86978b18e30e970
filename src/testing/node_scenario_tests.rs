//! End-to-end scenarios over running nodes.

use super::{init_tracing, wait_for_result, RecordingSubscriber};
use crate::cache::CacheNode;
use crate::cluster::MemberEvent;
use crate::config::{NodeConfig, RetryConfig};
use crate::error::Error;
use crate::lock::LockOwnerIdentity;
use crate::network::LocalNetwork;
use crate::partitioning::{BucketOwnershipAssignment, RingBucketAssignment};
use crate::subscription::{EntryModifiedEvent, EntryModifiedEventType, SubscriberHandle};
use crate::types::{Binary, NodeAddress, PRIMARY_STORAGE};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const BUCKETS: u32 = 32;

fn config(address: NodeAddress) -> NodeConfig {
    NodeConfig::new(address)
        .with_bucket_count(BUCKETS)
        .with_retry_config(RetryConfig::default().with_timeout(Duration::from_secs(5)))
}

fn local_cluster(n: u64) -> Vec<CacheNode> {
    let addresses: Vec<NodeAddress> = (1..=n).map(NodeAddress::local).collect();
    let assignment = Arc::new(RingBucketAssignment::with_nodes(BUCKETS, 0, addresses.clone()));
    let network = LocalNetwork::new();
    addresses
        .into_iter()
        .map(|address| CacheNode::join_local(config(address), assignment.clone(), &network).unwrap())
        .collect()
}

fn owner_of<'a>(nodes: &'a [CacheNode], key: &[u8]) -> &'a CacheNode {
    let assignment = nodes[0].assignment();
    let owner = assignment
        .bucket_owner_address(PRIMARY_STORAGE, assignment.bucket_of(key))
        .unwrap();
    nodes.iter().find(|node| node.address() == owner).unwrap()
}

#[tokio::test]
async fn test_write_lock_is_exclusive_across_nodes() {
    init_tracing();
    let nodes = local_cluster(3);
    let first = nodes[0].read_write_lock("inventory").write_lock(&LockOwnerIdentity::new("a"));
    let second = nodes[1].read_write_lock("inventory").write_lock(&LockOwnerIdentity::new("b"));

    first.lock().await.unwrap();
    assert!(!second.try_lock().await.unwrap());

    let waiting = tokio::spawn({
        let second = second.clone();
        async move { second.try_lock_for(Duration::from_secs(3)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.unlock().await.unwrap();

    assert!(waiting.await.unwrap().unwrap());
    assert_eq!(second.hold_count().await.unwrap(), 1);
    assert_eq!(first.hold_count().await.unwrap(), 0);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_cache_locks_live_in_the_cache_region() {
    let nodes = local_cluster(2);
    let owner = LockOwnerIdentity::new("worker");
    let in_cache = nodes[0].cache("carts").read_write_lock("k").write_lock(&owner);
    let global = nodes[1].read_write_lock("k").write_lock(&LockOwnerIdentity::new("other"));

    assert_eq!(in_cache.request().region, "carts");
    in_cache.lock().await.unwrap();
    assert!(global.try_lock().await.unwrap());

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_subscriber_receives_owner_notifications() {
    init_tracing();
    let nodes = local_cluster(3);
    let recorder = Arc::new(RecordingSubscriber::new());
    let handle = SubscriberHandle::new(recorder.clone());
    let keys: Vec<Binary> = (0..8).map(|i| Binary::from(format!("user-{}", i))).collect();

    nodes[1]
        .cache("users")
        .add_event_subscriber(keys.clone(), &handle)
        .await
        .unwrap();

    for key in &keys {
        let event = EntryModifiedEvent::new(EntryModifiedEventType::Add, key.clone())
            .with_new_value(Binary::from_static(b"v"));
        owner_of(&nodes, key).cache("users").notify_entry_modified(event).unwrap();
    }

    assert!(recorder.wait_for(keys.len(), Duration::from_secs(2)).await);
    let mut received: Vec<Binary> = recorder.events().into_iter().map(|e| e.key).collect();
    received.sort();
    let mut expected = keys.clone();
    expected.sort();
    assert_eq!(received, expected);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_remove_subscriber_reports_unknown_keys() {
    let nodes = local_cluster(3);
    let cache = nodes[2].cache("users");
    let recorder = Arc::new(RecordingSubscriber::new());
    let handle = SubscriberHandle::new(recorder.clone());

    cache.add_event_subscriber(["a", "b"], &handle).await.unwrap();
    let result = cache.remove_event_subscriber(["a", "c"], &handle).await;
    match result {
        Err(Error::NotSubscribed { subscriber, keys }) => {
            assert_eq!(subscriber, handle.id());
            assert_eq!(keys, vec![Binary::from_static(b"c")]);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let event = EntryModifiedEvent::new(EntryModifiedEventType::Update, Binary::from_static(b"a"));
    owner_of(&nodes, b"a").cache("users").notify_entry_modified(event).unwrap();
    let event = EntryModifiedEvent::new(EntryModifiedEventType::Update, Binary::from_static(b"b"));
    owner_of(&nodes, b"b").cache("users").notify_entry_modified(event).unwrap();

    assert!(recorder.wait_for(1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let keys: Vec<Binary> = recorder.events().into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec![Binary::from_static(b"b")]);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_shutdown_releases_locks_of_departed_node() {
    let nodes = local_cluster(3);
    let held = nodes[2].read_write_lock("job").write_lock(&LockOwnerIdentity::new("leaver"));
    let waiter = nodes[0].read_write_lock("job").write_lock(&LockOwnerIdentity::new("stayer"));

    held.lock().await.unwrap();
    let waiting = tokio::spawn({
        let waiter = waiter.clone();
        async move { waiter.try_lock_for(Duration::from_secs(3)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    nodes[2].shutdown().await;
    assert!(waiting.await.unwrap().unwrap());

    nodes[0].shutdown().await;
    nodes[1].shutdown().await;
}

async fn allocate_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_tcp_nodes_share_locks() {
    init_tracing();
    let mut addresses = Vec::new();
    for id in 1..=3 {
        addresses.push(NodeAddress::new(id, allocate_addr().await));
    }

    let mut nodes = Vec::new();
    for address in &addresses {
        let assignment = Arc::new(RingBucketAssignment::with_nodes(BUCKETS, 0, addresses.clone()));
        let node = CacheNode::start_tcp(config(*address), assignment, addresses.clone())
            .await
            .unwrap();
        nodes.push(node);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a = nodes[1].read_write_lock("shared").write_lock(&LockOwnerIdentity::new("a"));
    let b = nodes[2].read_write_lock("shared").write_lock(&LockOwnerIdentity::new("b"));
    a.lock().await.unwrap();
    assert!(!b.try_lock().await.unwrap());

    a.unlock().await.unwrap();
    assert!(b.try_lock_for(Duration::from_secs(2)).await.unwrap());

    // Node 3 leaves; the survivors drop its lock.
    for node in &nodes[..2] {
        node.on_member_event(MemberEvent::NodeLeave(addresses[2]));
    }
    nodes[2].shutdown().await;
    assert!(a.try_lock_for(Duration::from_secs(2)).await.unwrap());

    let held = wait_for_result(
        || async { a.hold_count().await },
        |count| matches!(count, Ok(1)),
        Duration::from_secs(1),
    )
    .await;
    assert!(held.is_some());

    nodes[0].shutdown().await;
    nodes[1].shutdown().await;
}
