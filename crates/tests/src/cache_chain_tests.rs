//! Cache chain scenarios: cold miss through the full chain, warm hits from
//! a reopened store, fill integrity, zero-length blocks, and concurrent
//! fills.

use std::sync::Arc;

use strata_core::{
    block::{self, digest_key},
    cache::{assemble, BlockTier, CacheChain, CacheError},
    store::Store,
};

use crate::mock_infrastructure::{
    fixtures::{connected_client, raw_cid, test_breaker},
    BlockHostMock, NodeMock,
};

fn tier<'a>(chain: &'a CacheChain, name: &str) -> &'a Arc<dyn BlockTier> {
    chain.tiers.iter().find(|t| t.name() == name).expect("tier present")
}

async fn full_chain(
    node: &NodeMock,
    host: &BlockHostMock,
    store: Arc<Store>,
) -> CacheChain {
    let client = connected_client(node.endpoint(), test_breaker()).await;
    assemble(client, Some(&host.base_url()), Some(store)).expect("chain assembles")
}

#[tokio::test]
async fn cold_miss_walks_full_chain_and_fills_store() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let c = raw_cid(b"hello");
    node.mock_chain_read_obj(&c, b"hello");
    host.mock_missing(&c);

    let chain = full_chain(&node, &host, store.clone()).await;
    let block = chain.top.get(&c).await.expect("block retrieved");
    assert_eq!(block.data(), b"hello");
    assert_eq!(block.cid(), &c);

    // The local tier filled itself on the way back up.
    assert!(store.contains(&digest_key(&c)));
    assert_eq!(store.record_count(), 1);

    let disk = tier(&chain, "disk").counters().snapshot();
    let http = tier(&chain, "http").counters().snapshot();
    let node_snap = tier(&chain, "node").counters().snapshot();
    assert_eq!((disk.hits, disk.misses, disk.errors), (0, 1, 0));
    assert_eq!((http.hits, http.misses, http.errors), (0, 1, 0));
    assert_eq!((node_snap.hits, node_snap.misses, node_snap.errors), (1, 0, 0));
}

#[tokio::test]
async fn warm_hit_from_reopened_store_skips_the_node() {
    let c = raw_cid(b"hello");
    let dir = tempfile::tempdir().unwrap();

    {
        let mut node = NodeMock::start().await;
        let mut host = BlockHostMock::start().await;
        node.mock_chain_read_obj(&c, b"hello");
        host.mock_missing(&c);
        let store = Store::open_or_create(dir.path()).unwrap();
        let chain = full_chain(&node, &host, store).await;
        chain.top.get(&c).await.expect("cold fill");
    }

    // Fresh proxy over the same store directory; the node has no object
    // mocks at all, so any contact would fail loudly.
    let node = NodeMock::start().await;
    let host = BlockHostMock::start().await;
    let store = Store::open_or_create(dir.path()).unwrap();
    let chain = full_chain(&node, &host, store).await;

    let block = chain.top.get(&c).await.expect("warm hit");
    assert_eq!(block.data(), b"hello");

    let disk = tier(&chain, "disk").counters().snapshot();
    assert_eq!((disk.hits, disk.misses, disk.errors), (1, 0, 0));
    assert_eq!(tier(&chain, "http").counters().snapshot().requests(), 0);
    assert_eq!(tier(&chain, "node").counters().snapshot().requests(), 0);
}

#[tokio::test]
async fn repeated_get_hits_locally_without_second_upstream_call() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let c = raw_cid(b"payload");
    node.mock_chain_read_obj(&c, b"payload");
    host.mock_missing(&c);

    let chain = full_chain(&node, &host, store).await;
    let first = chain.top.get(&c).await.unwrap();
    let second = chain.top.get(&c).await.unwrap();
    assert_eq!(first.data(), second.data());

    // One upstream round trip total: the second get was a local hit.
    let node_snap = tier(&chain, "node").counters().snapshot();
    assert_eq!(node_snap.requests(), 1);
    let disk = tier(&chain, "disk").counters().snapshot();
    assert_eq!((disk.hits, disk.misses), (1, 1));
}

#[tokio::test]
async fn wrong_hash_from_upstream_is_surfaced_and_never_stored() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let c = raw_cid(b"hello");
    // The node answers with bytes that do not hash to the requested CID.
    node.mock_chain_read_obj(&c, b"world");
    host.mock_missing(&c);

    let chain = full_chain(&node, &host, store.clone()).await;
    let err = chain.top.get(&c).await.expect_err("corrupt fill must fail");
    assert!(
        matches!(err, CacheError::WrongHash { ref expected, .. } if *expected == c),
        "unexpected error: {err}"
    );

    // The poison never reached the store.
    assert!(!store.contains(&digest_key(&c)));
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn zero_length_block_served_but_not_inserted() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let c0 = raw_cid(b"");
    node.mock_chain_read_obj(&c0, b"");
    host.mock_missing(&c0);

    let chain = full_chain(&node, &host, store.clone()).await;
    let block = chain.top.get(&c0).await.expect("empty block served");
    assert!(block.is_empty());
    assert!(block::verify(block.cid(), block.data()).unwrap());

    assert!(!store.contains(&digest_key(&c0)));
    assert_eq!(store.record_count(), 0);

    // The next request refills the same way rather than hitting a record.
    let again = chain.top.get(&c0).await.expect("refill");
    assert!(again.is_empty());
    let disk = tier(&chain, "disk").counters().snapshot();
    assert_eq!((disk.hits, disk.misses), (0, 2));
}

#[tokio::test]
async fn has_true_implies_verifiable_get() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let c = raw_cid(b"verifiable");
    node.mock_chain_read_obj(&c, b"verifiable");
    host.mock_missing(&c);

    let chain = full_chain(&node, &host, store).await;
    assert!(chain.top.has(&c).await.expect("has fills"));

    let block = chain.top.get(&c).await.expect("get after has");
    assert!(block::verify(block.cid(), block.data()).unwrap());
}

#[tokio::test]
async fn chain_without_local_tier_reads_through_http() {
    let node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;

    let c = raw_cid(b"hosted");
    host.mock_block(&c, b"hosted");
    // No node-side object mock: the block host must satisfy this alone.

    let client = connected_client(node.endpoint(), test_breaker()).await;
    let chain = assemble(client, Some(&host.base_url()), None).unwrap();

    let block = chain.top.get(&c).await.expect("served by block host");
    assert_eq!(block.data(), b"hosted");
    assert!(chain.top.has(&c).await.unwrap());

    let http = tier(&chain, "http").counters().snapshot();
    assert_eq!((http.hits, http.misses, http.errors), (2, 0, 0));
    assert_eq!(tier(&chain, "node").counters().snapshot().requests(), 0);
}

#[tokio::test]
async fn node_only_chain_reports_not_found() {
    let mut node = NodeMock::start().await;
    let c = raw_cid(b"absent");
    node.mock_chain_read_obj_not_found(&c);

    let client = connected_client(node.endpoint(), test_breaker()).await;
    let chain = assemble(client, None, None).unwrap();

    let err = chain.top.get(&c).await.expect_err("absent upstream-wide");
    assert!(matches!(err, CacheError::NotFound));
    let node_snap = tier(&chain, "node").counters().snapshot();
    assert_eq!((node_snap.hits, node_snap.misses, node_snap.errors), (0, 1, 0));
}

#[tokio::test]
async fn concurrent_fills_of_one_cid_are_benign() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let c = raw_cid(b"contended");
    node.mock_chain_read_obj(&c, b"contended");
    host.mock_missing(&c);

    let chain = full_chain(&node, &host, store.clone()).await;
    let top = chain.top.clone();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let top = top.clone();
        let c = c;
        handles.push(tokio::spawn(async move { top.get(&c).await }));
    }
    for handle in handles {
        let block = handle.await.unwrap().expect("every caller gets the bytes");
        assert_eq!(block.data(), b"contended");
    }

    // The store saw at most one committed record and no lasting damage.
    assert_eq!(store.record_count(), 1);
    let disk = tier(&chain, "disk").counters().snapshot();
    assert_eq!(disk.errors, 0);
}
