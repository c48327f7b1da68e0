//! RPC proxy dispatch: cached reads, locally composed tipsets, verbatim
//! forwarding, and the availability fallback.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use strata_core::{
    cache::assemble,
    chain::lotus_json,
    proxy::Proxy,
    store::Store,
    types::JsonRpcRequest,
};

use crate::mock_infrastructure::{
    fixtures::{connected_client, header_block, raw_cid, test_breaker},
    BlockHostMock, NodeMock,
};

async fn proxy_over(node: &NodeMock, host: &BlockHostMock, store: Arc<Store>) -> Proxy {
    let client = connected_client(node.endpoint(), test_breaker()).await;
    let chain = assemble(client.clone(), Some(&host.base_url()), Some(store)).unwrap();
    Proxy::new(client, chain.top)
}

fn request(method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest::new(method, Some(params), json!(1))
}

#[tokio::test]
async fn chain_read_obj_serves_base64_bytes_from_cache() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let c = raw_cid(b"hello");
    node.mock_chain_read_obj(&c, b"hello");
    host.mock_missing(&c);

    let proxy = proxy_over(&node, &host, store.clone()).await;
    let response = proxy
        .handle(request("Filecoin.ChainReadObj", json!([lotus_json::cid(&c)])))
        .await;

    assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
    let encoded = response.result.unwrap();
    assert_eq!(
        BASE64.decode(encoded.as_str().unwrap()).unwrap(),
        b"hello"
    );
    // The read filled the local store on its way through the chain.
    assert_eq!(store.record_count(), 1);
}

#[tokio::test]
async fn chain_has_obj_answers_from_cache_fill() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let present = raw_cid(b"present");
    let absent = raw_cid(b"absent");
    node.mock_chain_read_obj(&present, b"present");
    node.mock_chain_read_obj_not_found(&absent);
    host.mock_missing(&present);
    host.mock_missing(&absent);

    let proxy = proxy_over(&node, &host, store).await;

    let response = proxy
        .handle(request("Filecoin.ChainHasObj", json!([lotus_json::cid(&present)])))
        .await;
    assert_eq!(response.result, Some(Value::Bool(true)));

    let response = proxy
        .handle(request("Filecoin.ChainHasObj", json!([lotus_json::cid(&absent)])))
        .await;
    assert_eq!(response.result, Some(Value::Bool(false)));
}

#[tokio::test]
async fn chain_get_block_decodes_cached_header() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let (c, bytes, header) = header_block("f01234", 828_000, vec![raw_cid(b"parent")]);
    node.mock_chain_read_obj(&c, &bytes);
    host.mock_missing(&c);

    let proxy = proxy_over(&node, &host, store).await;
    let response = proxy
        .handle(request("Filecoin.ChainGetBlock", json!([lotus_json::cid(&c)])))
        .await;

    assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
    let result = response.result.unwrap();
    assert_eq!(result["Miner"], "f01234");
    assert_eq!(result["Height"], header.height);
    assert_eq!(result["Timestamp"], header.timestamp);
    assert_eq!(result["Parents"][0]["/"], raw_cid(b"parent").to_string());
}

#[tokio::test]
async fn chain_get_tipset_is_composed_from_cached_blocks() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let parents = vec![raw_cid(b"parent")];
    let (c1, b1, _) = header_block("f01001", 900, parents.clone());
    let (c2, b2, _) = header_block("f01002", 900, parents);
    node.mock_chain_read_obj(&c1, &b1);
    node.mock_chain_read_obj(&c2, &b2);
    host.mock_missing(&c1);
    host.mock_missing(&c2);

    let proxy = proxy_over(&node, &host, store).await;
    let key = json!([lotus_json::cid(&c1), lotus_json::cid(&c2)]);
    let response = proxy.handle(request("Filecoin.ChainGetTipSet", json!([key]))).await;

    assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
    let result = response.result.unwrap();
    assert_eq!(result["Height"], 900);
    assert_eq!(result["Cids"].as_array().unwrap().len(), 2);
    assert_eq!(result["Blocks"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn tipset_with_mismatched_heights_is_rejected() {
    let mut node = NodeMock::start().await;
    let mut host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let parents = vec![raw_cid(b"parent")];
    let (c1, b1, _) = header_block("f01001", 900, parents.clone());
    let (c2, b2, _) = header_block("f01002", 901, parents);
    node.mock_chain_read_obj(&c1, &b1);
    node.mock_chain_read_obj(&c2, &b2);
    host.mock_missing(&c1);
    host.mock_missing(&c2);

    let proxy = proxy_over(&node, &host, store).await;
    let key = json!([lotus_json::cid(&c1), lotus_json::cid(&c2)]);
    let response = proxy.handle(request("Filecoin.ChainGetTipSet", json!([key]))).await;

    let error = response.error.expect("mismatched tipset");
    assert_eq!(error.code, -32603);
}

#[tokio::test]
async fn get_tipset_from_key_short_circuits_to_chain_head() {
    let mut node = NodeMock::start().await;
    let host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let head = json!({ "Cids": [], "Blocks": [], "Height": 1234 });
    node.mock_result("Filecoin.ChainHead", head.clone());

    let proxy = proxy_over(&node, &host, store).await;
    let response = proxy.handle(request("Filecoin.GetTipSetFromKey", json!([[]]))).await;
    assert_eq!(response.result, Some(head));
}

#[tokio::test]
async fn state_queries_are_forwarded_verbatim() {
    let mut node = NodeMock::start().await;
    let host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let miners = json!(["f01111", "f02222"]);
    node.mock_result("Filecoin.StateListMiners", miners.clone());

    let proxy = proxy_over(&node, &host, store).await;
    let response = proxy.handle(request("Filecoin.StateListMiners", json!([[]]))).await;
    assert_eq!(response.result, Some(miners));
}

#[tokio::test]
async fn unknown_methods_are_refused() {
    let node = NodeMock::start().await;
    let host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let proxy = proxy_over(&node, &host, store).await;
    let response = proxy.handle(request("Filecoin.MpoolPush", json!([]))).await;

    let error = response.error.expect("write methods are not proxied");
    assert_eq!(error.code, -32601);
}

#[tokio::test]
async fn invalid_cid_params_are_rejected() {
    let node = NodeMock::start().await;
    let host = BlockHostMock::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_create(dir.path()).unwrap();

    let proxy = proxy_over(&node, &host, store).await;
    let response = proxy
        .handle(request("Filecoin.ChainReadObj", json!([{"/": "not-a-cid"}])))
        .await;

    let error = response.error.expect("invalid cid");
    assert_eq!(error.code, -32602);
}

#[tokio::test]
async fn cached_read_falls_back_to_node_when_store_tier_errors() {
    // Chain of just the node tier, with the node serving the object: the
    // degenerate case where "cache" and fallback are the same hop still
    // serves bytes.
    let mut node = NodeMock::start().await;
    let c = raw_cid(b"direct");
    node.mock_chain_read_obj(&c, b"direct");

    let client = connected_client(node.endpoint(), test_breaker()).await;
    let chain = assemble(client.clone(), None, None).unwrap();
    let proxy = Proxy::new(client, chain.top);

    let response = proxy
        .handle(request("Filecoin.ChainReadObj", json!([lotus_json::cid(&c)])))
        .await;
    assert!(response.error.is_none());
    assert_eq!(
        BASE64.decode(response.result.unwrap().as_str().unwrap()).unwrap(),
        b"direct"
    );
}
