//! Fake full node: a mockito server answering `Filecoin.*` JSON-RPC calls
//! at `POST /rpc/v0`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cid::Cid;
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

/// Builder for node-side JSON-RPC mocks. Created mocks are kept alive for
/// the builder's lifetime.
pub struct NodeMock {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

impl NodeMock {
    /// Starts the fake node. `Filecoin.Version` is pre-mocked so client
    /// connect probes succeed.
    pub async fn start() -> Self {
        let mut node = Self { server: Server::new_async().await, mocks: Vec::new() };
        node.mock_result("Filecoin.Version", json!({ "Version": "mock-node" }));
        node
    }

    /// The node's JSON-RPC endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/rpc/v0", self.server.url())
    }

    fn method_matcher(method: &str) -> Matcher {
        Matcher::Regex(format!(r#""method"\s*:\s*"{method}""#))
    }

    fn method_with_cid_matcher(method: &str, c: &Cid) -> Matcher {
        Matcher::AllOf(vec![
            Self::method_matcher(method),
            Matcher::Regex(format!(r#""{c}""#)),
        ])
    }

    fn rpc_ok(result: Value) -> String {
        json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string()
    }

    fn rpc_err(code: i64, message: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": code, "message": message }
        })
        .to_string()
    }

    /// Mocks any call to `method` with a fixed result.
    pub fn mock_result(&mut self, method: &str, result: Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/rpc/v0")
            .match_body(Self::method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(Self::rpc_ok(result))
            .create();
        self.mocks.push(mock);
        self
    }

    /// Mocks `Filecoin.ChainReadObj` for `c`, returning `data`.
    pub fn mock_chain_read_obj(&mut self, c: &Cid, data: &[u8]) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/rpc/v0")
            .match_body(Self::method_with_cid_matcher("Filecoin.ChainReadObj", c))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(Self::rpc_ok(Value::String(BASE64.encode(data))))
            .create();
        self.mocks.push(mock);
        self
    }

    /// Mocks `Filecoin.ChainReadObj` for `c` with the node's not-found
    /// error.
    pub fn mock_chain_read_obj_not_found(&mut self, c: &Cid) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/rpc/v0")
            .match_body(Self::method_with_cid_matcher("Filecoin.ChainReadObj", c))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(Self::rpc_err(1, "blockstore: block not found"))
            .create();
        self.mocks.push(mock);
        self
    }

    /// Mocks `Filecoin.ChainHasObj` for `c`.
    pub fn mock_chain_has_obj(&mut self, c: &Cid, has: bool) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/rpc/v0")
            .match_body(Self::method_with_cid_matcher("Filecoin.ChainHasObj", c))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(Self::rpc_ok(Value::Bool(has)))
            .create();
        self.mocks.push(mock);
        self
    }

    /// Mocks any call to `method` with a JSON-RPC error.
    pub fn mock_rpc_error(&mut self, method: &str, code: i64, message: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/rpc/v0")
            .match_body(Self::method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(Self::rpc_err(code, message))
            .create();
        self.mocks.push(mock);
        self
    }

    /// Mocks any call to `method` with an HTTP-level failure.
    pub fn mock_transport_failure(&mut self, method: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/rpc/v0")
            .match_body(Self::method_matcher(method))
            .with_status(500)
            .with_body("internal server error")
            .create();
        self.mocks.push(mock);
        self
    }
}
