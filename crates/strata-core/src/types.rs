//! JSON-RPC 2.0 protocol types and the proxy's method tables.

use std::{borrow::Cow, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Methods answered from the cache chain (or composed from cached
/// primitives) without a round trip to the node on the warm path.
pub const CACHED_METHODS: &[&str] = &[
    "Filecoin.ChainReadObj",
    "Filecoin.ChainHasObj",
    "Filecoin.ChainGetBlock",
    "Filecoin.ChainGetTipSet",
    "Filecoin.GetTipSetFromKey",
];

/// Methods passed verbatim to the upstream client.
pub const FORWARDED_METHODS: &[&str] = &[
    "Filecoin.AuthVerify",
    "Filecoin.AuthNew",
    "Filecoin.Version",
    "Filecoin.ChainNotify",
    "Filecoin.ChainHead",
    "Filecoin.ChainGetBlockMessages",
    "Filecoin.ChainGetParentReceipts",
    "Filecoin.ChainGetParentMessages",
    "Filecoin.ChainGetTipSetByHeight",
    "Filecoin.ChainStatObj",
    "Filecoin.ChainGetGenesis",
    "Filecoin.ChainTipSetWeight",
    "Filecoin.ChainGetNode",
    "Filecoin.ChainGetMessage",
    "Filecoin.ChainGetPath",
    "Filecoin.StateChangedActors",
    "Filecoin.StateGetReceipt",
    "Filecoin.StateListMiners",
    "Filecoin.StateListActors",
    "Filecoin.StateGetActor",
    "Filecoin.StateReadState",
    "Filecoin.StateMinerSectors",
    "Filecoin.StateMinerPower",
    "Filecoin.StateVMCirculatingSupplyInternal",
];

#[must_use]
pub fn is_method_allowed(method: &str) -> bool {
    CACHED_METHODS.contains(&method) || FORWARDED_METHODS.contains(&method)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Echoed back in the response; `Arc` keeps error paths allocation-free.
    #[serde(default)]
    pub id: Arc<Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(method: &str, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            method: method.to_string(),
            params,
            id: Arc::new(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Arc<Value>,
}

impl JsonRpcResponse {
    #[must_use]
    pub fn result(id: Arc<Value>, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(id: Arc<Value>, code: i64, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
            id,
        }
    }
}
