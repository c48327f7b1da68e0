//! The RPC method proxy.
//!
//! Each supported `Filecoin.*` method has one of three dispositions: served
//! from the cache chain, composed locally from cached primitives, or
//! forwarded verbatim to the circuit-broken upstream client. The cached
//! object reads trade consistency for availability: on a cache error they
//! fall back to asking the node directly, which is always as valid as any
//! cached answer because the content is immutable.

use std::{sync::Arc, time::Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cid::Cid;
use serde_json::Value;
use thiserror::Error;

use crate::{
    cache::{BlockTier, CacheError},
    chain::{lotus_json, BlockHeader, ChainError, TipSet, TipSetKey},
    types::{is_method_allowed, JsonRpcRequest, JsonRpcResponse},
    upstream::{NodeClient, UpstreamError},
};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not supported: {0}")]
    MethodNotSupported(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl ProxyError {
    /// JSON-RPC error code for the response object.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => -32602,
            Self::MethodNotSupported(_) => -32601,
            _ => -32603,
        }
    }
}

/// Holds the top of the cache chain and the upstream client; both are fixed
/// at construction.
pub struct Proxy {
    client: Arc<NodeClient>,
    cache: Arc<dyn BlockTier>,
}

impl Proxy {
    #[must_use]
    pub fn new(client: Arc<NodeClient>, cache: Arc<dyn BlockTier>) -> Self {
        Self { client, cache }
    }

    /// Processes one request end to end, mapping failures onto JSON-RPC
    /// error objects.
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let method = request.method.clone();
        let id = request.id.clone();
        let started = Instant::now();

        let result = self.dispatch(&method, request.params.unwrap_or(Value::Null)).await;

        metrics::counter!("rpc_requests_total", "method" => method.clone()).increment(1);
        metrics::histogram!("rpc_request_duration_ms", "method" => method.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(value) => JsonRpcResponse::result(id, value),
            Err(e) => {
                metrics::counter!("rpc_request_errors_total", "method" => method.clone())
                    .increment(1);
                tracing::debug!(method, error = %e, "request failed");
                JsonRpcResponse::error(id, e.code(), e.to_string())
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ProxyError> {
        tracing::trace!(method, "dispatch");
        match method {
            "Filecoin.ChainReadObj" => self.chain_read_obj(&params).await,
            "Filecoin.ChainHasObj" => self.chain_has_obj(&params).await,
            "Filecoin.ChainGetBlock" => self.chain_get_block(&params).await,
            "Filecoin.ChainGetTipSet" => self.chain_get_tipset(&params).await,
            "Filecoin.GetTipSetFromKey" => self.get_tipset_from_key(&params).await,
            m if is_method_allowed(m) => Ok(self.client.forward(m, params).await?),
            other => Err(ProxyError::MethodNotSupported(other.to_string())),
        }
    }

    async fn chain_read_obj(&self, params: &Value) -> Result<Value, ProxyError> {
        let c = cid_param(params, 0)?;
        let data = match self.cache.get(&c).await {
            Ok(block) => block.into_data(),
            Err(CacheError::NotFound) => return Err(CacheError::NotFound.into()),
            Err(e) => {
                tracing::warn!(block = %c, error = %e, "cache get, falling back to node");
                self.client.chain_read_obj(&c).await?.into()
            }
        };
        Ok(Value::String(BASE64.encode(&data)))
    }

    async fn chain_has_obj(&self, params: &Value) -> Result<Value, ProxyError> {
        let c = cid_param(params, 0)?;
        match self.cache.has(&c).await {
            Ok(has) => Ok(Value::Bool(has)),
            Err(CacheError::NotFound) => Ok(Value::Bool(false)),
            Err(e) => {
                tracing::warn!(block = %c, error = %e, "cache has, falling back to node");
                Ok(Value::Bool(self.client.chain_has_obj(&c).await?))
            }
        }
    }

    async fn chain_get_block(&self, params: &Value) -> Result<Value, ProxyError> {
        let c = cid_param(params, 0)?;
        let header = self.header_from_cache(&c).await?;
        Ok(lotus_json::block_header(&header))
    }

    /// Realises a tipset by looking up each constituent block via the cache
    /// and assembling locally.
    async fn chain_get_tipset(&self, params: &Value) -> Result<Value, ProxyError> {
        let key = tipset_key_param(params, 0)?;
        Ok(lotus_json::tipset(&self.assemble_tipset(&key).await?))
    }

    async fn get_tipset_from_key(&self, params: &Value) -> Result<Value, ProxyError> {
        let key = tipset_key_param(params, 0)?;
        if key.is_empty() {
            // The empty key names the heaviest tipset, which only the node
            // knows.
            return Ok(self.client.chain_head().await?);
        }
        Ok(lotus_json::tipset(&self.assemble_tipset(&key).await?))
    }

    async fn assemble_tipset(&self, key: &TipSetKey) -> Result<TipSet, ProxyError> {
        let mut pairs = Vec::with_capacity(key.cids().len());
        for c in key.cids() {
            pairs.push((*c, self.header_from_cache(c).await?));
        }
        Ok(TipSet::new(pairs)?)
    }

    async fn header_from_cache(&self, c: &Cid) -> Result<BlockHeader, ProxyError> {
        let block = self.cache.get(c).await.map_err(|e| {
            tracing::debug!(block = %c, error = %e, "get header block from cache");
            e
        })?;
        Ok(BlockHeader::decode(block.data()).map_err(|e| {
            tracing::debug!(block = %c, error = %e, "decode block header");
            e
        })?)
    }
}

fn param_slot(params: &Value, index: usize) -> Result<&Value, ProxyError> {
    params
        .as_array()
        .and_then(|items| items.get(index))
        .ok_or_else(|| ProxyError::InvalidParams(format!("missing param {index}")))
}

fn cid_param(params: &Value, index: usize) -> Result<Cid, ProxyError> {
    lotus_json::cid_from(param_slot(params, index)?)
        .map_err(|e| ProxyError::InvalidParams(e.to_string()))
}

fn tipset_key_param(params: &Value, index: usize) -> Result<TipSetKey, ProxyError> {
    // A missing or null key is the empty key.
    let slot = match params.as_array().and_then(|items| items.get(index)) {
        Some(slot) => slot,
        None => return Ok(TipSetKey::default()),
    };
    lotus_json::tipset_key_from(slot).map_err(|e| ProxyError::InvalidParams(e.to_string()))
}
