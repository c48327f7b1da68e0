//! Circuit-broken client for the upstream full node.
//!
//! The client wraps a JSON-RPC-over-HTTP handle behind the breaker of
//! [`super::breaker`]. The handle lives under a mutex that is held only
//! across reads and swaps; when the circuit opens the handle is dropped, and
//! the half-open trial re-establishes it before the trial call flows.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cid::Cid;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    breaker::{AdmitError, Admitted, Breaker, BreakerConfig, BreakerState, Completion},
    errors::UpstreamError,
};
use crate::chain::lotus_json;

/// One JSON-RPC connection to the node. Cloning shares the underlying HTTP
/// connection pool and request-id counter.
#[derive(Clone)]
pub struct RpcHandle {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    next_id: Arc<AtomicU64>,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcHandle {
    /// Issues one JSON-RPC call and returns the raw result value.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::InvalidResponse(format!("http status {status}")));
        }
        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        if let Some(err) = envelope.error {
            return Err(UpstreamError::from_rpc(err.code, err.message));
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }
}

/// Circuit-broken upstream client. A drop-in for the node's own API surface:
/// the node cache tier and the RPC proxy both call through it.
pub struct NodeClient {
    endpoint: String,
    token: Option<String>,
    http: reqwest::Client,
    breaker: Breaker,
    // Guards the handle only; held across pointer reads and swaps, never I/O.
    handle: Mutex<Option<RpcHandle>>,
}

impl NodeClient {
    pub fn new(
        endpoint: String,
        token: Option<String>,
        breaker: BreakerConfig,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self {
            endpoint,
            token,
            http,
            breaker: Breaker::new(breaker),
            handle: Mutex::new(None),
        })
    }

    /// Builds a fresh handle and probes it with `Filecoin.Version`. On probe
    /// failure the client stays disconnected; the breaker's recovery path
    /// retries later.
    pub async fn connect(&self) {
        let handle = RpcHandle {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            token: self.token.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        match handle.call("Filecoin.Version", json!([])).await {
            Ok(_) => {
                tracing::info!(endpoint = %self.endpoint, "connected to node");
                *self.handle.lock() = Some(handle);
            }
            Err(e) => {
                tracing::error!(endpoint = %self.endpoint, error = %e, "connecting to node");
                *self.handle.lock() = None;
            }
        }
    }

    /// Drops the connection. Idempotent; safe to race with breaker events.
    pub fn close(&self) {
        *self.handle.lock() = None;
    }

    /// True when a handle is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.lock().is_some()
    }

    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// The single call gate: admit through the breaker, take the handle,
    /// run `f`, resolve the breaker with the outcome.
    pub async fn with_api<T, F, Fut>(&self, f: F) -> Result<T, UpstreamError>
    where
        F: FnOnce(RpcHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let admitted = match self.breaker.try_admit() {
            Ok(admitted) => admitted,
            Err(AdmitError::Concurrency { tripped }) => {
                if tripped {
                    self.close();
                }
                return Err(UpstreamError::Unavailable);
            }
            Err(AdmitError::Open) => return Err(UpstreamError::Unavailable),
        };

        // The reset hook: an admitted trial re-establishes the handle
        // before the trial call flows.
        if matches!(admitted, Admitted::Trial(_)) {
            self.connect().await;
        }
        let token = admitted.into_token();

        let api = self.handle.lock().clone();
        let Some(api) = api else {
            if let Completion::Opened(_) = self.breaker.abandon(token) {
                self.close();
            }
            return Err(UpstreamError::Unavailable);
        };

        metrics::counter!("upstream_requests_total").increment(1);
        let result = f(api).await;
        let ok = match &result {
            Ok(_) => true,
            Err(e) => !e.counts_as_breaker_failure(),
        };
        if !ok {
            metrics::counter!("upstream_failures_total").increment(1);
        }
        match self.breaker.complete(token, ok) {
            Completion::Opened(reason) => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    reason = reason.as_str(),
                    "disconnecting from node"
                );
                self.close();
            }
            Completion::Closed | Completion::Noop => {}
        }
        if let Err(e) = &result {
            if e.counts_as_breaker_failure() {
                tracing::debug!(error = %e, "upstream call failed");
            }
        }
        result
    }

    pub async fn version(&self) -> Result<Value, UpstreamError> {
        self.with_api(|api| async move { api.call("Filecoin.Version", json!([])).await }).await
    }

    pub async fn chain_head(&self) -> Result<Value, UpstreamError> {
        self.with_api(|api| async move { api.call("Filecoin.ChainHead", json!([])).await }).await
    }

    pub async fn chain_has_obj(&self, c: &Cid) -> Result<bool, UpstreamError> {
        let params = json!([lotus_json::cid(c)]);
        let value = self
            .with_api(|api| async move { api.call("Filecoin.ChainHasObj", params).await })
            .await?;
        value
            .as_bool()
            .ok_or_else(|| UpstreamError::InvalidResponse(format!("expected bool, got {value}")))
    }

    /// Reads the raw bytes of the object addressed by `c`. The node returns
    /// byte payloads base64-encoded in the JSON result.
    pub async fn chain_read_obj(&self, c: &Cid) -> Result<Vec<u8>, UpstreamError> {
        let params = json!([lotus_json::cid(c)]);
        let value = self
            .with_api(|api| async move { api.call("Filecoin.ChainReadObj", params).await })
            .await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| UpstreamError::InvalidResponse(format!("expected string, got {value}")))?;
        BASE64
            .decode(encoded)
            .map_err(|e| UpstreamError::InvalidResponse(format!("base64 payload: {e}")))
    }

    /// Forwards an arbitrary method verbatim, params and result untouched.
    pub async fn forward(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let method = method.to_string();
        self.with_api(|api| async move { api.call(&method, params).await }).await
    }
}
