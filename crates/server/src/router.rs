//! HTTP handlers: the JSON-RPC endpoint and the diagnostics surface.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::Value;
use strata_core::{
    types::{JsonRpcRequest, JsonRpcResponse},
    upstream::BreakerState,
};
use tracing::debug;

use crate::AppState;

/// Handles JSON-RPC requests, single or batched. Batch items run
/// concurrently with response order preserved.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    match payload {
        Value::Array(items) => {
            debug!(batch_size = items.len(), "batched rpc request");
            let futures = items.into_iter().map(|item| handle_item(state.clone(), item));
            let responses: Vec<Value> = futures::future::join_all(futures).await;
            Json(Value::Array(responses))
        }
        item => Json(handle_item(state, item).await),
    }
}

async fn handle_item(state: Arc<AppState>, item: Value) -> Value {
    let id = item.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = match serde_json::from_value(item) {
        Ok(request) => request,
        Err(e) => {
            let response = JsonRpcResponse::error(
                Arc::new(id),
                -32700,
                format!("parse error: {e}"),
            );
            return serde_json::to_value(response).unwrap_or(Value::Null);
        }
    };
    let response = state.proxy.handle(request).await;
    serde_json::to_value(response).unwrap_or(Value::Null)
}

pub async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.client.is_connected();
    let breaker = match state.client.breaker_state() {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half-open",
    };

    let caches: Vec<Value> = state
        .tiers
        .iter()
        .map(|tier| {
            let snap = tier.counters().snapshot();
            serde_json::json!({
                "name": tier.name(),
                "requests": snap.requests(),
                "hits": snap.hits,
                "misses": snap.misses,
                "errors": snap.errors,
            })
        })
        .collect();

    let health = serde_json::json!({
        "status": if connected { "healthy" } else { "unhealthy" },
        "upstream": { "connected": connected, "breaker": breaker },
        "caches": caches,
        "store": state.store.as_ref().map(|s| serde_json::json!({
            "records": s.record_count(),
        })),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    (
        if connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE },
        [("content-type", "application/json")],
        health.to_string(),
    )
}
