//! strata — a caching read proxy for Filecoin full nodes.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    serve, Router,
};
use strata_core::{
    cache::BlockTier,
    config::{AppConfig, LOG_LEVEL_DIAGNOSTICS, LOG_LEVEL_INFO, LOG_LEVEL_OFF},
    metrics::PrometheusHandle,
    proxy::Proxy,
    runtime::Runtime,
    store::Store,
    upstream::NodeClient,
};
use tokio::signal;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod router;

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub proxy: Arc<Proxy>,
    pub client: Arc<NodeClient>,
    pub tiers: Vec<Arc<dyn BlockTier>>,
    pub store: Option<Arc<Store>>,
    pub metrics: PrometheusHandle,
}

fn init_logging(config: &AppConfig) {
    let filter = if let Ok(env_filter) = std::env::var("RUST_LOG") {
        EnvFilter::new(env_filter)
    } else {
        match config.log_level {
            LOG_LEVEL_OFF => EnvFilter::new("off"),
            LOG_LEVEL_INFO => EnvFilter::new("warn,strata_core=info,strata=info,server=info"),
            LOG_LEVEL_DIAGNOSTICS => {
                EnvFilter::new("warn,strata_core=debug,strata=debug,server=debug")
            }
            _ => EnvFilter::new("warn,strata_core=trace,strata=trace,server=trace"),
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()
        .map_err(|e| anyhow::anyhow!("configuration: {e}"))?;
    init_logging(&config);

    let metrics = strata_core::metrics::install_recorder();

    let runtime = Runtime::build(&config)
        .await
        .map_err(|e| anyhow::anyhow!("startup: {e}"))?;

    let state = Arc::new(AppState {
        proxy: runtime.proxy.clone(),
        client: runtime.client.clone(),
        tiers: runtime.tiers.clone(),
        store: runtime.store.clone(),
        metrics,
    });

    let rpc_app = Router::new()
        .route("/rpc/v0", post(router::handle_rpc))
        .with_state(state.clone())
        // Block payloads are bounded; oversized request bodies are refused
        // before they reach the parser.
        .layer(RequestBodyLimitLayer::new(8 * 1024 * 1024));

    let listen_addr = config.listen_addr().map_err(|e| anyhow::anyhow!("{e}"))?;
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(address = %listen_addr, "rpc server listening");
    let rpc_server = serve(listener, rpc_app);

    let diag_addr = config.diag_addr().map_err(|e| anyhow::anyhow!("{e}"))?;
    if let Some(diag_addr) = diag_addr {
        let diag_app = Router::new()
            .route("/metrics", get(router::handle_metrics))
            .route("/health", get(router::handle_health))
            .with_state(state);

        let diag_listener = tokio::net::TcpListener::bind(diag_addr).await?;
        info!(address = %diag_addr, "diagnostics server listening");
        let diag_server = serve(diag_listener, diag_app);

        tokio::select! {
            result = rpc_server.with_graceful_shutdown(shutdown_signal()) => {
                if let Err(e) = result {
                    error!(error = %e, "rpc server error");
                }
            }
            result = diag_server.with_graceful_shutdown(shutdown_signal()) => {
                if let Err(e) = result {
                    error!(error = %e, "diagnostics server error");
                }
            }
        }
    } else if let Err(e) = rpc_server.with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "rpc server error");
    }

    runtime.shutdown();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "installing ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "installing sigterm handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
