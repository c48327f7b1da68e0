//! The composition root.
//!
//! Owns every long-lived resource: the circuit-broken client, the persistent
//! store, the cache chain, the proxy, and the stats reporter. Construction
//! is bottom-up so upstreams exist before their dependents; shutdown fans
//! out through a broadcast channel and closes resources in reverse.

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    cache::{assemble, BlockTier, CacheError},
    config::AppConfig,
    metrics::StatsReporter,
    proxy::Proxy,
    store::{Store, StoreError},
    upstream::{NodeClient, UpstreamError},
};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("open block store: {0}")]
    Store(#[from] StoreError),

    #[error("upstream client: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("assemble cache chain: {0}")]
    Cache(#[from] CacheError),
}

pub struct Runtime {
    pub client: Arc<NodeClient>,
    pub proxy: Arc<Proxy>,
    /// Every tier, outermost first, for the reporter and diagnostics.
    pub tiers: Vec<Arc<dyn BlockTier>>,
    pub store: Option<Arc<Store>>,
    shutdown: broadcast::Sender<()>,
}

impl Runtime {
    /// Builds the full object graph and starts the stats reporter. The
    /// initial upstream connection is attempted here but a node that is
    /// down does not fail construction: the breaker's recovery path keeps
    /// retrying.
    pub async fn build(config: &AppConfig) -> Result<Self, RuntimeError> {
        let client = Arc::new(NodeClient::new(
            config.api_endpoint()?,
            config.api_token(),
            config.breaker_config(),
        )?);
        client.connect().await;

        let store = match config.store_path() {
            Some(path) => Some(Store::open_or_create(Path::new(path))?),
            None => None,
        };

        let chain = assemble(client.clone(), config.blockstore_baseurl(), store.clone())?;
        let proxy = Arc::new(Proxy::new(client.clone(), chain.top.clone()));

        let (shutdown, _) = broadcast::channel(1);
        let _reporter =
            StatsReporter::new(chain.tiers.clone(), store.clone()).spawn(shutdown.subscribe());

        Ok(Self { client, proxy, tiers: chain.tiers, store, shutdown })
    }

    /// A receiver for tasks that should stop with the runtime.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stops the reporter, disconnects from the node, and flushes the
    /// store. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.client.close();
        if let Some(store) = &self.store {
            if let Err(e) = store.close() {
                tracing::error!(error = %e, "closing block store");
            }
        }
        tracing::info!("runtime stopped");
    }
}
