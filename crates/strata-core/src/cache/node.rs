//! Leaf tier backed by the circuit-broken node client. The node is the
//! authoritative fallback: it never has an upstream of its own, and blocks
//! it returns are not re-verified.

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;

use super::{Block, BlockTier, CacheError, TierCounters};
use crate::upstream::{NodeClient, UpstreamError};

pub struct NodeTier {
    client: Arc<NodeClient>,
    counters: TierCounters,
}

impl NodeTier {
    #[must_use]
    pub fn new(client: Arc<NodeClient>) -> Self {
        Self { client, counters: TierCounters::default() }
    }
}

#[async_trait]
impl BlockTier for NodeTier {
    fn name(&self) -> &'static str {
        "node"
    }

    fn counters(&self) -> &TierCounters {
        &self.counters
    }

    fn set_upstream(&mut self, _upstream: Arc<dyn BlockTier>) {
        panic!("the node tier is the end of the chain and cannot take an upstream");
    }

    async fn has(&self, c: &Cid) -> Result<bool, CacheError> {
        tracing::trace!(block = %c, "node has");
        match self.client.chain_has_obj(c).await {
            Ok(true) => {
                self.counters.hit();
                Ok(true)
            }
            Ok(false) => {
                self.counters.miss();
                Ok(false)
            }
            Err(UpstreamError::NotFound) => {
                self.counters.miss();
                Err(CacheError::NotFound)
            }
            Err(e) => {
                self.counters.error();
                tracing::trace!(block = %c, error = %e, "node has failed");
                Err(e.into())
            }
        }
    }

    async fn get(&self, c: &Cid) -> Result<Block, CacheError> {
        tracing::trace!(block = %c, "node get");
        match self.client.chain_read_obj(c).await {
            Ok(data) => {
                self.counters.hit();
                metrics::counter!("cache_get_hits_total", "cache" => "node").increment(1);
                metrics::histogram!("cache_get_size_bytes", "cache" => "node")
                    .record(data.len() as f64);
                Ok(Block::with_cid(data.into(), *c))
            }
            Err(UpstreamError::NotFound) => {
                self.counters.miss();
                metrics::counter!("cache_get_misses_total", "cache" => "node").increment(1);
                Err(CacheError::NotFound)
            }
            Err(e) => {
                self.counters.error();
                metrics::counter!("cache_get_failures_total", "cache" => "node").increment(1);
                tracing::trace!(block = %c, error = %e, "node get failed");
                Err(e.into())
            }
        }
    }
}
