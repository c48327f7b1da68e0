//! The layered block cache.
//!
//! Tiers satisfy one contract ([`BlockTier`]) and compose into a fallback
//! chain: the outermost tier is consulted first, and a miss (or tier-local
//! error) falls through to the tier's upstream. Writable tiers fill
//! themselves from what the upstream returned. The chain is wired bottom-up
//! at startup and never changes afterwards.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use cid::Cid;
use thiserror::Error;

use crate::{
    block::{Block, BlockError},
    store::{Store, StoreError},
    upstream::{NodeClient, UpstreamError},
};

pub mod disk;
pub mod http;
pub mod node;

pub use disk::DiskTier;
pub use http::HttpTier;
pub use node::NodeTier;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The block is absent at this tier and there is no upstream left to ask.
    #[error("block not found")]
    NotFound,

    /// A fill integrity check failed: the bytes the upstream returned do not
    /// hash to the requested CID. Never cached.
    #[error("wrong block hash: requested {expected}, computed {computed}")]
    WrongHash { expected: Cid, computed: Cid },

    #[error(transparent)]
    Digest(#[from] BlockError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("http transfer: {0}")]
    Http(#[from] reqwest::Error),

    #[error("block store: {0}")]
    Store(#[from] StoreError),

    #[error("read stored block: {0}")]
    StoreRead(#[from] std::io::Error),
}

/// Per-tier counter triple. Every request to a tier increments exactly one
/// of the three.
#[derive(Debug, Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl TierCounters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl CounterSnapshot {
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.hits + self.misses + self.errors
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.requests();
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// One layer of the fallback chain.
#[async_trait]
pub trait BlockTier: Send + Sync {
    /// Tier tag used in logs and metric labels.
    fn name(&self) -> &'static str;

    fn counters(&self) -> &TierCounters;

    /// One-shot wiring, called during chain assembly before the tier serves
    /// any request. The upstream is immutable afterwards.
    fn set_upstream(&mut self, upstream: Arc<dyn BlockTier>);

    /// Whether this tier can produce the block. A tier that would fall
    /// through to its upstream on `get` forwards `has` the same way.
    async fn has(&self, c: &Cid) -> Result<bool, CacheError>;

    /// Returns the block, filling from the upstream on a miss where the
    /// tier supports it.
    async fn get(&self, c: &Cid) -> Result<Block, CacheError>;
}

/// The assembled chain: `top` is what the proxy queries, `tiers` keeps every
/// layer reachable for the stats reporter (outermost first).
pub struct CacheChain {
    pub top: Arc<dyn BlockTier>,
    pub tiers: Vec<Arc<dyn BlockTier>>,
}

/// Builds the chain bottom-up: node, then the optional HTTP tier in front of
/// it, then the optional local tier in front of everything. Each tier is
/// wired to the previous one before it is frozen behind `Arc`.
pub fn assemble(
    client: Arc<NodeClient>,
    http_base: Option<&str>,
    store: Option<Arc<Store>>,
) -> Result<CacheChain, CacheError> {
    let mut tiers: Vec<Arc<dyn BlockTier>> = vec![Arc::new(NodeTier::new(client))];

    if let Some(base) = http_base {
        let mut tier = HttpTier::new(base)?;
        tier.set_upstream(tiers.last().expect("node tier present").clone());
        tracing::info!(base_url = base, "added http block tier");
        tiers.push(Arc::new(tier));
    }

    if let Some(store) = store {
        let mut tier = DiskTier::new(store);
        tier.set_upstream(tiers.last().expect("tier present").clone());
        tracing::info!("added local block tier");
        tiers.push(Arc::new(tier));
    }

    let top = tiers.last().expect("chain is never empty").clone();
    // Reporter walks outermost-first.
    tiers.reverse();
    Ok(CacheChain { top, tiers })
}
