//! Read-write tier over the append-only local store.
//!
//! Misses fill from the upstream. Because the store has no delete and no
//! repair path, the fill verifies the upstream's bytes against the requested
//! CID *before* insert; once a record is in, reads trust it without
//! re-verifying. Zero-length blocks are served but never inserted (the store
//! cannot represent them), and a losing insert race is benign.

use std::{io::Read, sync::Arc, time::Instant};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

use super::{Block, BlockTier, CacheError, TierCounters};
use crate::{
    block,
    store::{Store, StoreError},
};

pub struct DiskTier {
    store: Arc<Store>,
    upstream: Option<Arc<dyn BlockTier>>,
    counters: TierCounters,
}

impl DiskTier {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, upstream: None, counters: TierCounters::default() }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Retrieves the block from the upstream and opportunistically persists
    /// it. The caller always receives the bytes when the upstream produced
    /// them, even if persisting failed.
    async fn fill(&self, c: &Cid) -> Result<Bytes, CacheError> {
        metrics::counter!("cache_fill_requests_total", "cache" => "disk").increment(1);
        let started = Instant::now();

        let Some(upstream) = &self.upstream else {
            metrics::counter!("cache_fill_failures_total", "cache" => "disk").increment(1);
            return Err(CacheError::NotFound);
        };

        let blk = match upstream.get(c).await {
            Ok(blk) => blk,
            Err(e) => {
                metrics::counter!("cache_fill_failures_total", "cache" => "disk").increment(1);
                tracing::info!(block = %c, error = %e, "upstream get during fill");
                return Err(e);
            }
        };
        let data = blk.into_data();

        // The store cannot represent zero-length values. Serving without
        // inserting is safe: the next request refills at negligible cost.
        if data.is_empty() {
            metrics::counter!("cache_fill_zero_total", "cache" => "disk").increment(1);
            return Ok(data);
        }

        // Verify before insert: a poisoned record could never be removed.
        let computed = match block::recompute_cid(c, &data) {
            Ok(computed) => computed,
            Err(e) => {
                metrics::counter!("cache_fill_failures_total", "cache" => "disk").increment(1);
                tracing::info!(block = %c, error = %e, "compute block hash during fill");
                return Err(e.into());
            }
        };
        if computed != *c {
            metrics::counter!("cache_fill_failures_total", "cache" => "disk").increment(1);
            tracing::info!(block = %c, computed = %computed, "wrong block hash from upstream");
            return Err(CacheError::WrongHash { expected: *c, computed });
        }

        match self.store.insert(&block::digest_key(c), &data) {
            Ok(()) => {
                metrics::counter!("cache_fill_success_total", "cache" => "disk").increment(1);
                metrics::histogram!("cache_fill_size_bytes", "cache" => "disk")
                    .record(data.len() as f64);
                metrics::histogram!("cache_fill_duration_ms", "cache" => "disk")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
            }
            // A concurrent fill won the race; the record is equal by
            // construction.
            Err(StoreError::KeyExists) => {}
            Err(e) => {
                // The read must not fail because the cache could not
                // persist. Counts as neither fill-success nor fill-failure.
                tracing::warn!(block = %c, error = %e, "insert into block store");
            }
        }
        Ok(data)
    }
}

#[async_trait]
impl BlockTier for DiskTier {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn counters(&self) -> &TierCounters {
        &self.counters
    }

    fn set_upstream(&mut self, upstream: Arc<dyn BlockTier>) {
        self.upstream = Some(upstream);
    }

    async fn has(&self, c: &Cid) -> Result<bool, CacheError> {
        if self.store.contains(&block::digest_key(c)) {
            self.counters.hit();
            return Ok(true);
        }
        match self.fill(c).await {
            Ok(_) => {
                self.counters.miss();
                Ok(true)
            }
            Err(CacheError::NotFound) => {
                self.counters.miss();
                Err(CacheError::NotFound)
            }
            Err(e) => {
                self.counters.error();
                Err(e)
            }
        }
    }

    async fn get(&self, c: &Cid) -> Result<Block, CacheError> {
        metrics::counter!("cache_get_requests_total", "cache" => "disk").increment(1);
        let started = Instant::now();

        match self.store.fetch(&block::digest_key(c)) {
            Ok(mut reader) => {
                let mut buf = Vec::with_capacity(reader.len());
                if let Err(e) = reader.read_to_end(&mut buf) {
                    self.counters.error();
                    metrics::counter!("cache_get_failures_total", "cache" => "disk").increment(1);
                    return Err(e.into());
                }
                self.counters.hit();
                metrics::counter!("cache_get_hits_total", "cache" => "disk").increment(1);
                metrics::histogram!("cache_get_size_bytes", "cache" => "disk")
                    .record(buf.len() as f64);
                metrics::histogram!("cache_get_duration_ms", "cache" => "disk")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                // Verified on fill; trusted on read.
                Ok(Block::with_cid(buf.into(), *c))
            }
            Err(StoreError::NotFound) => match self.fill(c).await {
                Ok(data) => {
                    self.counters.miss();
                    metrics::counter!("cache_get_misses_total", "cache" => "disk").increment(1);
                    metrics::histogram!("cache_get_size_bytes", "cache" => "disk")
                        .record(data.len() as f64);
                    Ok(Block::with_cid(data, *c))
                }
                Err(CacheError::NotFound) => {
                    self.counters.miss();
                    metrics::counter!("cache_get_misses_total", "cache" => "disk").increment(1);
                    Err(CacheError::NotFound)
                }
                Err(e) => {
                    self.counters.error();
                    metrics::counter!("cache_get_failures_total", "cache" => "disk").increment(1);
                    Err(e)
                }
            },
            Err(e) => {
                // A store read error still lets the upstream satisfy the
                // request.
                tracing::warn!(block = %c, error = %e, "block store fetch");
                match self.fill(c).await {
                    Ok(data) => {
                        self.counters.miss();
                        metrics::counter!("cache_get_misses_total", "cache" => "disk")
                            .increment(1);
                        Ok(Block::with_cid(data, *c))
                    }
                    Err(e) => {
                        self.counters.error();
                        metrics::counter!("cache_get_failures_total", "cache" => "disk")
                            .increment(1);
                        Err(e)
                    }
                }
            }
        }
    }
}
