//! Read-only tier backed by an HTTP object store that lays blocks out as
//! `{base}/{cid}/data.raw`. A 200 is a hit; any other status is a miss; a
//! transport failure counts as a tier error. Misses and errors alike fall
//! through to the upstream, and nothing is ever written back here.

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;

use super::{Block, BlockTier, CacheError, TierCounters};

pub struct HttpTier {
    base: String,
    http: reqwest::Client,
    upstream: Option<Arc<dyn BlockTier>>,
    counters: TierCounters,
}

impl HttpTier {
    pub fn new(base: &str) -> Result<Self, CacheError> {
        let base = if base.ends_with('/') { base.to_string() } else { format!("{base}/") };
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { base, http, upstream: None, counters: TierCounters::default() })
    }

    fn url(&self, c: &Cid) -> String {
        format!("{}{}/data.raw", self.base, c)
    }
}

#[async_trait]
impl BlockTier for HttpTier {
    fn name(&self) -> &'static str {
        "http"
    }

    fn counters(&self) -> &TierCounters {
        &self.counters
    }

    fn set_upstream(&mut self, upstream: Arc<dyn BlockTier>) {
        self.upstream = Some(upstream);
    }

    async fn has(&self, c: &Cid) -> Result<bool, CacheError> {
        let url = self.url(c);
        tracing::trace!(block = %c, url, "http has");
        let response = match self.http.head(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.counters.error();
                tracing::trace!(block = %c, error = %e, "http has failed");
                let Some(upstream) = &self.upstream else {
                    return Err(e.into());
                };
                return upstream.has(c).await;
            }
        };
        if response.status().as_u16() == 200 {
            self.counters.hit();
            return Ok(true);
        }
        self.counters.miss();
        let Some(upstream) = &self.upstream else {
            return Ok(false);
        };
        upstream.has(c).await
    }

    async fn get(&self, c: &Cid) -> Result<Block, CacheError> {
        let url = self.url(c);
        tracing::trace!(block = %c, url, "http get");
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.counters.error();
                metrics::counter!("cache_get_failures_total", "cache" => "http").increment(1);
                tracing::trace!(block = %c, error = %e, "http get failed");
                let Some(upstream) = &self.upstream else {
                    return Err(e.into());
                };
                return upstream.get(c).await;
            }
        };
        let status = response.status().as_u16();
        if status == 200 {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    self.counters.error();
                    metrics::counter!("cache_get_failures_total", "cache" => "http").increment(1);
                    let Some(upstream) = &self.upstream else {
                        return Err(e.into());
                    };
                    return upstream.get(c).await;
                }
            };
            self.counters.hit();
            metrics::counter!("cache_get_hits_total", "cache" => "http").increment(1);
            metrics::histogram!("cache_get_size_bytes", "cache" => "http")
                .record(body.len() as f64);
            // The block host is a verified store: bytes are trusted as-is.
            return Ok(Block::with_cid(body, *c));
        }
        tracing::trace!(block = %c, http_status = status, "http get missed");
        self.counters.miss();
        metrics::counter!("cache_get_misses_total", "cache" => "http").increment(1);
        let Some(upstream) = &self.upstream else {
            return Err(CacheError::NotFound);
        };
        upstream.get(c).await
    }
}
