//! Metrics bootstrap and the periodic stats reporter.
//!
//! Hot-path series are recorded through the lock-free `metrics` facade at
//! the call sites (tiers, breaker, store gauges). This module installs the
//! Prometheus recorder once per process and runs the reporter task that logs
//! per-tier aggregates and refreshes the store health gauges on a fixed
//! interval. Reporting is best-effort: nothing here sits on the serving
//! path.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use metrics_exporter_prometheus::PrometheusBuilder;
pub use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{cache::BlockTier, store::Store};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder, falling back to a detached
/// recorder when another was installed first (tests share a process).
pub fn install_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "prometheus recorder already installed, using fallback");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// Interval between reporter wake-ups.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Wakes on a fixed interval, logs aggregated per-tier counters, and
/// exports last-value gauges for the persistent store.
pub struct StatsReporter {
    tiers: Vec<Arc<dyn BlockTier>>,
    store: Option<Arc<Store>>,
    interval: Duration,
}

impl StatsReporter {
    #[must_use]
    pub fn new(tiers: Vec<Arc<dyn BlockTier>>, store: Option<Arc<Store>>) -> Self {
        Self { tiers, store, interval: REPORT_INTERVAL }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs the reporter until the shutdown channel fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the first
            // report carries a full interval of traffic.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.report(),
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("stats reporter stopped");
        })
    }

    fn report(&self) {
        for tier in &self.tiers {
            let snap = tier.counters().snapshot();
            if snap.requests() == 0 {
                continue;
            }
            tracing::debug!(
                cache = tier.name(),
                requests = snap.requests(),
                hits = snap.hits,
                misses = snap.misses,
                errors = snap.errors,
                hit_rate = format!("{:.2}", snap.hit_rate()),
                "cache stats"
            );
        }
        if let Some(store) = &self.store {
            let records = store.record_count();
            let rate = store.write_rate();
            metrics::gauge!("store_record_count").set(records as f64);
            metrics::gauge!("store_write_rate_bytes").set(rate);
            tracing::debug!(records, write_rate = format!("{rate:.0}"), "store stats");
        }
    }
}
