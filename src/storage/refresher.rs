//! Background refresher
//!
//! Keeps hot content fresh without an upstream stampede. A producer samples
//! random shards at the scan rate and runs each sampled entry through the
//! β-expiration test; candidates go onto a bounded work channel. A consumer
//! takes one upstream token per candidate and revalidates it in an isolated
//! task. Errors are counted and swallowed: the stale entry stays served and
//! a later sampling round may pick it again. The per-entry single-flight
//! guard is claimed before enqueueing, so a slow revalidation can never pile
//! up duplicates for the same entry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::metrics::CacheMetrics;
use crate::model::Response;
use crate::rate::RateLimiter;
use crate::shutdown::Shutdown;
use crate::storage::balancer::Balancer;

/// Background refresh loops
pub struct Refresher {
    cfg: Arc<Config>,
    balancer: Arc<Balancer>,
    metrics: Arc<CacheMetrics>,
}

impl Refresher {
    pub fn new(
        cfg: Arc<Config>,
        balancer: Arc<Balancer>,
        metrics: Arc<CacheMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self { cfg, balancer, metrics })
    }

    /// Start the producer, consumer, and stats logger. A zero scan or
    /// upstream rate disables refreshing entirely.
    pub fn spawn(self: Arc<Self>, shutdown: Shutdown) {
        let refresh = &self.cfg.cache.refresh;
        if refresh.scan_rate == 0 || refresh.rate == 0 {
            info!("refresher disabled (zero scan_rate or rate)");
            return;
        }

        let scan_limiter = RateLimiter::new(refresh.scan_rate, shutdown.clone());
        let upstream_limiter = RateLimiter::new(refresh.rate, shutdown.clone());
        let (work_tx, work_rx) = mpsc::channel(refresh.rate.max(1) as usize);

        Arc::clone(&self).spawn_producer(scan_limiter, work_tx, shutdown.clone());
        Arc::clone(&self).spawn_consumer(upstream_limiter, work_rx, shutdown.clone());
        self.spawn_logger(shutdown);
    }

    /// Sample entries at the scan rate and enqueue refresh candidates.
    fn spawn_producer(
        self: Arc<Self>,
        scan_limiter: Arc<RateLimiter>,
        work_tx: mpsc::Sender<Arc<Response>>,
        shutdown: Shutdown,
    ) {
        let refresher = self;
        tokio::spawn(async move {
            debug!("refresher producer started");
            loop {
                if !scan_limiter.acquire(&shutdown).await {
                    debug!("refresher producer stopped");
                    return;
                }

                let Some(candidate) = refresher.balancer.rand_node().sample() else {
                    continue;
                };
                if !candidate.should_be_refreshed() {
                    continue;
                }
                if !candidate.try_begin_refresh() {
                    continue;
                }

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        candidate.end_refresh();
                        return;
                    }
                    sent = work_tx.send(Arc::clone(&candidate)) => {
                        if sent.is_err() {
                            candidate.end_refresh();
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Revalidate queued candidates, one upstream token each.
    fn spawn_consumer(
        self: Arc<Self>,
        upstream_limiter: Arc<RateLimiter>,
        mut work_rx: mpsc::Receiver<Arc<Response>>,
        shutdown: Shutdown,
    ) {
        let refresher = self;
        tokio::spawn(async move {
            debug!("refresher consumer started");
            loop {
                let entry = tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("refresher consumer stopped");
                        return;
                    }
                    entry = work_rx.recv() => match entry {
                        Some(entry) => entry,
                        None => return,
                    },
                };

                if !upstream_limiter.acquire(&shutdown).await {
                    entry.end_refresh();
                    return;
                }

                // Isolated task per revalidation: a slow upstream must not
                // stall consumption of the queue.
                let metrics = Arc::clone(&refresher.metrics);
                tokio::spawn(async move {
                    match entry.revalidate().await {
                        Ok(()) => metrics.record_refresh_ok(),
                        Err(err) => {
                            metrics.record_refresh_error();
                            debug!(%err, key = entry.map_key(), "revalidation failed");
                        }
                    }
                    entry.end_refresh();
                });
            }
        });
    }

    /// Periodic refreshed/errored line, every 5 s while stats logging is on.
    fn spawn_logger(&self, shutdown: Shutdown) {
        if !self.cfg.cache.logs.stats {
            return;
        }
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let mut last_ok = metrics.refresh_ok();
            let mut last_err = metrics.refresh_errors();
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        let ok = metrics.refresh_ok();
                        let errors = metrics.refresh_errors();
                        if ok != last_ok || errors != last_err {
                            info!(
                                refreshed = ok - last_ok,
                                errors = errors - last_err,
                                "refreshed in the last 5s"
                            );
                            last_ok = ok;
                            last_err = errors;
                        }
                    }
                }
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
