//! Background evictor
//!
//! Every 500 ms, while the fresh memory total sits at or above the
//! threshold, the evictor walks the pressure list from the most loaded shard
//! and drains entries off the tail of each shard's recency list. The
//! pressure ordering is re-sorted only after a bounded share of the shards
//! has been visited, which caps the sort cost per pass while keeping the
//! walk roughly weight-ordered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::metrics::CacheMetrics;
use crate::shutdown::Shutdown;
use crate::storage::balancer::Balancer;
use crate::storage::Storage;
use crate::SHARD_COUNT;

/// Pressure-list prefix visited between rebalances (17% of the shards)
const REBALANCE_EVERY: usize = SHARD_COUNT as usize * 17 / 100;

const TICK: Duration = Duration::from_millis(500);

/// Statistics for one eviction batch
#[derive(Debug, Clone, Copy)]
struct EvictionStat {
    items: u64,
    freed: i64,
}

/// Background eviction loop
pub struct Evictor {
    cfg: Arc<Config>,
    storage: Arc<Storage>,
    balancer: Arc<Balancer>,
    metrics: Arc<CacheMetrics>,
    threshold: i64,
}

impl Evictor {
    pub fn new(
        cfg: Arc<Config>,
        storage: Arc<Storage>,
        balancer: Arc<Balancer>,
        metrics: Arc<CacheMetrics>,
    ) -> Arc<Self> {
        let threshold = cfg.memory_threshold();
        Arc::new(Self {
            cfg,
            storage,
            balancer,
            metrics,
            threshold,
        })
    }

    /// Start the eviction loop and its stats logger.
    pub fn spawn(self: Arc<Self>, shutdown: Shutdown) {
        // Stats channel drops new records when the logger lags; losing a
        // stats line must never backpressure eviction.
        let (stats_tx, stats_rx) = mpsc::channel(64);
        self.spawn_logger(stats_rx, shutdown.clone());

        let evictor = self;
        tokio::spawn(async move {
            debug!("evictor started (500ms period)");
            let mut tick = tokio::time::interval(TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("evictor stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        let (items, freed) = evictor.evict_until_within_limit().await;
                        if items > 0 {
                            evictor.metrics.record_eviction(items, freed as u64);
                            let _ = stats_tx.try_send(EvictionStat { items, freed });
                        }
                    }
                }
            }
        });
    }

    /// Drain tails of the most loaded shards until the fresh memory total
    /// drops below the threshold or a full pass frees nothing.
    async fn evict_until_within_limit(&self) -> (u64, i64) {
        let mut items = 0u64;
        let mut freed = 0i64;
        let mut offset = 0usize;
        let mut barren = 0usize;

        while self.storage.real_mem() >= self.threshold {
            // A whole pass over the pressure list without a single eviction
            // means nothing is evictable right now; bail instead of spinning.
            if barren > SHARD_COUNT as usize {
                break;
            }
            if offset >= REBALANCE_EVERY {
                self.balancer.rebalance();
                offset = 0;
            }

            let Some(node) = self.balancer.most_loaded_sampled(offset) else {
                offset += 1;
                barren += 1;
                continue;
            };
            offset += 1;

            if node.recency().is_empty() {
                barren += 1;
                continue;
            }

            let mut drained_here = 0u64;
            while self.storage.real_mem() >= self.threshold {
                let Some((_, victim)) = node.recency().back() else {
                    break;
                };
                let (bytes, hit) = self.storage.remove(&victim);
                if hit {
                    items += 1;
                    drained_here += 1;
                    freed += bytes;
                }
            }
            if drained_here > 0 {
                barren = 0;
            }

            tokio::task::yield_now().await;
        }

        (items, freed)
    }

    fn spawn_logger(&self, mut stats_rx: mpsc::Receiver<EvictionStat>, shutdown: Shutdown) {
        if !self.cfg.cache.logs.stats {
            return;
        }
        tokio::spawn(async move {
            let mut items = 0u64;
            let mut freed = 0i64;
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    stat = stats_rx.recv() => {
                        let Some(stat) = stat else { return };
                        items += stat.items;
                        freed += stat.freed;
                    }
                    _ = tick.tick() => {
                        if items > 0 || freed > 0 {
                            info!(items, freed, "evicted in the last 5s");
                            items = 0;
                            freed = 0;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheKeySection, RuleConfig};
    use crate::model::{Data, Request, Response, Revalidator};
    use crate::storage::lfu::TinyLfu;
    use crate::storage::shard::ShardedMap;

    fn test_config(storage_size: u64, threshold: f64) -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.cache.storage.size = storage_size;
        cfg.cache.eviction.threshold = threshold;
        cfg.cache.rules = vec![RuleConfig {
            path: "/api".to_string(),
            cache_key: CacheKeySection { query: vec!["id".to_string()], ..Default::default() },
            ..Default::default()
        }];
        cfg.finish().unwrap();
        Arc::new(cfg)
    }

    fn noop_revalidator() -> Revalidator {
        Arc::new(|| Box::pin(async { Ok(Data::from_stored(200, vec![], vec![])) }))
    }

    fn entry(cfg: &Arc<Config>, id: u32, body_len: usize) -> Arc<Response> {
        use rand::RngCore;

        let request = Arc::new(
            Request::new(cfg, b"/api", &[(b"id".to_vec(), id.to_string().into_bytes())], &[])
                .unwrap(),
        );
        let rule = cfg.rules[0].clone();
        // Incompressible bodies, so each entry really carries `body_len`.
        let mut body = vec![0u8; body_len];
        rand::thread_rng().fill_bytes(&mut body);
        let data = Data::new(&rule, 200, vec![], body);
        Response::new(Arc::clone(cfg), data, request, noop_revalidator())
    }

    fn build(cfg: &Arc<Config>) -> (Arc<Storage>, Arc<Balancer>, Arc<CacheMetrics>) {
        let map = ShardedMap::new(8);
        let balancer = Balancer::new(&map);
        let metrics = Arc::new(CacheMetrics::new());
        let storage = Storage::new(
            Arc::clone(cfg),
            map,
            Arc::clone(&balancer),
            TinyLfu::new(),
            Arc::clone(&metrics),
        );
        (storage, balancer, metrics)
    }

    #[tokio::test]
    async fn test_evicts_down_to_threshold() {
        // 1 MiB budget, 0.9 threshold, 200 entries of ~8 KiB.
        let cfg = test_config(1024 * 1024, 0.9);
        let (storage, balancer, metrics) = build(&cfg);

        for i in 0..200 {
            storage.set(entry(&cfg, i, 8 * 1024));
        }
        assert!(storage.real_mem() >= storage.memory_threshold());

        let evictor = Evictor::new(Arc::clone(&cfg), Arc::clone(&storage), balancer, metrics);
        let (items, freed) = evictor.evict_until_within_limit().await;

        assert!(items > 0);
        assert!(freed > 0);
        assert!(storage.real_mem() < storage.memory_threshold());
        // Entries survive in proportion: not everything was dropped.
        assert!(storage.map().real_len() > 0);
    }

    #[tokio::test]
    async fn test_noop_when_under_threshold() {
        let cfg = test_config(100 * 1024 * 1024, 0.9);
        let (storage, balancer, metrics) = build(&cfg);

        for i in 0..10 {
            storage.set(entry(&cfg, i, 1024));
        }

        let evictor = Evictor::new(Arc::clone(&cfg), Arc::clone(&storage), balancer, metrics);
        let (items, freed) = evictor.evict_until_within_limit().await;
        assert_eq!(items, 0);
        assert_eq!(freed, 0);
        assert_eq!(storage.map().real_len(), 10);
    }

    #[tokio::test]
    async fn test_recently_touched_entries_survive_preferentially() {
        let cfg = test_config(1024 * 1024, 0.5);
        let (storage, balancer, metrics) = build(&cfg);

        // Put every entry in one shard so its recency list carries the full
        // ordering and the tail-drain behavior is deterministic. Probe with
        // bare requests first; building the payloads is the expensive part.
        let shard_of = |id: u32| {
            Request::new(&cfg, b"/api", &[(b"id".to_vec(), id.to_string().into_bytes())], &[])
                .unwrap()
                .shard_key()
        };
        let target = shard_of(0);
        let ids: Vec<u32> = (0u32..).filter(|&id| shard_of(id) == target).take(120).collect();
        let entries: Vec<_> = ids.iter().map(|&id| entry(&cfg, id, 8 * 1024)).collect();
        for e in &entries {
            storage.set(Arc::clone(e));
        }

        // Touch the first 20 so they move to the front of the list.
        for e in entries.iter().take(20) {
            storage.get(&e.request()).unwrap();
        }

        let evictor =
            Evictor::new(Arc::clone(&cfg), Arc::clone(&storage), balancer, metrics);
        evictor.evict_until_within_limit().await;
        assert!(storage.real_mem() < storage.memory_threshold());

        // The survivors are the front of the list, and the touched set sits
        // exactly there.
        let touched_alive = entries
            .iter()
            .take(20)
            .filter(|e| storage.get(&e.request()).is_some())
            .count();
        assert_eq!(touched_alive, 20);
        assert!(storage.map().real_len() < entries.len() as i64);
    }

    #[tokio::test]
    async fn test_background_loop_drives_memory_down() {
        let cfg = test_config(1024 * 1024, 0.9);
        let (storage, balancer, metrics) = build(&cfg);
        let shutdown = Shutdown::new();

        let evictor = Evictor::new(Arc::clone(&cfg), Arc::clone(&storage), balancer, metrics);
        evictor.spawn(shutdown.clone());

        for i in 0..200 {
            storage.set(entry(&cfg, i, 8 * 1024));
        }
        assert!(storage.real_mem() >= storage.memory_threshold());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(storage.real_mem() < storage.memory_threshold());
        shutdown.trigger();
    }
}
