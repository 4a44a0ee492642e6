//! Storage engine
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           Storage (façade)                        │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ShardedMap (2048-way)  │  Balancer            │  TinyLFU         │
//! │  key → entry, per-shard │  per-shard recency   │  admission under │
//! │  RwLock + accounting    │  lists + pressure    │  memory pressure │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  Evictor (500 ms)   │  Refresher (β-algorithm)  │  Dumper         │
//! │  drains shard tails │  samples + revalidates    │  per-shard dump │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The façade glues lookup, recency, accounting, and admission together.
//! Get and Set never block beyond a shard lock; all heavy lifting (eviction,
//! refresh, persistence) happens in background tasks.

pub mod balancer;
pub mod dump;
pub mod evictor;
pub mod lfu;
pub mod list;
pub mod refresher;
pub mod shard;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::config::Config;
use crate::metrics::CacheMetrics;
use crate::model::{Request, Response};
use crate::shutdown::Shutdown;
use crate::SHARD_COUNT;

use balancer::Balancer;
use lfu::TinyLfu;
use shard::ShardedMap;

/// Weight-aware sharded cache storage
pub struct Storage {
    cfg: Arc<Config>,
    map: Arc<ShardedMap>,
    balancer: Arc<Balancer>,
    lfu: Arc<TinyLfu>,
    metrics: Arc<CacheMetrics>,
    memory_threshold: i64,
}

impl Storage {
    pub fn new(
        cfg: Arc<Config>,
        map: Arc<ShardedMap>,
        balancer: Arc<Balancer>,
        lfu: Arc<TinyLfu>,
        metrics: Arc<CacheMetrics>,
    ) -> Arc<Self> {
        let memory_threshold = cfg.memory_threshold();
        Arc::new(Self {
            cfg,
            map,
            balancer,
            lfu,
            metrics,
            memory_threshold,
        })
    }

    /// Look up an entry and bump its recency position on a hit.
    pub fn get(&self, request: &Request) -> Option<Arc<Response>> {
        match self.map.get(request.map_key(), request.shard_key()) {
            Some(entry) => {
                self.balancer.touch(&entry);
                self.metrics.record_hit();
                Some(entry)
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Insert a new entry.
    ///
    /// An already-present key is a touch: the existing entry moves to the
    /// front of its recency list and its payload is left alone; payload
    /// updates flow through revalidation only. Under memory pressure the
    /// entry must win TinyLFU admission against the would-be eviction victim
    /// of its shard; a loss drops the insert silently (surfaced only as a
    /// metric).
    pub fn set(&self, entry: Arc<Response>) {
        let key = entry.map_key();
        let shard = entry.shard_key();

        self.lfu.increment(key);

        if let Some(existing) = self.map.get(key, shard) {
            self.balancer.touch(&existing);
            return;
        }

        if self.should_evict() {
            match self.balancer.find_victim(shard) {
                None => {
                    self.metrics.record_admission_no_victim();
                    return;
                }
                Some(victim) => {
                    if !self.lfu.admit(key, victim.map_key()) {
                        self.metrics.record_admission_rejected();
                        return;
                    }
                }
            }
        }

        // Two concurrent misses for one key can both reach this insert; the
        // loser's entry gets replaced and must leave the recency list too.
        if let Some(replaced) = self.map.set(Arc::clone(&entry)) {
            self.balancer.remove(&replaced);
        }
        self.balancer.set(&entry);
        self.metrics.record_insert();
    }

    /// Remove an entry: recency node first, then the map slot.
    pub fn remove(&self, entry: &Response) -> (i64, bool) {
        self.balancer.remove(entry);
        self.map.remove(entry.map_key(), entry.shard_key())
    }

    /// One arbitrary entry from a random shard, probing a few shards to
    /// tolerate empty ones.
    pub fn get_random(&self) -> Option<Arc<Response>> {
        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            let shard = rng.gen_range(0..SHARD_COUNT);
            if let Some(entry) = self.map.shard(shard).sample() {
                return Some(entry);
            }
        }
        None
    }

    /// Bytes used, up to ≈100 ms stale. Hot-path cheap.
    pub fn mem(&self) -> i64 {
        self.map.mem()
    }

    /// Fresh byte count; used by the evictor to decide when to stop.
    pub fn real_mem(&self) -> i64 {
        self.map.real_mem()
    }

    /// Entry count, up to ≈100 ms stale.
    pub fn len(&self) -> i64 {
        self.map.len()
    }

    /// (bytes, entries), both the ≤100 ms-stale view.
    pub fn stat(&self) -> (i64, i64) {
        (self.map.mem(), self.map.len())
    }

    /// Memory-pressure test on the stale view. Hot path.
    pub fn should_evict(&self) -> bool {
        self.map.mem() >= self.memory_threshold
    }

    pub fn memory_threshold(&self) -> i64 {
        self.memory_threshold
    }

    pub fn map(&self) -> &Arc<ShardedMap> {
        &self.map
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Periodic usage line, every 5 s while stats logging is on.
    pub fn spawn_stats_logger(self: Arc<Self>, shutdown: Shutdown) {
        if !self.cfg.cache.logs.stats {
            return;
        }
        let storage = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        let (mem, len) = storage.stat();
                        info!(
                            mem,
                            len,
                            limit = storage.cfg.cache.storage.size,
                            threshold = storage.memory_threshold,
                            hit_ratio = storage.metrics.hit_ratio(),
                            "storage usage"
                        );
                    }
                }
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
