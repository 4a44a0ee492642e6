//! cachefront - in-process HTTP response cache
//!
//! A memory-bounded response cache sitting in front of an upstream origin.
//! For a configured set of path rules it memoizes responses keyed by a
//! canonicalized subset of query parameters and headers, serves hits
//! directly, and revalidates stale entries in the background so content
//! stays fresh without stampeding the origin.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Cache                                 │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌───────────┐   ┌──────────┐   ┌─────────────┐   │
//! │  │ ShardedMap │◀──│  Storage  │──▶│ Balancer │   │   TinyLFU   │   │
//! │  │ (2048-way) │   │  (façade) │   │ recency+ │   │  admission  │   │
//! │  └────────────┘   └───────────┘   │ pressure │   └─────────────┘   │
//! │                        ▲          └──────────┘                     │
//! │   background: ┌────────┴───────┬──────────────┬────────────┐       │
//! │               │    Evictor     │  Refresher   │   Dumper   │       │
//! │               │  (500ms tick)  │ (β-algorithm)│ (parallel) │       │
//! │               └────────────────┴──────────────┴────────────┘       │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - YAML configuration document and compiled rules
//! - [`error`] - error types
//! - [`metrics`] - process-wide counters
//! - [`model`] - canonical request, payload, cache entry
//! - [`rate`] - token-bucket rate limiter
//! - [`shutdown`] - cooperative cancellation
//! - [`storage`] - sharded store, recency, admission, background workers
//! - [`upstream`] - origin contract and miss-path gate

pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod rate;
pub mod shutdown;
pub mod storage;
pub mod upstream;

use std::sync::Arc;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use model::{Data, Request, Response};
pub use shutdown::Shutdown;
pub use storage::dump::{DumpStats, Dumper};
pub use storage::Storage;
pub use upstream::Upstream;

use storage::balancer::Balancer;
use storage::evictor::Evictor;
use storage::lfu::TinyLfu;
use storage::refresher::Refresher;
use storage::shard::ShardedMap;
use upstream::UpstreamGate;

/// Number of shards in the key space. Power of two, fixed for the life of
/// the process; dump files record per-shard keys against this constant.
pub const SHARD_COUNT: u64 = 2048;

/// The assembled cache engine: storage plus all background workers.
///
/// Construction wires the sharded map, balancer, TinyLFU, evictor, and
/// refresher together and spawns their background tasks, so it must happen
/// inside a tokio runtime. [`Cache::stop`] (or dropping the last handle)
/// signals every task to exit.
pub struct Cache {
    cfg: Arc<Config>,
    storage: Arc<Storage>,
    dumper: Dumper,
    upstream: Arc<dyn Upstream>,
    gate: UpstreamGate,
    metrics: Arc<CacheMetrics>,
    shutdown: Shutdown,
}

impl Cache {
    /// Build the engine and start its background tasks.
    pub fn new(cfg: Config, upstream: Arc<dyn Upstream>) -> Arc<Self> {
        let cfg = Arc::new(cfg);
        let shutdown = Shutdown::new();
        let metrics = Arc::new(CacheMetrics::new());

        let map = ShardedMap::new(cfg.cache.preallocate.per_shard);
        let balancer = Balancer::new(&map);
        let lfu = TinyLfu::new();
        let storage = Storage::new(
            Arc::clone(&cfg),
            Arc::clone(&map),
            Arc::clone(&balancer),
            Arc::clone(&lfu),
            Arc::clone(&metrics),
        );

        Arc::clone(&map).spawn_mem_refresher(shutdown.clone());
        Arc::clone(&lfu).spawn_batcher(shutdown.clone());
        Arc::clone(&storage).spawn_stats_logger(shutdown.clone());
        Evictor::new(
            Arc::clone(&cfg),
            Arc::clone(&storage),
            Arc::clone(&balancer),
            Arc::clone(&metrics),
        )
        .spawn(shutdown.clone());
        Refresher::new(Arc::clone(&cfg), Arc::clone(&balancer), Arc::clone(&metrics))
            .spawn(shutdown.clone());

        let gate = UpstreamGate::new(cfg.cache.upstream.rate, shutdown.clone());
        let dumper = Dumper::new(
            Arc::clone(&cfg),
            Arc::clone(&storage),
            Arc::clone(&upstream),
            shutdown.clone(),
        );

        Arc::new(Self {
            cfg,
            storage,
            dumper,
            upstream,
            gate,
            metrics,
            shutdown,
        })
    }

    /// Canonicalize an inbound request against the configured rules.
    pub fn canonicalize(
        &self,
        path: &[u8],
        query: &[model::KvPair],
        headers: &[model::KvPair],
    ) -> Result<Request> {
        Request::new(&self.cfg, path, query, headers)
    }

    /// Cache lookup; bumps recency on a hit.
    pub fn get(&self, request: &Request) -> Option<Arc<Response>> {
        self.storage.get(request)
    }

    /// Miss path: take an upstream token, fetch, insert, return the entry.
    ///
    /// [`Error::UpstreamRateExhausted`] maps to 429 at the HTTP boundary,
    /// [`Error::Upstream`] to 503; neither caches anything.
    pub async fn fetch_miss(&self, request: Request) -> Result<Arc<Response>> {
        self.gate.check()?;
        let entry = upstream::fetch_entry(&self.cfg, &self.upstream, Arc::new(request)).await?;
        self.storage.set(Arc::clone(&entry));
        Ok(entry)
    }

    /// Insert an externally built entry.
    pub fn insert(&self, entry: Arc<Response>) {
        self.storage.set(entry);
    }

    /// Remove an entry. Returns (freed bytes, hit).
    pub fn remove(&self, entry: &Response) -> (i64, bool) {
        self.storage.remove(entry)
    }

    /// Persist all shards to disk.
    pub async fn dump(&self) -> Result<DumpStats> {
        self.dumper.dump().await
    }

    /// Restore the newest dump generation.
    pub async fn load(&self) -> Result<DumpStats> {
        self.dumper.load().await
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Stop every background task. Idempotent.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
