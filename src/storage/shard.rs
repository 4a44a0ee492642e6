//! Sharded map
//!
//! The key→entry store, partitioned into [`crate::SHARD_COUNT`] independent
//! shards so readers and writers contend only within a shard. Each shard
//! keeps atomic `len`/`mem` counters next to its map; a background refresher
//! folds them into process-wide atomics every 100 ms, which is what the hot
//! path reads (so hot-path memory reads are up to ≈100 ms stale). The
//! evictor uses [`ShardedMap::real_mem`] when it needs the honest number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::model::Response;
use crate::shutdown::Shutdown;
use crate::SHARD_COUNT;

/// A single partition: one lock, one map, its own accounting
pub struct Shard {
    id: u64,
    map: RwLock<HashMap<u64, Arc<Response>>>,
    len: AtomicI64,
    mem: AtomicI64,
}

impl Shard {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            map: RwLock::new(HashMap::with_capacity(capacity)),
            len: AtomicI64::new(0),
            mem: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> i64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held by this shard's entries
    pub fn weight(&self) -> i64 {
        self.mem.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: u64) -> Option<Arc<Response>> {
        self.map.read().get(&key).cloned()
    }

    /// Insert or replace. Returns the replaced entry so the caller can
    /// detach its recency node; `len` moves only on a true insert, `mem`
    /// moves by the weight delta.
    pub fn set(&self, entry: Arc<Response>) -> Option<Arc<Response>> {
        let key = entry.map_key();
        let weight = entry.weight();

        let old = { self.map.write().insert(key, entry) };
        match &old {
            Some(previous) => {
                self.mem.fetch_add(weight - previous.weight(), Ordering::Relaxed);
            }
            None => {
                self.len.fetch_add(1, Ordering::Relaxed);
                self.mem.fetch_add(weight, Ordering::Relaxed);
            }
        }
        old
    }

    /// Delete by key. Returns (freed bytes, hit).
    pub fn remove(&self, key: u64) -> (i64, bool) {
        let removed = { self.map.write().remove(&key) };
        match removed {
            Some(entry) => {
                let freed = entry.weight();
                self.len.fetch_sub(1, Ordering::Relaxed);
                self.mem.fetch_sub(freed, Ordering::Relaxed);
                (freed, true)
            }
            None => (0, false),
        }
    }

    /// Visit entries under the shard lock until `f` returns `false` or the
    /// shutdown fires. `exclusive` takes the write lock (dump quiesces
    /// writers that way); otherwise readers proceed concurrently.
    pub fn walk(
        &self,
        shutdown: &Shutdown,
        exclusive: bool,
        mut f: impl FnMut(u64, &Arc<Response>) -> bool,
    ) {
        if exclusive {
            let map = self.map.write();
            for (key, entry) in map.iter() {
                if shutdown.is_triggered() || !f(*key, entry) {
                    return;
                }
            }
        } else {
            let map = self.map.read();
            for (key, entry) in map.iter() {
                if shutdown.is_triggered() || !f(*key, entry) {
                    return;
                }
            }
        }
    }

    /// One arbitrary entry, in the map's iteration order.
    pub fn sample(&self) -> Option<Arc<Response>> {
        self.map.read().values().next().cloned()
    }
}

/// The sharded key→entry store
pub struct ShardedMap {
    shards: Vec<Arc<Shard>>,
    /// Process-wide sums, republished every 100 ms
    mem: AtomicI64,
    len: AtomicI64,
}

impl ShardedMap {
    pub fn new(per_shard_capacity: usize) -> Arc<Self> {
        let shards = (0..SHARD_COUNT)
            .map(|id| Arc::new(Shard::new(id, per_shard_capacity)))
            .collect();
        Arc::new(Self {
            shards,
            mem: AtomicI64::new(0),
            len: AtomicI64::new(0),
        })
    }

    /// Shard index for a key
    #[inline]
    pub fn shard_key(key: u64) -> u64 {
        key % SHARD_COUNT
    }

    #[inline]
    pub fn shard(&self, index: u64) -> &Arc<Shard> {
        &self.shards[index as usize]
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn get(&self, key: u64, shard: u64) -> Option<Arc<Response>> {
        self.shards[shard as usize].get(key)
    }

    pub fn set(&self, entry: Arc<Response>) -> Option<Arc<Response>> {
        self.shards[entry.shard_key() as usize].set(entry)
    }

    pub fn remove(&self, key: u64, shard: u64) -> (i64, bool) {
        self.shards[shard as usize].remove(key)
    }

    /// Run `f` once per shard, one tokio task each, and wait for all of them.
    pub async fn walk_shards<F>(&self, f: F)
    where
        F: Fn(Arc<Shard>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut tasks = tokio::task::JoinSet::new();
        for shard in &self.shards {
            let shard = Arc::clone(shard);
            let f = Arc::clone(&f);
            tasks.spawn(async move { f(shard) });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Total entries, ≤100 ms stale.
    pub fn len(&self) -> i64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes, ≤100 ms stale.
    pub fn mem(&self) -> i64 {
        self.mem.load(Ordering::Relaxed)
    }

    /// Fresh byte total: sums every shard and republishes the result.
    pub fn real_mem(&self) -> i64 {
        let mem: i64 = self.shards.iter().map(|s| s.weight()).sum();
        self.mem.store(mem, Ordering::Relaxed);
        mem
    }

    /// Fresh entry total: sums every shard and republishes the result.
    pub fn real_len(&self) -> i64 {
        let len: i64 = self.shards.iter().map(|s| s.len()).sum();
        self.len.store(len, Ordering::Relaxed);
        len
    }

    /// Publish `mem`/`len` sums every 100 ms until shutdown.
    pub fn spawn_mem_refresher(self: Arc<Self>, shutdown: Shutdown) {
        let map = self;
        tokio::spawn(async move {
            debug!("memory refresher started (100ms period)");
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("memory refresher stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        map.real_mem();
                        map.real_len();
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
    use crate::config::{CacheKeySection, Config, RuleConfig};
    use crate::model::{Data, Request, Response, Revalidator};

    fn test_config() -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.cache.rules = vec![RuleConfig {
            path: "/api".to_string(),
            cache_key: CacheKeySection { query: vec!["id".to_string()], ..Default::default() },
            ..Default::default()
        }];
        cfg.finish().unwrap();
        Arc::new(cfg)
    }

    fn noop_revalidator() -> Revalidator {
        Arc::new(|| Box::pin(async { Ok(Data::from_stored(200, vec![], b"fresh".to_vec())) }))
    }

    fn entry_with_body(cfg: &Arc<Config>, id: u32, body_len: usize) -> Arc<Response> {
        let request = Request::new(
            cfg,
            b"/api",
            &[(b"id".to_vec(), id.to_string().into_bytes())],
            &[],
        )
        .unwrap();
        let rule = cfg.rules[0].clone();
        let data = Data::new(&rule, 200, vec![], vec![b'x'; body_len]);
        Response::new(Arc::clone(cfg), data, Arc::new(request), noop_revalidator())
    }

    #[test]
    fn test_shard_key_in_range() {
        for key in [0u64, 1, 2047, 2048, u64::MAX] {
            assert!(ShardedMap::shard_key(key) < SHARD_COUNT);
        }
        assert_eq!(ShardedMap::shard_key(2048), 0);
    }

    #[test]
    fn test_set_get_remove_accounting() {
        let cfg = test_config();
        let map = ShardedMap::new(8);
        let entry = entry_with_body(&cfg, 1, 100);
        let key = entry.map_key();
        let shard = entry.shard_key();
        let weight = entry.weight();

        assert!(map.set(Arc::clone(&entry)).is_none());
        assert_eq!(map.shard(shard).len(), 1);
        assert_eq!(map.shard(shard).weight(), weight);

        let got = map.get(key, shard).unwrap();
        assert!(Arc::ptr_eq(&got, &entry));

        let (freed, hit) = map.remove(key, shard);
        assert!(hit);
        assert_eq!(freed, weight);
        assert_eq!(map.shard(shard).len(), 0);
        assert_eq!(map.shard(shard).weight(), 0);

        let (freed, hit) = map.remove(key, shard);
        assert!(!hit);
        assert_eq!(freed, 0);
    }

    #[test]
    fn test_replace_keeps_len_and_adjusts_mem() {
        let cfg = test_config();
        let map = ShardedMap::new(8);

        let small = entry_with_body(&cfg, 1, 10);
        let big = entry_with_body(&cfg, 1, 500);
        assert_eq!(small.map_key(), big.map_key());
        let shard = small.shard_key();

        map.set(Arc::clone(&small));
        let replaced = map.set(Arc::clone(&big)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &small));

        assert_eq!(map.shard(shard).len(), 1);
        assert_eq!(map.shard(shard).weight(), big.weight());
    }

    #[test]
    fn test_real_mem_sums_shards() {
        let cfg = test_config();
        let map = ShardedMap::new(8);

        let mut expected = 0;
        for i in 0..64 {
            let entry = entry_with_body(&cfg, i, 64);
            expected += entry.weight();
            map.set(entry);
        }

        assert_eq!(map.real_mem(), expected);
        assert_eq!(map.real_len(), 64);
        // real_mem republishes into the stale view.
        assert_eq!(map.mem(), expected);
    }

    #[test]
    fn test_walk_stops_early() {
        let cfg = test_config();
        let map = ShardedMap::new(8);
        let entry = entry_with_body(&cfg, 7, 32);
        let shard = entry.shard_key();
        map.set(entry);

        let shutdown = Shutdown::new();
        let mut visited = 0;
        map.shard(shard).walk(&shutdown, false, |_, _| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);
    }

    #[tokio::test]
    async fn test_walk_shards_visits_all() {
        use std::sync::atomic::AtomicU64;

        let cfg = test_config();
        let map = ShardedMap::new(8);
        for i in 0..128 {
            map.set(entry_with_body(&cfg, i, 16));
        }

        let counted = Arc::new(AtomicU64::new(0));
        let counted2 = Arc::clone(&counted);
        map.walk_shards(move |shard| {
            counted2.fetch_add(shard.len() as u64, Ordering::Relaxed);
        })
        .await;
        assert_eq!(counted.load(Ordering::Relaxed), 128);
    }

    #[tokio::test]
    async fn test_mem_refresher_publishes() {
        let cfg = test_config();
        let map = ShardedMap::new(8);
        let shutdown = Shutdown::new();
        Arc::clone(&map).spawn_mem_refresher(shutdown.clone());

        let entry = entry_with_body(&cfg, 1, 256);
        let weight = entry.weight();
        map.set(entry);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(map.mem(), weight);
        assert_eq!(map.len(), 1);
        shutdown.trigger();
    }

    #[test]
    fn test_sample_returns_some_entry() {
        let cfg = test_config();
        let map = ShardedMap::new(8);
        let entry = entry_with_body(&cfg, 3, 32);
        let shard = entry.shard_key();
        map.set(Arc::clone(&entry));

        let sampled = map.shard(shard).sample().unwrap();
        assert!(Arc::ptr_eq(&sampled, &entry));
        assert!(map.shard((shard + 1) % SHARD_COUNT).sample().is_none());
    }
}
