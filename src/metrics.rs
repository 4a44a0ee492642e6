//! Cache metrics collection
//!
//! Process-wide atomic counters for monitoring cache behavior. Exposition
//! (Prometheus or otherwise) is the embedder's concern; the engine only
//! maintains the counters and hands out snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,

    // Admission control outcomes under memory pressure
    admission_rejected: AtomicU64,
    admission_no_victim: AtomicU64,

    evicted_items: AtomicU64,
    evicted_bytes: AtomicU64,

    refresh_ok: AtomicU64,
    refresh_errors: AtomicU64,

    dump_written: AtomicU64,
    dump_restored: AtomicU64,
    dump_errors: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// TinyLFU judged the new entry less worthy than the victim.
    pub fn record_admission_rejected(&self) {
        self.admission_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// No eviction victim could be found; the insert was dropped.
    pub fn record_admission_no_victim(&self) {
        self.admission_no_victim.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, items: u64, bytes: u64) {
        self.evicted_items.fetch_add(items, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_refresh_ok(&self) {
        self.refresh_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_error(&self) {
        self.refresh_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dump_written(&self, records: u64) {
        self.dump_written.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_dump_restored(&self, records: u64) {
        self.dump_restored.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_dump_error(&self) {
        self.dump_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    pub fn refresh_ok(&self) -> u64 {
        self.refresh_ok.load(Ordering::Relaxed)
    }

    pub fn refresh_errors(&self) -> u64 {
        self.refresh_errors.load(Ordering::Relaxed)
    }

    pub fn admission_rejected(&self) -> u64 {
        self.admission_rejected.load(Ordering::Relaxed)
    }

    pub fn admission_no_victim(&self) -> u64 {
        self.admission_no_victim.load(Ordering::Relaxed)
    }

    pub fn evicted_items(&self) -> u64 {
        self.evicted_items.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            admission_rejected: self.admission_rejected.load(Ordering::Relaxed),
            admission_no_victim: self.admission_no_victim.load(Ordering::Relaxed),
            evicted_items: self.evicted_items.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            refresh_ok: self.refresh_ok.load(Ordering::Relaxed),
            refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
            dump_written: self.dump_written.load(Ordering::Relaxed),
            dump_restored: self.dump_restored.load(Ordering::Relaxed),
            dump_errors: self.dump_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub admission_rejected: u64,
    pub admission_no_victim: u64,
    pub evicted_items: u64,
    pub evicted_bytes: u64,
    pub refresh_ok: u64,
    pub refresh_errors: u64,
    pub dump_written: u64,
    pub dump_restored: u64,
    pub dump_errors: u64,
}

// =============================================================================
// Tests
// =============================================================================
