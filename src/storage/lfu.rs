//! TinyLFU admission filter
//!
//! Under memory pressure a new entry has to be "worthier" than the eviction
//! candidate it would displace. Frequency is estimated by a count-min sketch
//! of saturating 8-bit counters; a small Bloom filter (the doorkeeper) lets
//! every key through exactly once so one-shot traffic cannot displace hot
//! entries. Admission-path sightings go into a lock-free ring buffer that a
//! batcher task drains into the sketch every 500 ms, so the hot path never
//! serializes on the sketch. Estimates are read without synchronization and
//! may be up to one batch period stale.
//!
//! Counters age: once a sample budget of increments has been absorbed, every
//! counter is halved and the doorkeeper resets, keeping the sketch
//! responsive on long-running instances.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::shutdown::Shutdown;

const SKETCH_DEPTH: usize = 5;
const SKETCH_WIDTH: usize = 1 << 15;
const DOORKEEPER_BITS: usize = 1 << 18;
const RING_SIZE: usize = 1 << 16;
/// Increments absorbed before the sketch is halved
const SAMPLE_BUDGET: u64 = (SKETCH_WIDTH * 10) as u64;
/// Batch period for draining the ring into the sketch
const DRAIN_PERIOD: Duration = Duration::from_millis(500);

/// xor-multiply-shift mixer for sketch and doorkeeper rows
#[inline]
fn mix(seed: u64, key: u64) -> u64 {
    let mut x = key ^ seed;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

// =============================================================================
// Count-min sketch
// =============================================================================

struct CountMinSketch {
    rows: Vec<Vec<AtomicU8>>,
    seeds: [u64; SKETCH_DEPTH],
}

impl CountMinSketch {
    fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut seeds = [0u64; SKETCH_DEPTH];
        for seed in seeds.iter_mut() {
            *seed = rng.gen();
        }
        let rows = (0..SKETCH_DEPTH)
            .map(|_| (0..SKETCH_WIDTH).map(|_| AtomicU8::new(0)).collect())
            .collect();
        Self { rows, seeds }
    }

    fn increment(&self, key: u64) {
        for (row, seed) in self.rows.iter().zip(self.seeds) {
            let counter = &row[(mix(seed, key) as usize) % SKETCH_WIDTH];
            // Saturating at 255; the load/store race can only undercount.
            let v = counter.load(Ordering::Relaxed);
            if v < u8::MAX {
                counter.store(v + 1, Ordering::Relaxed);
            }
        }
    }

    fn estimate(&self, key: u64) -> u8 {
        let mut min = u8::MAX;
        for (row, seed) in self.rows.iter().zip(self.seeds) {
            let v = row[(mix(seed, key) as usize) % SKETCH_WIDTH].load(Ordering::Relaxed);
            min = min.min(v);
        }
        min
    }

    fn halve(&self) {
        for row in &self.rows {
            for counter in row {
                let v = counter.load(Ordering::Relaxed);
                if v > 0 {
                    counter.store(v >> 1, Ordering::Relaxed);
                }
            }
        }
    }
}

// =============================================================================
// Doorkeeper
// =============================================================================

/// Two-hash Bloom filter gating first sightings
struct Doorkeeper {
    bits: Vec<AtomicU64>,
    seeds: [u64; 2],
}

impl Doorkeeper {
    fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            bits: (0..DOORKEEPER_BITS / 64).map(|_| AtomicU64::new(0)).collect(),
            seeds: [rng.gen(), rng.gen()],
        }
    }

    /// True when the key was probably seen before; records it either way.
    fn seen_or_record(&self, key: u64) -> bool {
        let p1 = (mix(self.seeds[0], key) as usize) % DOORKEEPER_BITS;
        let p2 = (mix(self.seeds[1], key) as usize) % DOORKEEPER_BITS;
        let b1 = self.bits[p1 / 64].fetch_or(1 << (p1 % 64), Ordering::Relaxed);
        let b2 = self.bits[p2 / 64].fetch_or(1 << (p2 % 64), Ordering::Relaxed);
        (b1 >> (p1 % 64)) & 1 == 1 && (b2 >> (p2 % 64)) & 1 == 1
    }

    fn reset(&self) {
        for word in &self.bits {
            word.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Ring buffer
// =============================================================================

/// Lock-free ring of recently admitted keys, overwrite-oldest
struct Ring {
    slots: Vec<AtomicU64>,
    pos: AtomicU64,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: (0..RING_SIZE).map(|_| AtomicU64::new(0)).collect(),
            pos: AtomicU64::new(0),
        }
    }

    fn push(&self, key: u64) {
        let pos = self.pos.fetch_add(1, Ordering::Relaxed);
        self.slots[(pos as usize) & (RING_SIZE - 1)].store(key, Ordering::Relaxed);
    }

    /// Take every recorded key, leaving the slots empty. Zero marks an
    /// unfilled slot and is skipped; real keys are xxh3 outputs for which
    /// zero is not a practical concern.
    fn drain(&self, mut f: impl FnMut(u64)) -> u64 {
        let mut drained = 0;
        for slot in &self.slots {
            let key = slot.swap(0, Ordering::Relaxed);
            if key != 0 {
                f(key);
                drained += 1;
            }
        }
        drained
    }
}

// =============================================================================
// TinyLFU
// =============================================================================

/// TinyLFU admission: count-min sketch + doorkeeper + admission ring
pub struct TinyLfu {
    sketch: CountMinSketch,
    door: Doorkeeper,
    ring: Ring,
    absorbed: AtomicU64,
}

impl TinyLfu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sketch: CountMinSketch::new(),
            door: Doorkeeper::new(),
            ring: Ring::new(),
            absorbed: AtomicU64::new(0),
        })
    }

    /// Drain the ring into the sketch every 500 ms until shutdown.
    pub fn spawn_batcher(self: Arc<Self>, shutdown: Shutdown) {
        let lfu = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DRAIN_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        lfu.drain_ring();
                    }
                }
            }
        });
    }

    /// Record an access: bump the sketch and mark the doorkeeper.
    pub fn increment(&self, key: u64) {
        self.sketch.increment(key);
        self.door.seen_or_record(key);
    }

    /// Frequency estimate, up to one batch period stale.
    pub fn estimate(&self, key: u64) -> u8 {
        self.sketch.estimate(key)
    }

    /// Should `new_key` displace `victim_key`?
    ///
    /// A first sighting is always admitted (and recorded): the doorkeeper
    /// exists so that the *second* coming of a key competes on frequency,
    /// while pure one-shot traffic never ejects an established entry twice.
    pub fn admit(&self, new_key: u64, victim_key: u64) -> bool {
        self.ring.push(new_key);

        if !self.door.seen_or_record(new_key) {
            return true;
        }

        self.sketch.estimate(new_key) >= self.sketch.estimate(victim_key)
    }

    /// One batcher pass: absorb ring sightings, age the sketch when the
    /// sample budget is spent.
    pub fn drain_ring(&self) {
        let drained = self.ring.drain(|key| self.sketch.increment(key));
        if drained == 0 {
            return;
        }
        let absorbed = self.absorbed.fetch_add(drained, Ordering::Relaxed) + drained;
        if absorbed > SAMPLE_BUDGET {
            self.sketch.halve();
            self.door.reset();
            self.absorbed.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
