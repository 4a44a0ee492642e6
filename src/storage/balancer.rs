//! Shard balancer
//!
//! Owns the per-shard recency lists and a global pressure list of shards.
//! The pressure list is only sorted on demand (`rebalance`), because its one
//! consumer (the evictor) tolerates stale ordering; sorting on every insert
//! would buy nothing.

use std::sync::Arc;

use rand::Rng;

use crate::model::{Response, RECENCY_NONE};
use crate::storage::list::{LinkedList, NodeId};
use crate::storage::shard::{Shard, ShardedMap};
use crate::SHARD_COUNT;

/// A shard plus its recency list
pub struct ShardNode {
    shard: Arc<Shard>,
    recency: LinkedList<Arc<Response>>,
}

impl ShardNode {
    #[inline]
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    #[inline]
    pub fn recency(&self) -> &LinkedList<Arc<Response>> {
        &self.recency
    }

    /// Approximate bytes held by the shard
    pub fn weight(&self) -> i64 {
        self.shard.weight()
    }

    /// One arbitrary entry from the underlying shard map
    pub fn sample(&self) -> Option<Arc<Response>> {
        self.shard.sample()
    }
}

/// Per-shard recency bookkeeping and eviction-victim selection
pub struct Balancer {
    shards: Vec<Arc<ShardNode>>,
    /// All shard ids; sorted by weight descending on rebalance
    pressure: LinkedList<u64>,
}

impl Balancer {
    /// Register every shard of the map, in index order.
    pub fn new(map: &ShardedMap) -> Arc<Self> {
        let mut shards = Vec::with_capacity(SHARD_COUNT as usize);
        let pressure = LinkedList::new();
        for shard in map.shards() {
            pressure.push_back(shard.id());
            shards.push(Arc::new(ShardNode {
                shard: Arc::clone(shard),
                recency: LinkedList::new(),
            }));
        }
        Arc::new(Self { shards, pressure })
    }

    #[inline]
    pub fn node(&self, shard: u64) -> &Arc<ShardNode> {
        &self.shards[shard as usize]
    }

    /// Register a newly inserted entry at the front of its shard's recency
    /// list and store the node handle back into the entry.
    pub fn set(&self, entry: &Arc<Response>) {
        let node = self.shards[entry.shard_key() as usize]
            .recency
            .push_front(Arc::clone(entry));
        entry.set_recency_node(node.to_bits());
    }

    /// Bump an existing entry to the front of its shard's recency list.
    /// Safe no-op when the entry was concurrently detached.
    pub fn touch(&self, entry: &Response) {
        let bits = entry.recency_node();
        if bits == RECENCY_NONE {
            return;
        }
        self.shards[entry.shard_key() as usize]
            .recency
            .move_to_front(NodeId::from_bits(bits));
    }

    /// Detach an entry from its shard's recency list.
    pub fn remove(&self, entry: &Response) {
        let bits = entry.recency_node();
        if bits == RECENCY_NONE {
            return;
        }
        self.shards[entry.shard_key() as usize]
            .recency
            .remove(NodeId::from_bits(bits));
        entry.clear_recency_node();
    }

    /// Sort the pressure list by shard weight, most loaded first.
    pub fn rebalance(&self) {
        self.pressure
            .sort_desc_by_key(|&id| self.shards[id as usize].weight());
    }

    /// Shard at `offset` in the pressure list (stale order between
    /// rebalances).
    pub fn most_loaded_sampled(&self, offset: usize) -> Option<Arc<ShardNode>> {
        self.pressure
            .next(offset)
            .map(|id| Arc::clone(&self.shards[id as usize]))
    }

    /// Eviction candidate for an insert into `shard`: the tail of that
    /// shard's recency list, falling back to the next and previous shards
    /// (wrapping at the edges) when the list is empty.
    pub fn find_victim(&self, shard: u64) -> Option<Arc<Response>> {
        let neighbors = [
            shard,
            (shard + 1) % SHARD_COUNT,
            (shard + SHARD_COUNT - 1) % SHARD_COUNT,
        ];
        for id in neighbors {
            if let Some((_, victim)) = self.shards[id as usize].recency.back() {
                return Some(victim);
            }
        }
        None
    }

    /// Uniformly random shard node, for refresher sampling.
    pub fn rand_node(&self) -> Arc<ShardNode> {
        let id = rand::thread_rng().gen_range(0..SHARD_COUNT);
        Arc::clone(&self.shards[id as usize])
    }
}

// =============================================================================
// Tests
// =============================================================================
