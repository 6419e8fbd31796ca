//! Concurrent fixed-capacity k-mer hash counter.
//!
//! A contiguous node pool (node 0 reserved as null) is split into one slab
//! per processor thread; a prime-capacity slot table holds the heads of
//! singly linked collision chains threaded through the nodes' `next` links.
//!
//! Inserts are lock-free. Each thread keeps one pre-fetched node
//! (`current_id`) drawn from its own slab, so publishing a node is a
//! single-producer CAS on the chain tail. When every slab is exhausted, the
//! map transitions to "keys locked": all threads meet at a barrier once, and
//! from then on novel keys are rejected (the caller spills them) while counts
//! of existing keys keep incrementing.
//!
//! Counts saturate at [`COUNT_MAX`]. A node whose count is 0 was reserved but
//! never committed (or was abandoned after losing an insert race); exporters
//! skip it.

use std::sync::atomic::Ordering;
use std::sync::Barrier;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::codec::{kmer_size, kmer_width};
use crate::config::{
    AtomicCount, AtomicNodeId, AtomicUnit, Count, NodeId, Unit, COUNT_MAX, NODE_ID_NULL,
};
use crate::mem::{MemBudget, Reservation};
use crate::util::max_prime_below;

/// One processor thread's slab of node ids `[start_id, end_id)`.
///
/// `next_id` advances monotonically; ids below it are in use. `current_id`
/// and `synced` belong to the owning thread alone and are atomics only so the
/// block can be shared; all their accesses are relaxed.
struct NodeBlock {
    start_id: NodeId,
    end_id: NodeId,
    next_id: AtomicNodeId,
    current_id: AtomicNodeId,
    synced: std::sync::atomic::AtomicBool,
}

pub struct KmerHashMap {
    table: Box<[AtomicNodeId]>,
    table_capacity: usize,

    // Node pool, struct-of-arrays. `kmers` holds `kmer_width` units per node.
    next: Box<[AtomicNodeId]>,
    counts: Box<[AtomicCount]>,
    kmers: Box<[AtomicUnit]>,
    kmer_width: usize,

    blocks: Box<[NodeBlock]>,

    keys_locked: std::sync::atomic::AtomicBool,
    barrier: Barrier,

    _mem: Vec<Reservation>,
}

impl KmerHashMap {
    /// Sizes the table and node pool from the remaining budget and splits the
    /// pool into one slab per thread.
    pub fn new(budget: &MemBudget, k: usize, threads_count: usize) -> Self {
        assert!(threads_count > 0);

        let kmer_width = kmer_width(k);
        let kmer_size = kmer_size(k);
        let id_size = std::mem::size_of::<NodeId>();
        let count_size = std::mem::size_of::<Count>();
        let unit_align = std::mem::size_of::<Unit>();
        let node_size = (id_size + count_size).div_ceil(unit_align) * unit_align + kmer_size;

        let mem_limit = budget.available();

        let mut nodes_count_limit = mem_limit / (node_size * 3 + id_size * 4) * 3;
        if nodes_count_limit > NodeId::MAX as usize {
            warn!("The count of nodes to be allocated is too large: {nodes_count_limit}.");
            nodes_count_limit = NodeId::MAX as usize;
            warn!("Reduce the count of nodes to {nodes_count_limit}.");
        }
        let nodes_count = nodes_count_limit;
        let nodes_mem = node_size * nodes_count;

        let table_mem_limit = mem_limit - nodes_mem;
        let table_capacity_limit = table_mem_limit / id_size;
        let table_capacity = max_prime_below(table_capacity_limit);
        let table_mem = id_size * table_capacity;

        let mem = vec![
            budget.reserve(table_mem, "hash map table"),
            budget.reserve(nodes_mem, "hash map nodes"),
        ];

        let table: Box<[AtomicNodeId]> = (0..table_capacity)
            .map(|_| AtomicNodeId::new(NODE_ID_NULL))
            .collect();
        let next: Box<[AtomicNodeId]> = (0..nodes_count)
            .map(|_| AtomicNodeId::new(NODE_ID_NULL))
            .collect();
        let counts: Box<[AtomicCount]> = (0..nodes_count).map(|_| AtomicCount::new(0)).collect();
        let kmers: Box<[AtomicUnit]> = (0..nodes_count * kmer_width)
            .map(|_| AtomicUnit::new(0))
            .collect();

        let step = (nodes_count / threads_count) as NodeId;
        let blocks: Box<[NodeBlock]> = (0..threads_count)
            .map(|i| {
                let start_id = 1 + step * i as NodeId;
                let end_id = if i == threads_count - 1 {
                    nodes_count as NodeId
                } else {
                    1 + step * (i as NodeId + 1)
                };
                NodeBlock {
                    start_id,
                    end_id,
                    next_id: AtomicNodeId::new(start_id),
                    current_id: AtomicNodeId::new(NODE_ID_NULL),
                    synced: std::sync::atomic::AtomicBool::new(false),
                }
            })
            .collect();

        debug!("        Hash table capacity: {table_capacity} (limit: {table_capacity_limit})");
        debug!("          Hash table memory: {table_mem}");
        debug!("                Nodes count: {nodes_count}");
        debug!("               Nodes memory: {nodes_mem}");
        debug!(
            "Hash table and nodes memory: {} (limit: {mem_limit})",
            table_mem + nodes_mem
        );
        for (i, block) in blocks.iter().enumerate() {
            debug!(
                "Nodes block #{i} (start: {}, end: {}, length: {})",
                block.start_id,
                block.end_id,
                block.end_id - block.start_id
            );
        }

        KmerHashMap {
            table,
            table_capacity,
            next,
            counts,
            kmers,
            kmer_width,
            blocks,
            keys_locked: std::sync::atomic::AtomicBool::new(false),
            barrier: Barrier::new(threads_count),
            _mem: mem,
        }
    }

    pub fn blocks_count(&self) -> usize {
        self.blocks.len()
    }

    /// Highest number of distinct keys the pool can hold (node 0 is null).
    pub fn max_key_count(&self) -> usize {
        self.blocks[self.blocks.len() - 1].end_id as usize - 1
    }

    /// Shrinks the effective table capacity. Forces collision chains in
    /// tests; must never be called while writers are running.
    pub fn set_table_capacity(&mut self, capacity: usize) {
        warn!("Set table capacity to {capacity} (should only be used for tests)");
        assert!(capacity <= self.table.len());
        self.table_capacity = capacity;
    }

    /// Forces the "keys locked" state. Test hook.
    pub fn lock_keys(&self) {
        warn!("Set hash table key locked (should only be used for tests)");
        self.keys_locked.store(true, Ordering::SeqCst);
    }

    #[inline]
    fn kmer_at(&self, id: NodeId) -> &[AtomicUnit] {
        let start = id as usize * self.kmer_width;
        &self.kmers[start..start + self.kmer_width]
    }

    #[inline]
    fn kmer_equals(&self, id: NodeId, kmer: &[Unit]) -> bool {
        self.kmer_at(id)
            .iter()
            .zip(kmer)
            .all(|(stored, word)| stored.load(Ordering::Relaxed) == *word)
    }

    #[inline]
    fn write_kmer(&self, id: NodeId, kmer: &[Unit]) {
        for (stored, word) in self.kmer_at(id).iter().zip(kmer) {
            stored.store(*word, Ordering::Relaxed);
        }
    }

    /// Draws the next unused node id from block `n`, or null on exhaustion.
    fn request_node(&self, n: usize) -> NodeId {
        let block = &self.blocks[n];
        let mut node_id = block.next_id.load(Ordering::Relaxed);
        loop {
            if node_id == block.end_id {
                return NODE_ID_NULL;
            }
            match block.next_id.compare_exchange_weak(
                node_id,
                node_id + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => node_id = v,
            }
        }

        self.counts[node_id as usize].store(0, Ordering::Relaxed);
        node_id
    }

    /// Like [`Self::request_node`] but polls the other blocks round-robin
    /// once this thread's own slab is exhausted.
    fn polling_request_node(&self, n: usize) -> NodeId {
        let node_id = self.request_node(n);
        if node_id != NODE_ID_NULL {
            return node_id;
        }

        let m = self.blocks.len();
        let mut n = n;
        for _ in 0..m - 1 {
            n += 1;
            if n == m {
                n = 0;
            }
            let node_id = self.request_node(n);
            if node_id != NODE_ID_NULL {
                return node_id;
            }
        }
        NODE_ID_NULL
    }

    #[inline]
    fn hash(&self, kmer: &[Unit]) -> usize {
        let mut n = 0usize;
        for word in kmer {
            n = n.wrapping_add(*word as usize);
        }
        n % self.table_capacity
    }

    /// Walks the collision chain starting at `cell`. On a key match the
    /// node's count is bumped (saturating) and `Some(id)` is returned; on
    /// reaching the tail, `None`. Either way the cell where the walk stopped
    /// comes back so the caller can retry a tail CAS from there.
    fn chain_add_kmer<'a>(
        &'a self,
        mut cell: &'a AtomicNodeId,
        kmer: &[Unit],
    ) -> (Option<NodeId>, &'a AtomicNodeId) {
        loop {
            let node_id = cell.load(Ordering::Acquire);

            if node_id == NODE_ID_NULL {
                return (None, cell);
            }

            if self.kmer_equals(node_id, kmer) {
                let count = &self.counts[node_id as usize];
                let mut current = count.load(Ordering::Relaxed);
                loop {
                    if current == COUNT_MAX {
                        break;
                    }
                    match count.compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(v) => current = v,
                    }
                }
                return (Some(node_id), cell);
            }

            cell = &self.next[node_id as usize];
        }
    }

    /// Counts one canonical k-mer on behalf of thread `n`.
    ///
    /// Returns `true` when the k-mer was counted (incremented or newly
    /// inserted), `false` when the map is frozen and the caller must spill it.
    pub fn add_kmer(&self, n: usize, kmer: &[Unit]) -> bool {
        let block = &self.blocks[n];

        // Pre-fetch a node so the insert below always has one at hand.
        if !block.synced.load(Ordering::Relaxed)
            && block.current_id.load(Ordering::Relaxed) == NODE_ID_NULL
        {
            let current_id = self.polling_request_node(n);
            block.current_id.store(current_id, Ordering::Relaxed);
            if current_id == NODE_ID_NULL {
                self.keys_locked.store(true, Ordering::SeqCst);
                debug!("Set hash map keys locked.");
            }
        }

        // Another thread may have locked the keys; each thread must observe
        // the lock exactly once, at the barrier, before it is allowed to
        // reject keys. A thread that keeps hitting existing keys may arrive
        // here long after the lock was set.
        if !block.synced.load(Ordering::Relaxed) && self.keys_locked.load(Ordering::SeqCst) {
            self.barrier.wait();
            block.synced.store(true, Ordering::Relaxed);
            debug!("Block #{n} synced (keys locked).");
        }

        let table_idx = self.hash(kmer);

        let (found, mut cell) = self.chain_add_kmer(&self.table[table_idx], kmer);
        if found.is_some() {
            return true;
        }

        // Rejecting is only safe once this thread has passed the barrier:
        // before that, a peer that saw the lock first could still be
        // publishing a node this thread has not observed.
        if block.synced.load(Ordering::Relaxed) && self.keys_locked.load(Ordering::SeqCst) {
            return false;
        }

        let current_id = block.current_id.load(Ordering::Relaxed);
        self.write_kmer(current_id, kmer);
        self.counts[current_id as usize].store(1, Ordering::Relaxed);
        self.next[current_id as usize].store(NODE_ID_NULL, Ordering::Relaxed);

        loop {
            match cell.compare_exchange(NODE_ID_NULL, current_id, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(_) => {
                    let (found, next_cell) = self.chain_add_kmer(cell, kmer);
                    if found.is_some() {
                        // A peer inserted the same key first; the pre-fetched
                        // node stays reserved with count 0 and is skipped by
                        // export.
                        self.counts[current_id as usize].store(0, Ordering::Relaxed);
                        return true;
                    }
                    cell = next_cell;
                }
            }
        }

        block.current_id.store(NODE_ID_NULL, Ordering::Relaxed);
        true
    }

    /// Declares thread `n` done with [`Self::add_kmer`]. A thread that never
    /// observed the lock still arrives at the barrier here, so the barrier's
    /// participant count always works out.
    pub fn finish_adding_kmers(&self, n: usize) {
        let block = &self.blocks[n];

        if !block.synced.load(Ordering::Relaxed) {
            self.barrier.wait();
            block.synced.store(true, Ordering::Relaxed);
            debug!("Block #{n} synced (adding finished).");
        }
    }

    /// Resets the map for the next pass: empties the table (in parallel),
    /// rewinds every slab and unlocks the keys.
    pub fn clear(&mut self) {
        self.keys_locked.store(false, Ordering::SeqCst);

        for block in self.blocks.iter_mut() {
            *block.next_id.get_mut() = block.start_id;
            *block.current_id.get_mut() = NODE_ID_NULL;
            *block.synced.get_mut() = false;
        }

        let chunk = (self.table_capacity / self.blocks.len()).max(1);
        self.table[..self.table_capacity]
            .par_chunks(chunk)
            .for_each(|slots| {
                for slot in slots {
                    slot.store(NODE_ID_NULL, Ordering::Relaxed);
                }
            });
    }

    /// Visits every committed node of thread `n`'s slab. Must not run
    /// concurrently with writers. Returns the number of nodes visited.
    pub fn export(&self, n: usize, mut callback: impl FnMut(&[Unit], Count)) -> usize {
        assert!(n < self.blocks.len());
        let block = &self.blocks[n];

        let mut exported = 0;
        let mut scratch = vec![0 as Unit; self.kmer_width];

        for id in block.start_id..block.next_id.load(Ordering::Relaxed) {
            let count = self.counts[id as usize].load(Ordering::Relaxed);
            if count != 0 {
                for (word, stored) in scratch.iter_mut().zip(self.kmer_at(id)) {
                    *word = stored.load(Ordering::Relaxed);
                }
                callback(&scratch, count);
                exported += 1;
            } else {
                debug!(
                    "Block #{n} ({}-{}) node id: {id} count equals to 0.",
                    block.start_id, block.end_id
                );
            }
        }

        exported
    }
}
