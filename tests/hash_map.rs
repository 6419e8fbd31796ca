//! Hash counter behaviour under contention: counting, slab exhaustion, the
//! freeze handshake and export.
//!
//! The concurrent tests drive 4 threads over twice as many distinct keys as
//! the pool can hold, so the map is guaranteed to freeze mid-run; every
//! occurrence must then be accounted for either in the map or in the
//! caller's spill tally, never both.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

use ktally::config::{Count, Unit};
use ktally::hash_map::KmerHashMap;
use ktally::mem::MemBudget;

const THREAD_COUNT: usize = 4;
const K: usize = 16;

fn new_map(mem_limit: usize) -> (MemBudget, KmerHashMap) {
    let budget = MemBudget::new(mem_limit);
    let map = KmerHashMap::new(&budget, K, THREAD_COUNT);
    (budget, map)
}

/// Deterministic xorshift, used to shuffle each thread's key order.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn shuffled_keys(unique: usize, seed: u64) -> Vec<Unit> {
    let mut keys: Vec<Unit> = (0..unique as Unit).collect();
    let mut rng = XorShift(seed | 1);
    for i in (1..keys.len()).rev() {
        let j = (rng.next() % (i as u64 + 1)) as usize;
        keys.swap(i, j);
    }
    keys
}

/// Every thread adds each of `unique` single-word keys twice, tallying
/// rejected occurrences per key in `out_of_hash`.
fn add_all_kmers(map: &KmerHashMap, unique: usize, out_of_hash: &[AtomicU32]) {
    thread::scope(|s| {
        for n in 0..THREAD_COUNT {
            let keys = shuffled_keys(unique, (n as u64 + 1) * 0x9E37_79B9);
            s.spawn(move || {
                for _ in 0..2 {
                    for &key in &keys {
                        let kmer = [key];
                        if !map.add_kmer(n, &kmer) {
                            assert!((key as usize) < unique);
                            out_of_hash[key as usize].fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                map.finish_adding_kmers(n);
            });
        }
    });
}

/// Exports every block concurrently, tallying counts per key. Returns the
/// number of exported nodes.
fn export_all_kmers(map: &KmerHashMap, unique: usize, in_hash: &[AtomicU64]) -> usize {
    let exported = AtomicU64::new(0);
    thread::scope(|s| {
        for n in 0..THREAD_COUNT {
            let exported = &exported;
            s.spawn(move || {
                let count = map.export(n, |kmer, count| {
                    let key = kmer[0] as usize;
                    assert!(key < unique);
                    in_hash[key].fetch_add(count as u64, Ordering::Relaxed);
                });
                exported.fetch_add(count as u64, Ordering::Relaxed);
            });
        }
    });
    exported.load(Ordering::Relaxed) as usize
}

fn zeroed_u32(len: usize) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(0)).collect()
}

fn zeroed_u64(len: usize) -> Vec<AtomicU64> {
    (0..len).map(|_| AtomicU64::new(0)).collect()
}

/// Cross-checks the in-map and spilled tallies after a run over `unique`
/// keys, `overflowing` telling whether the pool was oversubscribed.
fn check_results(
    map: &KmerHashMap,
    unique: usize,
    out_of_hash: &[AtomicU32],
    overflowing: bool,
) {
    let in_hash = zeroed_u64(unique);
    let exported = export_all_kmers(map, unique, &in_hash);

    let max_key_count = map.max_key_count();
    if overflowing {
        // At freeze time each thread may strand its pre-fetched node, and a
        // lost insert race abandons one more; allow a little slack for both.
        assert!(
            exported > max_key_count - THREAD_COUNT * 4,
            "used nodes: {exported}, max key count: {max_key_count}"
        );
    }
    assert!(exported <= max_key_count);

    for key in 0..unique {
        let counted = in_hash[key].load(Ordering::Relaxed);
        let spilled = out_of_hash[key].load(Ordering::Relaxed) as u64;

        assert_eq!(
            counted + spilled,
            (THREAD_COUNT * 2) as u64,
            "key {key}: in hash {counted}, out of hash {spilled}"
        );

        if overflowing {
            // A key is either fully counted or fully spilled, never split:
            // once present, later adds always increment.
            assert!(
                counted == 0 || spilled == 0,
                "key {key}: in hash {counted}, out of hash {spilled}"
            );
        } else {
            assert_eq!(spilled, 0, "key {key} spilled without overflow");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn oversubscribed_pool_freezes_and_spills() {
    let (_budget, map) = new_map(1_000_000);
    let unique = map.max_key_count() * 2;
    let out_of_hash = zeroed_u32(unique);

    add_all_kmers(&map, unique, &out_of_hash);
    check_results(&map, unique, &out_of_hash, true);
}

#[test]
fn half_filled_pool_never_spills() {
    let (_budget, map) = new_map(1_000_000);
    let unique = map.max_key_count() / 2;
    let out_of_hash = zeroed_u32(unique);

    add_all_kmers(&map, unique, &out_of_hash);
    check_results(&map, unique, &out_of_hash, false);
}

/// With one table slot every key shares a single collision chain.
#[test]
fn single_chain_table_still_counts_correctly() {
    let budget = MemBudget::new(30_000);
    let mut map = KmerHashMap::new(&budget, K, THREAD_COUNT);
    map.set_table_capacity(1);

    let unique = map.max_key_count() * 2;
    let out_of_hash = zeroed_u32(unique);

    add_all_kmers(&map, unique, &out_of_hash);
    check_results(&map, unique, &out_of_hash, true);
}

/// `clear` rewinds the slabs and unlocks the keys between passes.
#[test]
fn clear_resets_the_map_between_passes() {
    let (_budget, mut map) = new_map(1_000_000);
    let unique = map.max_key_count() * 2;

    for _ in 0..3 {
        let scratch = zeroed_u32(unique);
        add_all_kmers(&map, unique, &scratch);
        map.clear();
    }

    let out_of_hash = zeroed_u32(unique);
    add_all_kmers(&map, unique, &out_of_hash);
    check_results(&map, unique, &out_of_hash, true);
}

/// Once a thread has observed the freeze, novel keys are rejected but
/// existing keys still increment.
#[test]
fn freeze_rejects_novel_keys_only() {
    let budget = MemBudget::new(30_000);
    let map = KmerHashMap::new(&budget, K, 1);

    assert!(map.add_kmer(0, &[7]));
    assert!(map.add_kmer(0, &[7]));

    map.lock_keys();

    assert!(!map.add_kmer(0, &[8]), "novel key must be rejected");
    assert!(map.add_kmer(0, &[7]), "existing key must still count");
    assert!(!map.add_kmer(0, &[9]));

    map.finish_adding_kmers(0);

    let mut counts = Vec::new();
    map.export(0, |kmer, count| counts.push((kmer[0], count)));
    assert_eq!(counts, vec![(7, 3 as Count)]);
}

/// Export visits only committed nodes and reports per-block tallies.
#[test]
fn export_reports_exact_counts() {
    let (_budget, map) = new_map(1_000_000);

    for _ in 0..5 {
        assert!(map.add_kmer(2, &[42]));
    }
    assert!(map.add_kmer(2, &[43]));

    let mut seen = Vec::new();
    let exported = map.export(2, |kmer, count| seen.push((kmer[0], count)));
    assert_eq!(exported, 2);
    assert_eq!(seen, vec![(42, 5), (43, 1)]);

    for n in [0, 1, 3] {
        assert_eq!(map.export(n, |_, _| panic!("block {n} should be empty")), 0);
    }
}
