//! Criterion benchmarks for the rolling canonical extraction hot loop and
//! the hash counter's insert/increment path.
//!
//! Run with:
//!   cargo bench --bench extract

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ktally::hash_map::KmerHashMap;
use ktally::mem::MemBudget;
use ktally::processor::{extract_kmers_from_read, ExtractUnit};

fn synthetic_read(len: usize) -> Vec<u8> {
    let mut x = 0x5EED_1234_u64 | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            b"ACGT"[(x % 4) as usize]
        })
        .collect()
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");
    let read = synthetic_read(1 << 20);

    for &k in &[21usize, 31, 55] {
        group.throughput(Throughput::Bytes(read.len() as u64));
        group.bench_with_input(BenchmarkId::new("canonical_roll", k), &read, |b, read| {
            let mut extract = ExtractUnit::new(k);
            b.iter(|| {
                let mut acc = 0u64;
                extract_kmers_from_read(&mut extract, read, |eu, _, _| {
                    acc = acc.wrapping_add(eu.canonical()[0]);
                });
                acc
            })
        });
    }

    group.finish();
}

fn bench_hash_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_map");
    let read = synthetic_read(1 << 18);
    let k = 21;

    group.throughput(Throughput::Bytes(read.len() as u64));
    group.bench_function("add_kmer_single_thread", |b| {
        let budget = MemBudget::new(64_000_000);
        let mut map = KmerHashMap::new(&budget, k, 1);
        let mut extract = ExtractUnit::new(k);
        b.iter(|| {
            map.clear();
            extract_kmers_from_read(&mut extract, &read, |eu, _, _| {
                map.add_kmer(0, eu.canonical());
            });
        })
    });

    group.finish();
}

criterion_group!(benches, bench_extract, bench_hash_map);
criterion_main!(benches);
