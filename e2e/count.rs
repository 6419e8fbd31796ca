//! End-to-end counting runs: whole pipeline against real files, result
//! files parsed back through the header/codec layer, plus the `histo` and
//! `dump` tools over fresh results.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use tempfile::TempDir;

use ktally::codec::{count_field_size, kmer_width_by_unit_size};
use ktally::counter::{CountConfig, KmerCounter};
use ktally::dump::decode_kmer;
use ktally::header::Header;
use ktally::mem::MemBudget;
use ktally::processor::OutputParams;
use ktally::reader::{Compression, FileKind};

const BUFFER_SIZE: usize = 4096;

struct RunOptions {
    k: usize,
    mem_limit: usize,
    processing_threads: usize,
    count_max: u32,
    filter_min: u32,
    filter_max: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            k: 3,
            mem_limit: 2_000_000,
            processing_threads: 2,
            count_max: 255,
            filter_min: 1,
            filter_max: u32::MAX,
        }
    }
}

fn run_count(
    dir: &TempDir,
    out_name: &str,
    files: Vec<String>,
    kind: FileKind,
    compression: Compression,
    opts: &RunOptions,
) -> PathBuf {
    let out_path = dir.path().join(out_name);

    let config = CountConfig {
        k: opts.k,
        threads_count: opts.processing_threads + 2,
        reading_threads_count: 1,
        processing_threads_count: opts.processing_threads,
        input_files: files,
        input_kind: kind,
        input_compression: compression,
        output_file_name: out_path.to_string_lossy().into_owned(),
        read_buffer_size: BUFFER_SIZE,
        read_buffers_count: opts.processing_threads * 2,
        write_buffer_size: BUFFER_SIZE,
        write_buffers_count: opts.processing_threads * 2,
        mem_limit: opts.mem_limit,
        output: OutputParams {
            count_max: opts.count_max,
            filter_min: opts.filter_min,
            filter_max: opts.filter_max,
        },
    };

    let budget = MemBudget::new(opts.mem_limit);
    let mut counter = KmerCounter::new(&budget, config);
    counter.work();
    drop(counter);

    out_path
}

/// Parses a result file into `sequence → count`.
fn read_result(path: &Path) -> (Header, HashMap<String, u64>) {
    let mut file = File::open(path).unwrap();
    let header = Header::read_from(&mut file).unwrap();

    let mut body = Vec::new();
    file.read_to_end(&mut body).unwrap();

    let kmer_size = kmer_width_by_unit_size(header.k as usize, 1);
    let count_size = count_field_size(header.count_max);
    let record_size = kmer_size + count_size;
    assert_eq!(body.len() % record_size, 0, "truncated result file");

    let mut counts = HashMap::new();
    let mut sequence = Vec::new();
    for record in body.chunks_exact(record_size) {
        decode_kmer(&record[..kmer_size], header.k as usize, &mut sequence);
        let mut padded = [0u8; 8];
        padded[..count_size].copy_from_slice(&record[kmer_size..]);
        let count = u64::from_le_bytes(padded);
        let previous = counts.insert(String::from_utf8(sequence.clone()).unwrap(), count);
        assert!(previous.is_none(), "duplicate k-mer record");
    }

    (header, counts)
}

fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

fn gzip_bytes(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

fn expected_counts(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
    pairs.iter().map(|(s, c)| (s.to_string(), *c)).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Counting correctness
// ─────────────────────────────────────────────────────────────────────────────

/// Two short FASTA records, K = 3, no filtering: canonical counts by hand.
#[test]
fn short_fasta_counts_canonical_kmers() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "reads.fa", b">1\nACGTA\n>2\nTCGAT\n");

    let out = run_count(
        &dir,
        "result",
        vec![file],
        FileKind::Fasta,
        Compression::Plain,
        &RunOptions::default(),
    );

    let (header, counts) = read_result(&out);
    assert_eq!(header.k, 3);
    assert_eq!(header.count_max, 255);
    assert_eq!(header.filter_min, 1);

    // ACGTA → ACG CGT GTA; TCGAT → TCG CGA GAT. Canonical forms:
    // ACG↔CGT collapse onto ACG, TCG↔CGA onto CGA, GAT onto ATC.
    assert_eq!(
        counts,
        expected_counts(&[("ACG", 2), ("CGA", 2), ("GTA", 1), ("ATC", 1)])
    );
}

/// The same content counted from a plain and a gzipped file produces
/// byte-identical result files.
#[test]
fn gzip_input_matches_plain_input() {
    let content = b"@1\nACGTACGT\n+\n--------\n@2\nTTGCAACG\n+\n--------\n";
    let dir = TempDir::new().unwrap();

    let opts = RunOptions {
        k: 4,
        processing_threads: 1,
        ..RunOptions::default()
    };

    let plain_file = write_file(&dir, "reads.fq", content);
    let plain_out = run_count(
        &dir,
        "plain_result",
        vec![plain_file],
        FileKind::Fastq,
        Compression::Plain,
        &opts,
    );

    let gz_file = write_file(&dir, "reads.fq.gz", &gzip_bytes(content));
    let gz_out = run_count(
        &dir,
        "gz_result",
        vec![gz_file],
        FileKind::Fastq,
        Compression::Gzip,
        &opts,
    );

    assert_eq!(
        std::fs::read(&plain_out).unwrap(),
        std::fs::read(&gz_out).unwrap()
    );
}

/// A file made of two concatenated gzip streams counts like the
/// concatenation of their contents.
#[test]
fn concatenated_gzip_streams_count_fully() {
    let part_1: &[u8] = b">1\nAAAAA\n";
    let part_2: &[u8] = b">2\nAAAAA\n";
    let dir = TempDir::new().unwrap();

    let mut catenated = gzip_bytes(part_1);
    catenated.extend_from_slice(&gzip_bytes(part_2));
    let file = write_file(&dir, "cat.fa.gz", &catenated);

    let opts = RunOptions {
        k: 5,
        ..RunOptions::default()
    };
    let out = run_count(
        &dir,
        "result",
        vec![file],
        FileKind::Fasta,
        Compression::Gzip,
        &opts,
    );

    let (_, counts) = read_result(&out);
    assert_eq!(counts, expected_counts(&[("AAAAA", 2)]));
}

// ─────────────────────────────────────────────────────────────────────────────
// Overflow / multi-pass
// ─────────────────────────────────────────────────────────────────────────────

fn random_sequence(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            b"ACGT"[(x % 4) as usize]
        })
        .collect()
}

/// Shrinking the memory budget until several passes are needed must not
/// change the counted result.
#[test]
fn multi_pass_run_matches_single_pass_run() {
    let mut content = b">long\n".to_vec();
    content.extend_from_slice(&random_sequence(4000, 0x5EED));
    content.push(b'\n');

    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "reads.fa", &content);

    let roomy = RunOptions {
        k: 21,
        mem_limit: 4_000_000,
        ..RunOptions::default()
    };
    let single_out = run_count(
        &dir,
        "single_result",
        vec![file.clone()],
        FileKind::Fasta,
        Compression::Plain,
        &roomy,
    );

    // ~80 KB leaves room for roughly a thousand nodes against ~4000 unique
    // k-mers, so the map must freeze and spill repeatedly.
    let tight = RunOptions {
        k: 21,
        mem_limit: 80_000,
        ..RunOptions::default()
    };
    let multi_out = run_count(
        &dir,
        "multi_result",
        vec![file],
        FileKind::Fasta,
        Compression::Plain,
        &tight,
    );

    let (_, single_counts) = read_result(&single_out);
    let (_, multi_counts) = read_result(&multi_out);

    assert!(!single_counts.is_empty());
    assert_eq!(single_counts, multi_counts);

    // The spill files must be gone after the run.
    for suffix in ["_tmp_0", "_tmp_1"] {
        let spill = dir.path().join(format!("multi_result{suffix}"));
        assert!(!spill.exists(), "leftover spill file {spill:?}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Count clamping and filters
// ─────────────────────────────────────────────────────────────────────────────

fn saturation_input(dir: &TempDir) -> String {
    let mut content = Vec::new();
    for i in 0..300 {
        content.extend_from_slice(format!(">{i}\nACGTC\n").as_bytes());
    }
    write_file(dir, "sat.fa", &content)
}

#[test]
fn counts_clamp_to_count_max() {
    let dir = TempDir::new().unwrap();
    let file = saturation_input(&dir);

    for (count_max, expected) in [(255u32, 255u64), (300, 300), (u32::MAX, 300)] {
        let opts = RunOptions {
            k: 5,
            count_max,
            ..RunOptions::default()
        };
        let out = run_count(
            &dir,
            &format!("result_{count_max}"),
            vec![file.clone()],
            FileKind::Fasta,
            Compression::Plain,
            &opts,
        );

        let (header, counts) = read_result(&out);
        assert_eq!(header.count_max, count_max as u64);
        assert_eq!(counts, expected_counts(&[("ACGTC", expected)]));
    }
}

#[test]
fn filters_bound_exported_counts() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "reads.fa", b">1\nAAACG\n>2\nAAACG\n>3\nGGGTC\n");

    // filter_min = 2 keeps only the repeated k-mer.
    let opts = RunOptions {
        k: 5,
        filter_min: 2,
        ..RunOptions::default()
    };
    let out = run_count(
        &dir,
        "min_result",
        vec![file.clone()],
        FileKind::Fasta,
        Compression::Plain,
        &opts,
    );
    let (_, counts) = read_result(&out);
    assert_eq!(counts, expected_counts(&[("AAACG", 2)]));

    // filter_max = 1 keeps only the singleton (GGGTC canonicalizes to GACCC).
    let opts = RunOptions {
        k: 5,
        filter_min: 1,
        filter_max: 1,
        ..RunOptions::default()
    };
    let out = run_count(
        &dir,
        "max_result",
        vec![file],
        FileKind::Fasta,
        Compression::Plain,
        &opts,
    );
    let (_, counts) = read_result(&out);
    assert_eq!(counts, expected_counts(&[("GACCC", 1)]));
}

// ─────────────────────────────────────────────────────────────────────────────
// Post-processing tools
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn histo_and_dump_read_a_fresh_result() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "reads.fa", b">1\nACGTA\n>2\nTCGAT\n");

    let out = run_count(
        &dir,
        "result",
        vec![file],
        FileKind::Fasta,
        Compression::Plain,
        &RunOptions::default(),
    );
    let out_name = out.to_string_lossy().into_owned();

    let histo_path = dir.path().join("histo.txt");
    ktally::histo::run(&out_name, &histo_path.to_string_lossy()).unwrap();
    let histo = std::fs::read_to_string(&histo_path).unwrap();
    // Two singleton k-mers, two doubletons.
    assert_eq!(histo, "1\t2\n2\t2\n");

    let dump_path = dir.path().join("dump.txt");
    ktally::dump::run(&out_name, &dump_path.to_string_lossy()).unwrap();
    let dump = std::fs::read_to_string(&dump_path).unwrap();

    let mut lines: Vec<&str> = dump.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["ACG\t2", "ATC\t1", "CGA\t2", "GTA\t1"]);
}
