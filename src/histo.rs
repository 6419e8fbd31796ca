//! `histo` tool: count-frequency histogram of a result file.
//!
//! Streams the record section in large chunks, tallies how many distinct
//! k-mers carry each count value, and writes `count\tfrequency` lines in
//! ascending count order. Counts below a dense-array threshold are tallied
//! in place; rarer, larger counts go to an ordered overflow map.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::codec::{count_field_size, kmer_width_by_unit_size};
use crate::header::Header;

/// Chunk size target for streaming the record section.
const MEM_BLOCK_SIZE_LIMIT: usize = 5_000_000;

/// Counts below this are tallied in a dense array.
const COUNTS_ARRAY_LENGTH: usize = 100_000;

/// Reads as many whole bytes as available, up to `buf.len()`.
fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match file.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

/// Decodes the count field of one record.
pub(crate) fn read_count(bytes: &[u8]) -> u64 {
    let mut padded = [0u8; 8];
    padded[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(padded)
}

pub fn run(result_file_name: &str, histo_file_name: &str) -> Result<()> {
    debug!("Result file name: {result_file_name}");
    debug!("Histo file name: {histo_file_name}");

    let mut file = File::open(result_file_name)
        .with_context(|| format!("Open file error [{result_file_name}]"))?;

    let header = Header::read_from(&mut file)
        .with_context(|| format!("Read header file error [{result_file_name}]"))?;
    debug!(
        "K: {}, count max: {}, filter min: {}, max: {}",
        header.k, header.count_max, header.filter_min, header.filter_max
    );

    let count_size = count_field_size(header.count_max);
    let kmer_size = kmer_width_by_unit_size(header.k as usize, 1);
    let kmer_info_size = kmer_size + count_size;
    let mem_block_size = MEM_BLOCK_SIZE_LIMIT / kmer_info_size * kmer_info_size;

    let mut counts_array = vec![0u64; COUNTS_ARRAY_LENGTH];
    let mut histo_items: BTreeMap<u64, u64> = BTreeMap::new();

    let mut mem_block = vec![0u8; mem_block_size];

    loop {
        let read_size = read_chunk(&mut file, &mut mem_block)
            .with_context(|| format!("Read file error [{result_file_name}]"))?;

        if read_size == 0 {
            break;
        }
        if read_size % kmer_info_size != 0 {
            bail!("Parse file error (file is truncated) [{result_file_name}]");
        }

        for record in mem_block[..read_size].chunks_exact(kmer_info_size) {
            let count = read_count(&record[kmer_size..]);

            if (count as usize) < COUNTS_ARRAY_LENGTH {
                counts_array[count as usize] += 1;
            } else {
                *histo_items.entry(count).or_insert(0) += 1;
            }
        }
    }

    let mut total_kmers_count = 0u64;
    let mut unique_kmers_count = 0u64;

    let out = File::create(histo_file_name)
        .with_context(|| format!("Open file error [{histo_file_name}]"))?;
    let mut out = BufWriter::new(out);

    for (count, &frequency) in counts_array.iter().enumerate() {
        if frequency != 0 {
            total_kmers_count += count as u64 * frequency;
            unique_kmers_count += frequency;
            writeln!(out, "{count}\t{frequency}")
                .with_context(|| format!("Write file error [{histo_file_name}]"))?;
        }
    }
    for (&count, &frequency) in &histo_items {
        total_kmers_count += count * frequency;
        unique_kmers_count += frequency;
        writeln!(out, "{count}\t{frequency}")
            .with_context(|| format!("Write file error [{histo_file_name}]"))?;
    }
    out.flush()
        .with_context(|| format!("Write file error [{histo_file_name}]"))?;

    debug!("Total K-mers count: {total_kmers_count}");
    debug!("Unique K-mers count: {unique_kmers_count}");

    Ok(())
}
