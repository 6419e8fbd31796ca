//! `dump` tool: decodes a result file back to `SEQUENCE\tcount` text lines.

use std::fs::File;
use std::io::{BufWriter, Read, Write};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::codec::{count_field_size, decode_base, kmer_width_by_unit_size};
use crate::header::Header;
use crate::histo::read_count;

const MEM_BLOCK_SIZE_LIMIT: usize = 5_000_000;

/// Expands one packed k-mer into base letters, front base first.
///
/// Record bytes are little-endian within the packed words, so the front of
/// the sequence sits in the high bits of the last byte; the high byte's
/// unused leading code slots are skipped.
pub fn decode_kmer(bytes: &[u8], k: usize, sequence: &mut Vec<u8>) {
    let kmer_width = bytes.len();
    let first_invalid_count = 4 - (k - (kmer_width - 1) * 4);

    sequence.clear();
    for i in 0..kmer_width {
        let code_byte = bytes[kmer_width - 1 - i];
        for n in 0..4 {
            if i == 0 && n < first_invalid_count {
                continue;
            }
            sequence.push(decode_base((code_byte >> ((4 - n - 1) * 2)) & 0x3));
        }
    }
}

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

pub fn run(result_file_name: &str, dump_file_name: &str) -> Result<()> {
    debug!("Result file name: {result_file_name}");
    debug!("Dump file name: {dump_file_name}");

    let mut file = File::open(result_file_name)
        .with_context(|| format!("Open file error [{result_file_name}]"))?;

    let header = Header::read_from(&mut file)
        .with_context(|| format!("Read header file error [{result_file_name}]"))?;
    debug!(
        "K: {}, count max: {}, filter min: {}, max: {}",
        header.k, header.count_max, header.filter_min, header.filter_max
    );

    let out = File::create(dump_file_name)
        .with_context(|| format!("Open file error [{dump_file_name}]"))?;
    let mut out = BufWriter::new(out);

    let count_size = count_field_size(header.count_max);
    let kmer_size = kmer_width_by_unit_size(header.k as usize, 1);
    let kmer_info_size = kmer_size + count_size;
    let mem_block_size = MEM_BLOCK_SIZE_LIMIT / kmer_info_size * kmer_info_size;

    let mut mem_block = vec![0u8; mem_block_size];
    let mut sequence = Vec::with_capacity(header.k as usize);

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
            decode_kmer(&record[..kmer_size], header.k as usize, &mut sequence);
            let count = read_count(&record[kmer_size..]);

            out.write_all(&sequence)
                .with_context(|| format!("Write file error [{dump_file_name}]"))?;
            writeln!(out, "\t{count}")
                .with_context(|| format!("Write file error [{dump_file_name}]"))?;
        }
    }

    out.flush()
        .with_context(|| format!("Write file error [{dump_file_name}]"))?;

    Ok(())
}
