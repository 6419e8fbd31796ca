//! Writer stage: drains the write buffer queue onto disk.
//!
//! A single writer thread serves two destinations: result-record buffers are
//! appended raw to the result file, super-k-mer buffers are framed with a
//! `u32` length and appended to the pass's temporary spill file. The spill
//! file's final size tells the driver whether another pass is needed.

use std::fs::File;
use std::io::{Seek, Write};

use crate::buffer::{BufferKind, BufferQueue};
use crate::header::Header;
use crate::util::file_error_exit;

pub struct FileWriter {
    output_file_name: String,
    output_file: File,
}

impl FileWriter {
    /// Creates the result file and writes its header. Open or write failures
    /// are fatal.
    pub fn new(output_file_name: &str, header: Option<&Header>) -> Self {
        let mut output_file = match File::create(output_file_name) {
            Ok(file) => file,
            Err(_) => file_error_exit(output_file_name, "Open", None),
        };

        if let Some(header) = header {
            if header.write_to(&mut output_file).is_err() {
                file_error_exit(output_file_name, "Write header", None);
            }
        }

        FileWriter {
            output_file_name: output_file_name.to_owned(),
            output_file,
        }
    }

    /// Drains `queue` for one pass, spilling into `tmp_file_name`. Returns
    /// the spill file's size in bytes; 0 means nothing overflowed this pass.
    pub fn work(&mut self, queue: &BufferQueue, tmp_file_name: &str) -> u64 {
        let mut tmp_file = match File::create(tmp_file_name) {
            Ok(file) => file,
            Err(_) => file_error_exit(tmp_file_name, "Open", None),
        };

        while let Some(buffer) = queue.dequeue_filled() {
            match buffer.kind {
                BufferKind::SuperKmer => {
                    let frame_len = buffer.len as u32;
                    if tmp_file.write_all(&frame_len.to_le_bytes()).is_err()
                        || tmp_file.write_all(buffer.filled()).is_err()
                    {
                        file_error_exit(tmp_file_name, "Write", None);
                    }
                }
                BufferKind::Kmer => {
                    if self.output_file.write_all(buffer.filled()).is_err() {
                        file_error_exit(&self.output_file_name, "Write", None);
                    }
                }
                BufferKind::Fasta | BufferKind::Fastq => unreachable!(),
            }

            queue.recycle_blank(buffer);
        }

        match tmp_file.stream_position() {
            Ok(size) => size,
            Err(_) => file_error_exit(tmp_file_name, "Getting size of", None),
        }
    }
}
