//! Reader stage: streams input files into record-aligned buffers.
//!
//! One [`FileReader`] runs per reader thread and walks its share of the input
//! files sequentially. FASTA/FASTQ files are consumed through a carry-over
//! scheme: before a full buffer is published, the tail of the last (possibly
//! incomplete) record is moved into the next buffer, so processors never see
//! half a record. Spill files are consumed frame by frame, one frame per
//! buffer.
//!
//! Gzip input is inflated through a streaming decoder that accepts
//! concatenated gzip members.

use std::fs::File;
use std::io::{self, Read};

use flate2::read::MultiGzDecoder;
use tracing::debug;

use crate::buffer::{Buffer, BufferKind, BufferQueue};
use crate::codec::is_base;
use crate::util::file_error_exit;

/// Format of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Fasta,
    Fastq,
    /// Internal spill file produced by a previous pass.
    SuperKmer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
}

/// The set of files one reader thread is responsible for in one pass.
#[derive(Debug, Clone)]
pub struct FileInput {
    pub files: Vec<String>,
    pub kind: FileKind,
    pub compression: Compression,
}

/// Per-thread reader worker for one pass.
pub struct FileReader<'a> {
    k: usize,
    input: &'a FileInput,
    queue: &'a BufferQueue,
    /// Staging capacity for the gzip decoder's compressed input.
    gz_buffer_size: usize,
    file_name: String,
}

impl<'a> FileReader<'a> {
    pub fn new(k: usize, input: &'a FileInput, queue: &'a BufferQueue, gz_buffer_size: usize) -> Self {
        FileReader {
            k,
            input,
            queue,
            gz_buffer_size,
            file_name: String::new(),
        }
    }

    /// Reads every assigned file, publishing filled buffers as it goes.
    pub fn work(&mut self) {
        for file_name in self.input.files.clone() {
            self.file_name = file_name;
            debug!("Start reading file {}", self.file_name);

            match self.input.kind {
                FileKind::Fasta | FileKind::Fastq => self.process_reads_file(),
                FileKind::SuperKmer => self.process_super_kmer_file(),
            }

            debug!("Finish reading file {}", self.file_name);
        }
    }

    fn buffer_kind(&self) -> BufferKind {
        match self.input.kind {
            FileKind::Fasta => BufferKind::Fasta,
            FileKind::Fastq => BufferKind::Fastq,
            FileKind::SuperKmer => BufferKind::SuperKmer,
        }
    }

    fn request_buffer(&self) -> Box<Buffer> {
        let mut buffer = self.queue.get_blank();
        buffer.kind = self.buffer_kind();
        buffer
    }

    fn open_file(&self) -> File {
        match File::open(&self.file_name) {
            Ok(file) => file,
            Err(_) => file_error_exit(&self.file_name, "Open", None),
        }
    }

    /// Fills `buf` completely unless the source ends first. Returns the byte
    /// count delivered and whether end of file was reached.
    fn read_full(&self, reader: &mut impl Read, buf: &mut [u8]) -> (usize, bool) {
        let mut got = 0;
        while got < buf.len() {
            match reader.read(&mut buf[got..]) {
                Ok(0) => return (got, true),
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    let msg = match self.input.compression {
                        Compression::Gzip => Some("gzip stream error"),
                        Compression::Plain => None,
                    };
                    file_error_exit(&self.file_name, "Read", msg);
                }
            }
        }
        (got, false)
    }

    fn process_reads_file(&mut self) {
        let file = self.open_file();
        let mut source: Box<dyn Read> = match self.input.compression {
            Compression::Plain => Box::new(file),
            // MultiGzDecoder restarts on member boundaries, so concatenated
            // gzip streams decode as their concatenated content.
            Compression::Gzip => Box::new(MultiGzDecoder::new(io::BufReader::with_capacity(
                self.gz_buffer_size,
                file,
            ))),
        };

        let mut current = self.request_buffer();

        loop {
            let len = current.len;
            let (out_size, end_of_file) = self.read_full(&mut source, &mut current.data[len..]);
            current.len += out_size;

            if end_of_file {
                break;
            }

            let mut extra = self.request_buffer();
            match self.input.kind {
                FileKind::Fasta => self.modify_fasta_buffers(&mut current, &mut extra),
                FileKind::Fastq => self.modify_fastq_buffers(&mut current, &mut extra),
                FileKind::SuperKmer => unreachable!(),
            }

            self.queue.enqueue_filled(current);
            current = extra;
        }

        self.queue.enqueue_filled(current);
    }

    /// Moves the trailing `extra_size` bytes of `current` to the front of `extra`.
    fn transfer_data(current: &mut Buffer, extra: &mut Buffer, extra_size: usize) {
        current.len -= extra_size;
        let tail = current.len;
        extra.data[..extra_size].copy_from_slice(&current.data[tail..tail + extra_size]);
        extra.len = extra_size;
    }

    /// Carries the last (possibly partial) FASTA record over to `extra`.
    ///
    /// When the record's tail does not fit in a whole buffer, a minimal
    /// record is synthesized instead: a bare `>` header plus the last K−1
    /// valid bases, which keeps the rolling k-mer window seeded across the
    /// buffer boundary.
    fn modify_fasta_buffers(&self, current: &mut Buffer, extra: &mut Buffer) {
        let mut extra_size = 0;
        for n in (0..current.len).rev() {
            extra_size += 1;
            if current.data[n] == b'>' {
                break;
            }
        }

        if extra_size < extra.size() {
            Self::transfer_data(current, extra, extra_size);
            return;
        }

        extra.data[0] = b'>';
        extra.data[1] = b'\n';

        let mut nt_count = 0;
        for n in (0..current.len).rev() {
            let ch = current.data[n];
            if is_base(ch) {
                extra.data[self.k - nt_count] = ch;
                nt_count += 1;
            }
            if nt_count == self.k - 1 {
                break;
            }
        }

        if nt_count != self.k - 1 {
            file_error_exit(&self.file_name, "Parse", Some("Too many unexpected characters"));
        }

        extra.len = self.k + 1;
    }

    /// Carries the last (possibly partial) FASTQ record over to `extra`.
    /// A record longer than a whole buffer cannot be salvaged.
    fn modify_fastq_buffers(&self, current: &mut Buffer, extra: &mut Buffer) {
        let mut extra_size = 0;
        for n in (0..current.len).rev() {
            extra_size += 1;
            if current.data[n] == b'@' {
                break;
            }
        }

        if extra_size >= extra.size() {
            file_error_exit(&self.file_name, "Parse", Some("Sequence may be too long"));
        }

        Self::transfer_data(current, extra, extra_size);
    }

    fn process_super_kmer_file(&mut self) {
        let mut file = self.open_file();

        loop {
            let mut len_bytes = [0u8; 4];
            let (got, _) = self.read_full(&mut file, &mut len_bytes);
            if got == 0 {
                break;
            }
            if got < len_bytes.len() {
                file_error_exit(&self.file_name, "Parse", Some("File is truncated"));
            }
            let frame_len = u32::from_le_bytes(len_bytes) as usize;

            let mut buffer = self.request_buffer();
            assert!(frame_len <= buffer.size());

            let (got, _) = self.read_full(&mut file, &mut buffer.data[..frame_len]);
            if got < frame_len {
                file_error_exit(&self.file_name, "Parse", Some("File is truncated"));
            }
            buffer.len = frame_len;

            self.queue.enqueue_filled(buffer);
        }
    }
}
