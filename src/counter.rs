//! Pipeline driver: wires the stages together and runs passes until the
//! spill file comes back empty.
//!
//! Each pass spawns R reader threads, P extract threads and one writer
//! thread; joins them in dependency order; reruns the P threads as export
//! workers; then inspects the spill file size. A non-empty spill file
//! becomes the (single) input of the next pass, alternating between two
//! temporary file names so the pass being read is never the pass being
//! written.

use std::thread;

use tracing::{debug, info, warn};

use crate::buffer::BufferQueue;
use crate::hash_map::KmerHashMap;
use crate::header::Header;
use crate::mem::MemBudget;
use crate::processor::{BufferSink, ExportStats, ExportWorker, ExtractWorker, OutputParams};
use crate::reader::{Compression, FileInput, FileKind, FileReader};
use crate::writer::FileWriter;

/// Fully resolved `count` configuration.
#[derive(Debug, Clone)]
pub struct CountConfig {
    pub k: usize,

    pub threads_count: usize,
    pub reading_threads_count: usize,
    pub processing_threads_count: usize,

    pub input_files: Vec<String>,
    pub input_kind: FileKind,
    pub input_compression: Compression,

    pub output_file_name: String,

    pub read_buffer_size: usize,
    pub read_buffers_count: usize,
    pub write_buffer_size: usize,
    pub write_buffers_count: usize,

    pub mem_limit: usize,

    pub output: OutputParams,
}

pub struct KmerCounter {
    config: CountConfig,
    read_queue: BufferQueue,
    write_queue: BufferQueue,
    file_writer: FileWriter,
    hash_map: KmerHashMap,
}

impl KmerCounter {
    /// Builds every persistent structure. The hash map sizes itself from
    /// whatever budget remains after the queues.
    pub fn new(budget: &MemBudget, config: CountConfig) -> Self {
        let header = Header {
            k: config.k as u64,
            count_max: config.output.count_max as u64,
            filter_min: config.output.filter_min as u64,
            filter_max: config.output.filter_max as u64,
        };
        let file_writer = FileWriter::new(&config.output_file_name, Some(&header));

        let read_queue = BufferQueue::new(budget, config.read_buffer_size, config.read_buffers_count);
        let write_queue =
            BufferQueue::new(budget, config.write_buffer_size, config.write_buffers_count);

        let hash_map = KmerHashMap::new(budget, config.k, config.processing_threads_count);

        KmerCounter {
            config,
            read_queue,
            write_queue,
            file_writer,
            hash_map,
        }
    }

    /// Splits the user's input files across the reader threads as evenly as
    /// possible, preserving order.
    fn schedule_files(config: &CountConfig) -> Vec<FileInput> {
        let n = config.reading_threads_count;
        let files_count_for_each = config.input_files.len() / n;
        let remain_files_count = config.input_files.len() % n;

        let mut inputs = Vec::with_capacity(n);
        let mut offset = 0;
        for i in 0..n {
            let count = files_count_for_each + usize::from(i < remain_files_count);
            inputs.push(FileInput {
                files: config.input_files[offset..offset + count].to_vec(),
                kind: config.input_kind,
                compression: config.input_compression,
            });
            offset += count;
        }
        inputs
    }

    /// Runs passes until nothing spills, then logs aggregate statistics.
    pub fn work(&mut self) {
        let KmerCounter {
            config,
            read_queue,
            write_queue,
            file_writer,
            hash_map,
        } = self;

        let mut inputs = Self::schedule_files(config);

        let tmp_file_names = [
            format!("{}_tmp_0", config.output_file_name),
            format!("{}_tmp_1", config.output_file_name),
        ];
        let mut should_delete_tmp_files = [true, false];
        let mut tmp_file_idx = 0usize;

        let mut totals = ExportStats::default();
        let mut pass = 0usize;

        loop {
            pass += 1;
            info!("Pass #{pass} start.");

            read_queue.start_input();
            write_queue.start_input();

            let tmp_file_name = &tmp_file_names[tmp_file_idx];
            let p = config.processing_threads_count;
            let writer = &mut *file_writer;
            let hm = &*hash_map;
            let config = &*config;
            let read_queue = &*read_queue;
            let write_queue = &*write_queue;

            let (tmp_file_size, pass_stats) = thread::scope(|s| {
                let reader_handles: Vec<_> = inputs
                    .iter()
                    .map(|input| {
                        s.spawn(move || {
                            FileReader::new(config.k, input, read_queue, config.read_buffer_size)
                                .work()
                        })
                    })
                    .collect();

                let extract_handles: Vec<_> = (0..p)
                    .map(|i| {
                        s.spawn(move || {
                            ExtractWorker::new(i, config.k, hm, BufferSink::Queue(write_queue))
                                .work(read_queue)
                        })
                    })
                    .collect();

                let writer_handle = s.spawn(move || writer.work(write_queue, tmp_file_name));

                for handle in reader_handles {
                    handle.join().unwrap();
                }
                read_queue.finish_input();

                for handle in extract_handles {
                    handle.join().unwrap();
                }

                let export_handles: Vec<_> = (0..p)
                    .map(|i| {
                        s.spawn(move || {
                            ExportWorker::new(
                                i,
                                config.k,
                                config.output,
                                hm,
                                BufferSink::Queue(write_queue),
                            )
                            .work()
                        })
                    })
                    .collect();

                let mut pass_stats = ExportStats::default();
                for handle in export_handles {
                    pass_stats += handle.join().unwrap();
                }
                write_queue.finish_input();

                let tmp_file_size = writer_handle.join().unwrap();

                (tmp_file_size, pass_stats)
            });

            totals += pass_stats;

            debug!("Tmp file size: {tmp_file_size}");

            if tmp_file_size == 0 {
                break;
            }

            inputs = vec![FileInput {
                files: vec![tmp_file_names[tmp_file_idx].clone()],
                kind: FileKind::SuperKmer,
                compression: Compression::Plain,
            }];

            tmp_file_idx = (tmp_file_idx + 1) % 2;
            should_delete_tmp_files[tmp_file_idx] = true;

            hash_map.clear();
        }

        for (i, name) in tmp_file_names.iter().enumerate() {
            if should_delete_tmp_files[i] && std::fs::remove_file(name).is_err() {
                warn!("Delete file failed: {name}");
            }
        }

        info!("Total K-mers count: {}", totals.total_kmers);
        info!("Unique K-mers count: {}", totals.unique_kmers);
        info!("Exported unique K-mers count: {}", totals.exported_unique_kmers);
    }
}
