//! Tagged byte buffers and the blank/filled buffer queue pair.
//!
//! A [`BufferQueue`] owns N equally sized buffers. Producers take blanks,
//! fill them and push them onto the filled queue; consumers drain filled
//! buffers and recycle them as blanks. Ownership transfers with the
//! `Box<Buffer>`, so at any moment every buffer is either in one of the two
//! queues or held by exactly one thread.
//!
//! Backpressure is implicit: a producer that outruns its consumers stalls in
//! [`BufferQueue::get_blank`] until a buffer comes back.

use std::sync::{Condvar, Mutex};

use crate::mem::{MemBudget, Reservation};
use crate::queue::RingQueue;

/// What the bytes in a filled buffer are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Raw FASTA text, record-aligned by the reader.
    Fasta,
    /// Raw FASTQ text, record-aligned by the reader.
    Fastq,
    /// One spill frame: `u32 super_kmer_count` + packed super-k-mers.
    SuperKmer,
    /// Result records: packed k-mer bytes + count field each.
    Kmer,
}

/// A fixed-size byte buffer with a fill level and a content tag.
pub struct Buffer {
    pub data: Box<[u8]>,
    pub len: usize,
    pub kind: BufferKind,
}

impl Buffer {
    pub fn new(size: usize) -> Self {
        Buffer {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
            kind: BufferKind::Fasta,
        }
    }

    /// Total capacity in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Unused capacity behind the fill level.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// The filled prefix.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

struct FilledSide {
    queue: RingQueue<Box<Buffer>>,
    input_finished: bool,
}

/// Two paired bounded queues (blank ↔ filled) carrying tagged byte buffers.
pub struct BufferQueue {
    blank: Mutex<RingQueue<Box<Buffer>>>,
    filled: Mutex<FilledSide>,
    has_blank: Condvar,
    has_filled: Condvar,
    buffers_count: usize,
    _mem: Reservation,
}

impl BufferQueue {
    /// Allocates `buffers_count` buffers of `buffer_size` bytes, all blank.
    /// The buffer memory is charged to `budget`.
    pub fn new(budget: &MemBudget, buffer_size: usize, buffers_count: usize) -> Self {
        assert!(buffer_size > 0);
        assert!(buffers_count > 0);

        let mem = budget.reserve(buffer_size * buffers_count, "buffer queue buffers");

        let mut blank = RingQueue::new(buffers_count);
        for _ in 0..buffers_count {
            blank
                .enqueue(Box::new(Buffer::new(buffer_size)))
                .unwrap_or_else(|_| unreachable!());
        }

        BufferQueue {
            blank: Mutex::new(blank),
            filled: Mutex::new(FilledSide {
                queue: RingQueue::new(buffers_count),
                input_finished: true,
            }),
            has_blank: Condvar::new(),
            has_filled: Condvar::new(),
            buffers_count,
            _mem: mem,
        }
    }

    pub fn buffers_count(&self) -> usize {
        self.buffers_count
    }

    /// Number of buffers currently sitting in the blank queue.
    pub fn blank_len(&self) -> usize {
        self.blank.lock().unwrap().len()
    }

    /// Number of buffers currently sitting in the filled queue.
    pub fn filled_len(&self) -> usize {
        self.filled.lock().unwrap().queue.len()
    }

    /// Marks the filled side as live: consumers block instead of observing
    /// end of input. Called by the driver before producers start.
    pub fn start_input(&self) {
        let mut filled = self.filled.lock().unwrap();
        filled.input_finished = false;
    }

    /// Marks the filled side as finished and wakes every blocked consumer.
    /// Called by the driver after all producers have been joined.
    pub fn finish_input(&self) {
        let mut filled = self.filled.lock().unwrap();
        filled.input_finished = true;
        self.has_filled.notify_all();
    }

    /// Blocks until a blank buffer is available and returns it with `len == 0`.
    pub fn get_blank(&self) -> Box<Buffer> {
        let mut blank = self.blank.lock().unwrap();
        loop {
            if let Some(mut buffer) = blank.dequeue() {
                buffer.len = 0;
                return buffer;
            }
            blank = self.has_blank.wait(blank).unwrap();
        }
    }

    /// Publishes a filled buffer to consumers. Never blocks: the filled queue
    /// can hold every buffer of the pool.
    pub fn enqueue_filled(&self, buffer: Box<Buffer>) {
        assert!(buffer.len <= buffer.size());
        let mut filled = self.filled.lock().unwrap();
        filled
            .queue
            .enqueue(buffer)
            .unwrap_or_else(|_| panic!("filled queue over capacity"));
        self.has_filled.notify_one();
    }

    /// Blocks until a filled buffer is available, or returns `None` once
    /// input is finished and the filled queue has drained.
    pub fn dequeue_filled(&self) -> Option<Box<Buffer>> {
        let mut filled = self.filled.lock().unwrap();
        loop {
            if let Some(buffer) = filled.queue.dequeue() {
                return Some(buffer);
            }
            if filled.input_finished {
                return None;
            }
            filled = self.has_filled.wait(filled).unwrap();
        }
    }

    /// Returns a drained buffer to the blank queue and wakes one producer.
    pub fn recycle_blank(&self, buffer: Box<Buffer>) {
        let mut blank = self.blank.lock().unwrap();
        blank
            .enqueue(buffer)
            .unwrap_or_else(|_| panic!("blank queue over capacity"));
        self.has_blank.notify_one();
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        // All buffers must have come home before teardown.
        debug_assert!(self.blank.lock().unwrap().is_full());
        debug_assert!(self.filled.lock().unwrap().queue.is_empty());
    }
}
