//! Buffer queue contract: pool conservation, blocking hand-off, FIFO order
//! and the finish-input wake-up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ktally::buffer::{BufferKind, BufferQueue};
use ktally::mem::MemBudget;

fn queue(buffer_size: usize, buffers_count: usize) -> (MemBudget, BufferQueue) {
    let budget = MemBudget::new(1_000_000);
    let queue = BufferQueue::new(&budget, buffer_size, buffers_count);
    (budget, queue)
}

// ─────────────────────────────────────────────────────────────────────────────
// Construction and conservation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn all_buffers_start_blank() {
    let (_budget, bq) = queue(64, 8);
    assert_eq!(bq.buffers_count(), 8);
    assert_eq!(bq.blank_len(), 8);
    assert_eq!(bq.filled_len(), 0);
}

#[test]
fn buffer_memory_is_charged_to_the_budget() {
    let budget = MemBudget::new(1_000_000);
    let bq = BufferQueue::new(&budget, 100, 10);
    assert_eq!(budget.available(), 1_000_000 - 1000);
    drop(bq);
    assert_eq!(budget.available(), 1_000_000);
}

/// |blank| + |filled| + |in-flight| stays equal to the pool size.
#[test]
fn pool_is_conserved_through_a_cycle() {
    let (_budget, bq) = queue(64, 4);

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(bq.get_blank());
    }
    assert_eq!(bq.blank_len() + bq.filled_len() + held.len(), 4);

    for (i, mut buffer) in held.drain(..).enumerate() {
        buffer.kind = BufferKind::Kmer;
        buffer.data[0] = i as u8;
        buffer.len = 1;
        bq.enqueue_filled(buffer);
    }
    assert_eq!(bq.blank_len() + bq.filled_len(), 4);

    // Input was never started, so an empty filled queue reads as drained.
    while let Some(buffer) = bq.dequeue_filled() {
        bq.recycle_blank(buffer);
    }
    assert_eq!(bq.blank_len(), 4);
}

// ─────────────────────────────────────────────────────────────────────────────
// Hand-off semantics
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn get_blank_resets_length() {
    let (_budget, bq) = queue(32, 1);
    let mut buffer = bq.get_blank();
    buffer.len = 17;
    bq.enqueue_filled(buffer);
    let buffer = bq.dequeue_filled().unwrap();
    bq.recycle_blank(buffer);

    let buffer = bq.get_blank();
    assert_eq!(buffer.len, 0);
    bq.recycle_blank(buffer);
}

/// Filled buffers come out in the order a single producer pushed them.
#[test]
fn filled_queue_is_fifo() {
    let (_budget, bq) = queue(16, 5);
    bq.start_input();

    for i in 0..5u8 {
        let mut buffer = bq.get_blank();
        buffer.data[0] = i;
        buffer.len = 1;
        bq.enqueue_filled(buffer);
    }
    bq.finish_input();

    for i in 0..5u8 {
        let buffer = bq.dequeue_filled().unwrap();
        assert_eq!(buffer.data[0], i);
        bq.recycle_blank(buffer);
    }
    assert!(bq.dequeue_filled().is_none());
}

/// A consumer blocked on an empty filled queue returns `None` promptly once
/// the driver declares input finished.
#[test]
fn finish_input_wakes_blocked_consumers() {
    let (_budget, bq) = queue(16, 2);
    bq.start_input();

    thread::scope(|s| {
        let consumer = s.spawn(|| bq.dequeue_filled());

        thread::sleep(Duration::from_millis(50));
        bq.finish_input();

        assert!(consumer.join().unwrap().is_none());
    });
}

/// A producer blocked on an empty blank queue resumes when a consumer
/// recycles.
#[test]
fn get_blank_blocks_until_recycle() {
    let (_budget, bq) = queue(16, 1);
    bq.start_input();

    let first = bq.get_blank();
    let released = AtomicUsize::new(0);

    thread::scope(|s| {
        let producer = s.spawn(|| {
            let buffer = bq.get_blank();
            assert_eq!(released.load(Ordering::SeqCst), 1);
            bq.recycle_blank(buffer);
        });

        thread::sleep(Duration::from_millis(50));
        released.store(1, Ordering::SeqCst);
        bq.recycle_blank(first);

        producer.join().unwrap();
    });
    bq.finish_input();
}

/// K producers and M consumers: every tagged item is consumed exactly once.
#[test]
fn items_are_consumed_exactly_once_under_contention() {
    const PRODUCERS: usize = 3;
    const ITEMS_PER_PRODUCER: usize = 200;

    let (_budget, bq) = queue(16, 6);
    bq.start_input();

    let seen: std::sync::Mutex<HashSet<(u8, u8)>> = std::sync::Mutex::new(HashSet::new());
    let bq = &bq;
    let seen = &seen;

    thread::scope(|s| {
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    while let Some(buffer) = bq.dequeue_filled() {
                        let tag = (buffer.data[0], buffer.data[1]);
                        assert!(seen.lock().unwrap().insert(tag), "duplicate item {tag:?}");
                        bq.recycle_blank(buffer);
                    }
                })
            })
            .collect();

        let producers: Vec<_> = (0..PRODUCERS as u8)
            .map(|p| {
                s.spawn(move || {
                    for i in 0..ITEMS_PER_PRODUCER as u8 {
                        let mut buffer = bq.get_blank();
                        buffer.data[0] = p;
                        buffer.data[1] = i;
                        buffer.len = 2;
                        bq.enqueue_filled(buffer);
                    }
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }
        bq.finish_input();
        for handle in consumers {
            handle.join().unwrap();
        }
    });

    assert_eq!(seen.lock().unwrap().len(), PRODUCERS * ITEMS_PER_PRODUCER);
}
