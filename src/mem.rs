//! Process-wide memory budget.
//!
//! Every sizeable allocation in the pipeline is charged against one
//! [`MemBudget`] created from the `--mem` limit. A charge is represented by a
//! [`Reservation`] that returns its bytes when dropped, so the budget is
//! balanced structurally. Requests that exceed the remaining budget are fatal:
//! the run cannot proceed with less memory than its components were sized for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

struct BudgetInner {
    limit: usize,
    available: AtomicUsize,
    allocated_count: AtomicUsize,
    freed_count: AtomicUsize,
}

/// Shared handle to the process memory budget. Clones refer to the same pool.
#[derive(Clone)]
pub struct MemBudget {
    inner: Arc<BudgetInner>,
}

impl MemBudget {
    pub fn new(limit: usize) -> Self {
        MemBudget {
            inner: Arc::new(BudgetInner {
                limit,
                available: AtomicUsize::new(limit),
                allocated_count: AtomicUsize::new(0),
                freed_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Bytes still unreserved.
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Charges `size` bytes to the budget. `name` identifies the consumer in
    /// the fatal log message when the budget is exhausted.
    pub fn reserve(&self, size: usize, name: &str) -> Reservation {
        let mut available = self.inner.available.load(Ordering::Relaxed);
        loop {
            if size > available {
                error!("Allocating memory for {name} failed.");
                std::process::exit(1);
            }
            match self.inner.available.compare_exchange_weak(
                available,
                available - size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => available = v,
            }
        }
        self.inner.allocated_count.fetch_add(1, Ordering::Relaxed);
        Reservation {
            inner: Arc::clone(&self.inner),
            size,
        }
    }

    /// Logs budget accounting; called once at shutdown.
    pub fn log_usage(&self) {
        let available = self.available();
        debug!("Mem           limit: {}", self.inner.limit);
        debug!("Mem            used: {}", self.inner.limit - available);
        debug!(
            "Mem allocated count: {}",
            self.inner.allocated_count.load(Ordering::Relaxed)
        );
        debug!(
            "Mem     freed count: {}",
            self.inner.freed_count.load(Ordering::Relaxed)
        );
    }
}

/// RAII charge against a [`MemBudget`]; releases its bytes on drop.
pub struct Reservation {
    inner: Arc<BudgetInner>,
    size: usize,
}

impl Reservation {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner.available.fetch_add(self.size, Ordering::Relaxed);
        self.inner.freed_count.fetch_add(1, Ordering::Relaxed);
    }
}
