// config.rs — Compile-time type and sizing configuration.

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Machine word holding packed 2-bit base codes.
pub type Unit = u64;
/// Atomic cell for one k-mer word inside the shared node pool.
pub type AtomicUnit = AtomicU64;
/// Bits per [`Unit`].
pub const UNIT_BITS: usize = 64;

/// Per-key occurrence counter. Counting saturates at [`COUNT_MAX`].
pub type Count = u32;
pub type AtomicCount = AtomicU32;
pub const COUNT_MAX: Count = Count::MAX;

// Node ids index the shared node pool. The `compact-ids` feature shrinks them
// to 32 bits, halving table-slot and chain-link memory.
#[cfg(not(feature = "compact-ids"))]
pub type NodeId = u64;
#[cfg(not(feature = "compact-ids"))]
pub type AtomicNodeId = AtomicU64;
#[cfg(feature = "compact-ids")]
pub type NodeId = u32;
#[cfg(feature = "compact-ids")]
pub type AtomicNodeId = AtomicU32;

/// Node id 0 is reserved as the null link; the node at index 0 never holds a key.
pub const NODE_ID_NULL: NodeId = 0;

// ── Runtime defaults ─────────────────────────────────────────────────────────

/// Write-side buffer size in bytes. The read-side default derives from this.
pub const WRITE_BUFFER_SIZE_DEFAULT: u32 = 5_000_000;

/// Read-buffer growth factor applied when inputs are gzip compressed, so one
/// inflated buffer amortizes more decompressor calls.
pub const GZIP_READ_BUFFER_FACTOR: u32 = 4;

/// Minimum total thread count: one reader, one writer, one processor.
pub const MIN_THREADS: usize = 3;

/// Default cap applied to exported count values.
pub const COUNT_MAX_DEFAULT: Count = 255;

/// Default lower abundance filter: singletons are dropped.
pub const FILTER_MIN_DEFAULT: Count = 2;
