//! ktally — canonical k-mer counting with a fixed memory budget.
//!
//! Streams FASTA/FASTQ read sets (plain or gzip) through a bounded
//! reader/processor/writer pipeline into a concurrent hash counter, and
//! writes a compact `<kmer, count>` result file. When the counter runs out
//! of nodes it freezes its key set; not-yet-counted k-mers are spilled to a
//! temporary file as packed super-k-mers and consumed by follow-up passes
//! until nothing remains.
//!
//! Every stage is public so the integration tests can drive components in
//! isolation: the [`queue`]/[`buffer`] plumbing, the [`reader`] and
//! [`writer`] ends, the [`processor`] units, the [`hash_map`] counter and
//! the multi-pass [`counter`] driver. The [`histo`] and [`dump`] modules
//! implement the result post-processing subcommands.

pub mod buffer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod counter;
pub mod dump;
pub mod hash_map;
pub mod header;
pub mod histo;
pub mod mem;
pub mod processor;
pub mod queue;
pub mod reader;
pub mod util;
pub mod writer;

pub use buffer::{Buffer, BufferKind, BufferQueue};
pub use counter::{CountConfig, KmerCounter};
pub use hash_map::KmerHashMap;
pub use header::Header;
pub use mem::MemBudget;
pub use processor::{ExportStats, OutputParams};
pub use reader::{Compression, FileInput, FileKind};
