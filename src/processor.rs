//! Processor stage: turns read buffers into counted canonical k-mers.
//!
//! Three cooperating units per worker thread:
//!
//! - the **extract unit** maintains a rolling k-mer and its reverse
//!   complement as packed words, built base-by-base and then shifted, and
//!   picks the canonical (lexicographically smaller) of the two;
//! - the **store unit** packs k-mers the hash map rejected into super-k-mers
//!   inside spill buffers;
//! - the **export unit** streams surviving hash entries out as result
//!   records after the extract phase.
//!
//! Buffer scanning and k-mer extraction are free functions driving
//! callbacks, so tests can observe every read segment and every canonical
//! k-mer without a live pipeline behind them.

use std::cmp::Ordering;

use crate::buffer::{Buffer, BufferKind, BufferQueue};
use crate::codec::{
    compare_kmers, complement_code, count_field_size, encode_base, high_valid_bits, kmer_width,
    kmer_width_by_unit_size, CODE_INVALID, CODE_SKIP,
};
use crate::config::{Count, Unit, UNIT_BITS};
use crate::hash_map::KmerHashMap;

/// Output shaping applied at export time.
#[derive(Debug, Clone, Copy)]
pub struct OutputParams {
    pub count_max: Count,
    pub filter_min: Count,
    pub filter_max: Count,
}

// ─────────────────────────────────────────────────────────────────────────────
// Extract unit
// ─────────────────────────────────────────────────────────────────────────────

/// Rolling canonical k-mer state.
///
/// The forward k-mer keeps its front base in the high bits of the high unit;
/// the reverse complement mirrors it, so appending a base is a 2-bit left
/// shift of one and a 2-bit right shift of the other.
pub struct ExtractUnit {
    k: usize,
    w: usize,

    gen_w_init: usize,
    gen_s_init: usize,

    gen_w: usize,
    gen_s: usize,
    rc_gen_w: usize,
    rc_gen_s: usize,

    /// Masks the high unit after a shift so stale front bases fall off.
    shift_mask: Unit,
    /// Bit position of the front base slot in the high unit.
    rc_shift: usize,

    kmer: Vec<Unit>,
    rc_kmer: Vec<Unit>,
}

impl ExtractUnit {
    pub fn new(k: usize) -> Self {
        assert!(k > 0);
        let w = kmer_width(k);
        let high_valid = high_valid_bits(k);

        ExtractUnit {
            k,
            w,
            gen_w_init: w - 1,
            gen_s_init: high_valid - 2,
            gen_w: 0,
            gen_s: 0,
            rc_gen_w: 0,
            rc_gen_s: 0,
            shift_mask: if high_valid == UNIT_BITS {
                Unit::MAX
            } else {
                ((1 as Unit) << high_valid) - 1
            },
            rc_shift: high_valid - 2,
            kmer: vec![0; w],
            rc_kmer: vec![0; w],
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn width(&self) -> usize {
        self.w
    }

    /// Places the n-th of the first K bases. `n == 0` resets both words.
    pub fn generate(&mut self, n: usize, code: Unit) {
        if n == 0 {
            self.gen_w = self.gen_w_init;
            self.gen_s = self.gen_s_init;
            self.rc_gen_w = 0;
            self.rc_gen_s = 0;
            self.kmer.fill(0);
            self.rc_kmer.fill(0);
        }

        self.kmer[self.gen_w] |= code << self.gen_s;
        self.rc_kmer[self.rc_gen_w] |= complement_code(code) << self.rc_gen_s;

        if self.gen_s == 0 {
            self.gen_w = self.gen_w.wrapping_sub(1);
            self.gen_s = UNIT_BITS - 2;
        } else {
            self.gen_s -= 2;
        }

        if self.rc_gen_s == UNIT_BITS - 2 {
            self.rc_gen_w += 1;
            self.rc_gen_s = 0;
        } else {
            self.rc_gen_s += 2;
        }
    }

    /// Appends one base past the first K, dropping the oldest.
    pub fn shift(&mut self, code: Unit) {
        let w = self.w;
        let mut code = code;
        let mut rc_code = complement_code(code);

        for i in 0..w - 1 {
            let carry = self.kmer[i] >> (UNIT_BITS - 2);
            self.kmer[i] = (self.kmer[i] << 2) | code;
            code = carry;
        }
        self.kmer[w - 1] = ((self.kmer[w - 1] << 2) | code) & self.shift_mask;

        for i in (0..w).rev() {
            let shift = if i == w - 1 { self.rc_shift } else { UNIT_BITS - 2 };
            let carry = self.rc_kmer[i] & 0x3;
            self.rc_kmer[i] = (self.rc_kmer[i] >> 2) | (rc_code << shift);
            rc_code = carry;
        }
    }

    /// The forward k-mer words.
    pub fn forward(&self) -> &[Unit] {
        &self.kmer
    }

    /// The reverse-complement k-mer words.
    pub fn reverse_complement(&self) -> &[Unit] {
        &self.rc_kmer
    }

    /// The lexicographically smaller of forward and reverse complement.
    pub fn canonical(&self) -> &[Unit] {
        if compare_kmers(&self.kmer, &self.rc_kmer) == Ordering::Less {
            &self.kmer
        } else {
            &self.rc_kmer
        }
    }

    /// Yields the K codes of the forward k-mer, front base first.
    pub fn forward_codes(&self) -> impl Iterator<Item = Unit> + '_ {
        let mut w = self.gen_w_init;
        let mut s = self.gen_s_init;
        (0..self.k).map(move |_| {
            let code = (self.kmer[w] >> s) & 0x3;
            if s == 0 {
                w = w.wrapping_sub(1);
                s = UNIT_BITS - 2;
            } else {
                s -= 2;
            }
            code
        })
    }
}

/// Advances `extract` by one valid code. `i` is the code's position within
/// the current contiguous run; once a full window exists, `on_kmer` fires
/// with the unit, the k-mer's start offset in the run and the appended code.
pub fn feed_code(
    extract: &mut ExtractUnit,
    i: usize,
    code: Unit,
    on_kmer: &mut impl FnMut(&ExtractUnit, usize, Unit),
) {
    let k = extract.k();

    if i < k {
        extract.generate(i, code);
        if i != k - 1 {
            return;
        }
    } else {
        extract.shift(code);
    }

    on_kmer(extract, i + 1 - k, code);
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffer scanning
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a FASTA/FASTQ buffer into sequence regions and hands each to
/// `on_read`.
///
/// Lines end at `\n`, `\r` or `\r\n`, and a region is classified by its
/// neighbours: in FASTA, everything between a `>` header line and the next
/// header (or buffer end) is one region, embedded line breaks included; in
/// FASTQ, a line is sequence iff the previous line starts with `@` and the
/// next with `+`.
pub fn scan_reads_buffer(kind: BufferKind, data: &[u8], mut on_read: impl FnMut(&[u8])) {
    debug_assert!(matches!(kind, BufferKind::Fasta | BufferKind::Fastq));

    let mut prev_start: Option<usize> = None;
    let mut line_start = 0usize;

    let mut i = 0usize;
    loop {
        let end_of_buffer = i == data.len();
        let mut end_of_line = false;
        let mut line_end = 0usize;

        if end_of_buffer {
            line_end = i;
        } else if data[i] == b'\n' {
            line_end = i;
            end_of_line = true;
        } else if data[i] == b'\r' {
            line_end = i;
            if i + 1 < data.len() && data[i + 1] == b'\n' {
                i += 1;
            }
            end_of_line = true;
        }

        if end_of_buffer || end_of_line {
            debug_assert!(line_end >= line_start);

            let next_start = i + 1;
            let next_first = data.get(next_start).copied();
            let prev_first = prev_start.and_then(|p| data.get(p).copied());

            let mut current_line_is_read = false;
            let mut update_current_line = false;

            match kind {
                BufferKind::Fasta => {
                    if prev_first == Some(b'>') {
                        if next_first.is_none() || next_first == Some(b'>') {
                            current_line_is_read = true;
                            update_current_line = true;
                        }
                    } else {
                        update_current_line = true;
                    }
                }
                BufferKind::Fastq => {
                    if prev_first == Some(b'@') && next_first == Some(b'+') {
                        current_line_is_read = true;
                    }
                    update_current_line = true;
                }
                _ => unreachable!(),
            }

            if current_line_is_read {
                on_read(&data[line_start..line_end]);
            }

            if end_of_buffer {
                break;
            }

            if update_current_line {
                prev_start = Some(line_start);
                line_start = next_start;
            }
        }

        i += 1;
    }
}

/// Walks a spill-frame buffer (`u32 super_kmer_count`, then per super-k-mer
/// a `u8 expanded_bases_count` and `K + expanded` packed codes) and delivers
/// every code in order.
pub fn scan_super_kmers_buffer(k: usize, data: &[u8], mut on_code: impl FnMut(usize, Unit)) {
    let super_kmers_count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let mut p = 4usize;

    for _ in 0..super_kmers_count {
        let expanded_bases_count = data[p] as usize;
        let bases_count = k + expanded_bases_count;
        p += 1;

        let mut unit = data[p];
        let mut shift = 0usize;

        for i in 0..bases_count {
            if shift == 8 {
                shift = 0;
                p += 1;
                unit = data[p];
            }
            on_code(i, ((unit >> shift) & 0x3) as Unit);
            shift += 2;
        }

        p += 1;
    }

    debug_assert_eq!(p, data.len());
}

/// Runs `extract` over one sequence region, restarting the k-mer window
/// after every invalid byte and skipping embedded line breaks.
pub fn extract_kmers_from_read(
    extract: &mut ExtractUnit,
    read: &[u8],
    mut on_kmer: impl FnMut(&ExtractUnit, usize, Unit),
) {
    let mut read = read;
    loop {
        let handled = handle_sub_read(extract, read, &mut on_kmer);
        read = &read[handled..];
        if read.is_empty() {
            break;
        }
        read = &read[1..];
    }
}

/// Feeds codes until the end of `read` or the first invalid byte. Returns
/// the number of bytes consumed (excluding a terminating invalid byte).
fn handle_sub_read(
    extract: &mut ExtractUnit,
    read: &[u8],
    on_kmer: &mut impl FnMut(&ExtractUnit, usize, Unit),
) -> usize {
    if read.len() < extract.k() {
        return 0;
    }

    let mut i = 0usize;
    let mut skipped_count = 0usize;
    while i < read.len() {
        let code = encode_base(read[i]);

        if code == CODE_INVALID {
            break;
        } else if code == CODE_SKIP {
            skipped_count += 1;
        } else {
            feed_code(extract, i - skipped_count, code, on_kmer);
        }

        i += 1;
    }

    i
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffer sink
// ─────────────────────────────────────────────────────────────────────────────

/// Where the store and export units get blank buffers from and deliver
/// completed ones to — the live write queue in production, a pair of
/// callbacks in tests. One contract for both.
pub enum BufferSink<'a> {
    Queue(&'a BufferQueue),
    Callback {
        request: Box<dyn FnMut() -> Box<Buffer> + 'a>,
        complete: Box<dyn FnMut(Box<Buffer>) + 'a>,
    },
}

impl BufferSink<'_> {
    fn request(&mut self, kind: BufferKind) -> Box<Buffer> {
        let mut buffer = match self {
            BufferSink::Queue(queue) => queue.get_blank(),
            BufferSink::Callback { request, .. } => request(),
        };
        buffer.kind = kind;
        buffer
    }

    fn complete(&mut self, buffer: Box<Buffer>) {
        match self {
            BufferSink::Queue(queue) => queue.enqueue_filled(buffer),
            BufferSink::Callback { complete, .. } => complete(buffer),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store unit
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreAction {
    /// The next rejected k-mer opens a fresh super-k-mer.
    New,
    /// The current super-k-mer absorbs further rejected k-mers one code at a
    /// time.
    Expand,
}

/// Packs rejected k-mers into super-k-mer spill buffers.
pub struct StoreUnit {
    action: StoreAction,
    current_buffer: Option<Box<Buffer>>,

    /// Worst-case bytes for one whole super-k-mer record (length byte plus
    /// K + 255 packed bases); buffers rotate when less than this remains.
    super_kmer_info_max_size: usize,

    /// Offset of the frame's `u32 super_kmer_count`.
    count_offset: usize,
    /// Offset of the open super-k-mer's `u8 expanded_bases_count`.
    expanded_offset: usize,
    /// Offset of the byte currently accepting packed codes.
    unit_offset: Option<usize>,
    /// Codes already packed into that byte.
    unit_bases: usize,
}

impl StoreUnit {
    pub fn new(k: usize) -> Self {
        let max_units_count = kmer_width_by_unit_size(k + u8::MAX as usize, 1);
        StoreUnit {
            action: StoreAction::New,
            current_buffer: None,
            super_kmer_info_max_size: max_units_count + 1,
            count_offset: 0,
            expanded_offset: 0,
            unit_offset: None,
            unit_bases: 0,
        }
    }

    fn reset_action(&mut self) {
        self.action = StoreAction::New;
    }

    fn request_mem(buffer: &mut Buffer, size: usize) -> usize {
        let offset = buffer.len;
        buffer.len += size;
        offset
    }

    fn mem_sufficient(&self, buffer: &Buffer) -> bool {
        buffer.remaining() >= self.super_kmer_info_max_size
    }

    /// Appends one 2-bit code to the open super-k-mer, four codes per byte.
    fn expand(&mut self, code: Unit) {
        if self.unit_offset.is_some() && self.unit_bases == 4 {
            self.unit_offset = None;
        }

        if self.unit_offset.is_none() {
            let buffer = self.current_buffer.as_mut().unwrap();
            let offset = Self::request_mem(buffer, 1);
            buffer.data[offset] = 0;
            self.unit_offset = Some(offset);
            self.unit_bases = 0;
        }

        let offset = self.unit_offset.unwrap();
        let buffer = self.current_buffer.as_mut().unwrap();
        buffer.data[offset] |= (code as u8) << (self.unit_bases << 1);
        self.unit_bases += 1;
    }

    /// Spills the extract unit's current k-mer: opens a new super-k-mer, or
    /// extends the running one with the freshly shifted-in code.
    fn store_kmer(&mut self, extract: &ExtractUnit, sink: &mut BufferSink<'_>, last_code: Unit) {
        match self.action {
            StoreAction::New => {
                if let Some(buffer) = self.current_buffer.as_ref() {
                    if !self.mem_sufficient(buffer) {
                        let buffer = self.current_buffer.take().unwrap();
                        sink.complete(buffer);
                    }
                }

                if self.current_buffer.is_none() {
                    let mut buffer = sink.request(BufferKind::SuperKmer);
                    debug_assert!(self.mem_sufficient(&buffer));

                    let offset = Self::request_mem(&mut buffer, 4);
                    buffer.data[offset..offset + 4].copy_from_slice(&0u32.to_le_bytes());
                    self.count_offset = offset;
                    self.current_buffer = Some(buffer);
                }

                {
                    let count_offset = self.count_offset;
                    let buffer = self.current_buffer.as_mut().unwrap();
                    let count = u32::from_le_bytes(
                        buffer.data[count_offset..count_offset + 4].try_into().unwrap(),
                    ) + 1;
                    buffer.data[count_offset..count_offset + 4]
                        .copy_from_slice(&count.to_le_bytes());

                    let expanded_offset = Self::request_mem(buffer, 1);
                    buffer.data[expanded_offset] = 0;
                    self.expanded_offset = expanded_offset;
                    self.unit_offset = None;
                }

                for code in extract.forward_codes() {
                    self.expand(code);
                }

                self.action = StoreAction::Expand;
            }
            StoreAction::Expand => {
                self.expand(last_code);

                let expanded_offset = self.expanded_offset;
                let buffer = self.current_buffer.as_mut().unwrap();
                buffer.data[expanded_offset] += 1;
                if buffer.data[expanded_offset] == u8::MAX {
                    self.action = StoreAction::New;
                }
            }
        }
    }

    /// Flushes a partially filled spill buffer at end of input.
    fn finish(&mut self, sink: &mut BufferSink<'_>) {
        if let Some(buffer) = self.current_buffer.take() {
            sink.complete(buffer);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extract worker
// ─────────────────────────────────────────────────────────────────────────────

/// Per-thread extract-phase worker: drains read buffers, counts canonical
/// k-mers into the hash map and spills rejected ones.
pub struct ExtractWorker<'a> {
    id: usize,
    extract: ExtractUnit,
    store: StoreUnit,
    hash_map: &'a KmerHashMap,
    sink: BufferSink<'a>,
}

impl<'a> ExtractWorker<'a> {
    pub fn new(id: usize, k: usize, hash_map: &'a KmerHashMap, sink: BufferSink<'a>) -> Self {
        ExtractWorker {
            id,
            extract: ExtractUnit::new(k),
            store: StoreUnit::new(k),
            hash_map,
            sink,
        }
    }

    /// Offers one canonical k-mer to the hash map, spilling on rejection.
    fn count_or_spill(
        id: usize,
        hash_map: &KmerHashMap,
        store: &mut StoreUnit,
        sink: &mut BufferSink<'_>,
        extract: &ExtractUnit,
        n: usize,
        last_code: Unit,
    ) {
        if n == 0 {
            store.reset_action();
        }

        if hash_map.add_kmer(id, extract.canonical()) {
            store.reset_action();
            return;
        }

        store.store_kmer(extract, sink, last_code);
    }

    /// Dispatches one filled buffer by its tag.
    pub fn handle_buffer(&mut self, buffer: &Buffer) {
        if buffer.len == 0 {
            return;
        }

        let ExtractWorker {
            id,
            extract,
            store,
            hash_map,
            sink,
        } = self;

        match buffer.kind {
            BufferKind::Fasta | BufferKind::Fastq => {
                scan_reads_buffer(buffer.kind, buffer.filled(), |read| {
                    extract_kmers_from_read(extract, read, |eu, n, last_code| {
                        Self::count_or_spill(*id, *hash_map, store, sink, eu, n, last_code);
                    });
                });
            }
            BufferKind::SuperKmer => {
                let k = extract.k();
                scan_super_kmers_buffer(k, buffer.filled(), |i, code| {
                    feed_code(extract, i, code, &mut |eu, n, last_code| {
                        Self::count_or_spill(*id, *hash_map, store, sink, eu, n, last_code);
                    });
                });
            }
            BufferKind::Kmer => unreachable!(),
        }
    }

    /// Flushes the spill buffer and joins the freeze barrier.
    pub fn finish(&mut self) {
        self.store.finish(&mut self.sink);
        self.hash_map.finish_adding_kmers(self.id);
    }

    /// Extract-phase thread body: drain, process, recycle, finish.
    pub fn work(&mut self, read_queue: &BufferQueue) {
        while let Some(buffer) = read_queue.dequeue_filled() {
            self.handle_buffer(&buffer);
            read_queue.recycle_blank(buffer);
        }

        self.finish();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Export worker
// ─────────────────────────────────────────────────────────────────────────────

/// Counters accumulated while exporting one node block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportStats {
    /// Sum of counts over all committed nodes.
    pub total_kmers: u64,
    /// Committed nodes visited.
    pub unique_kmers: u64,
    /// Nodes that passed the filters and were written out.
    pub exported_unique_kmers: u64,
}

impl std::ops::AddAssign for ExportStats {
    fn add_assign(&mut self, rhs: ExportStats) {
        self.total_kmers += rhs.total_kmers;
        self.unique_kmers += rhs.unique_kmers;
        self.exported_unique_kmers += rhs.exported_unique_kmers;
    }
}

/// Per-thread export-phase worker: streams this thread's node block out as
/// result records.
pub struct ExportWorker<'a> {
    id: usize,
    k: usize,
    params: OutputParams,
    hash_map: &'a KmerHashMap,
    sink: BufferSink<'a>,
}

impl<'a> ExportWorker<'a> {
    pub fn new(
        id: usize,
        k: usize,
        params: OutputParams,
        hash_map: &'a KmerHashMap,
        sink: BufferSink<'a>,
    ) -> Self {
        ExportWorker {
            id,
            k,
            params,
            hash_map,
            sink,
        }
    }

    /// Export-phase thread body. Returns this block's statistics.
    pub fn work(self) -> ExportStats {
        let ExportWorker {
            id,
            k,
            params,
            hash_map,
            mut sink,
        } = self;

        let w = kmer_width(k);
        let kmer_bytes = kmer_width_by_unit_size(k, 1);
        // Valid bytes of the high unit.
        let c = kmer_bytes - (w - 1) * (UNIT_BITS / 8);
        let count_size = count_field_size(params.count_max as u64);
        let unit_size = kmer_bytes + count_size;

        let mut stats = ExportStats::default();
        let mut buffer: Option<Box<Buffer>> = None;

        hash_map.export(id, |kmer, count| {
            stats.total_kmers += count as u64;
            stats.unique_kmers += 1;

            if count < params.filter_min || count > params.filter_max {
                return;
            }
            let count = count.min(params.count_max);

            stats.exported_unique_kmers += 1;

            if buffer.is_none() {
                buffer = Some(sink.request(BufferKind::Kmer));
            }
            let buf = buffer.as_mut().unwrap();

            // K-mer serialized low unit first, each unit little-endian, the
            // high unit truncated to its valid bytes.
            let mut pos = buf.len;
            for (i, word) in kmer.iter().enumerate() {
                let bytes = if i == w - 1 { c } else { UNIT_BITS / 8 };
                for j in 0..bytes {
                    buf.data[pos] = ((word >> (j * 8)) & 0xFF) as u8;
                    pos += 1;
                }
            }

            let count_bytes = (count as u64).to_le_bytes();
            buf.data[pos..pos + count_size].copy_from_slice(&count_bytes[..count_size]);

            buf.len += unit_size;

            if unit_size > buf.remaining() {
                sink.complete(buffer.take().unwrap());
            }
        });

        if let Some(buf) = buffer.take() {
            sink.complete(buf);
        }

        stats
    }
}
