//! File writer: result/spill routing, frame framing and the spill-size
//! report that drives the multi-pass loop.

use tempfile::TempDir;

use ktally::buffer::{BufferKind, BufferQueue};
use ktally::header::Header;
use ktally::mem::MemBudget;
use ktally::writer::FileWriter;

/// Result records append raw; super-k-mer buffers are length-framed into the
/// spill file, whose size is reported back.
#[test]
fn buffers_route_to_result_and_spill_files() {
    let dir = TempDir::new().unwrap();
    let result_path = dir.path().join("kmers");
    let spill_path = dir.path().join("spill");
    let result_name = result_path.to_string_lossy().into_owned();
    let spill_name = spill_path.to_string_lossy().into_owned();

    let budget = MemBudget::new(1_000_000);
    let queue = BufferQueue::new(&budget, 20, 10);

    let mut writer = FileWriter::new(&result_name, None);

    queue.start_input();

    let contents: [&[u8]; 4] = [
        &[0x0, 0x1, 0x2, 0x3],
        &[0x4, 0x5, 0x6],
        &[0x8, 0x9, 0xA, 0xB],
        &[0x7, 0xC, 0xD, 0xE, 0xF],
    ];
    let kinds = [
        BufferKind::Kmer,
        BufferKind::SuperKmer,
        BufferKind::Kmer,
        BufferKind::SuperKmer,
    ];

    for (content, kind) in contents.iter().zip(kinds) {
        let mut buffer = queue.get_blank();
        buffer.kind = kind;
        buffer.len = content.len();
        buffer.data[..content.len()].copy_from_slice(content);
        queue.enqueue_filled(buffer);
    }
    queue.finish_input();

    let spill_size = writer.work(&queue, &spill_name);
    assert_eq!(spill_size, 16);
    drop(writer);

    let result = std::fs::read(&result_path).unwrap();
    assert_eq!(result, [0x0, 0x1, 0x2, 0x3, 0x8, 0x9, 0xA, 0xB]);

    let spill = std::fs::read(&spill_path).unwrap();
    assert_eq!(
        spill,
        [0x3, 0x0, 0x0, 0x0, 0x4, 0x5, 0x6, 0x5, 0x0, 0x0, 0x0, 0x7, 0xC, 0xD, 0xE, 0xF]
    );
}

/// A pass that spills nothing reports size 0 and truncates the old spill
/// file.
#[test]
fn empty_pass_reports_zero_spill() {
    let dir = TempDir::new().unwrap();
    let result_name = dir.path().join("kmers").to_string_lossy().into_owned();
    let spill_path = dir.path().join("spill");
    let spill_name = spill_path.to_string_lossy().into_owned();

    std::fs::write(&spill_path, b"stale").unwrap();

    let budget = MemBudget::new(1_000_000);
    let queue = BufferQueue::new(&budget, 20, 4);
    let mut writer = FileWriter::new(&result_name, None);

    queue.start_input();
    queue.finish_input();

    assert_eq!(writer.work(&queue, &spill_name), 0);
    assert_eq!(std::fs::read(&spill_path).unwrap().len(), 0);
}

/// The result file opens with the serialized header.
#[test]
fn header_prefixes_the_result_file() {
    let dir = TempDir::new().unwrap();
    let result_path = dir.path().join("kmers");
    let result_name = result_path.to_string_lossy().into_owned();
    let spill_name = dir.path().join("spill").to_string_lossy().into_owned();

    let header = Header {
        k: 21,
        count_max: 255,
        filter_min: 2,
        filter_max: 1000,
    };

    let budget = MemBudget::new(1_000_000);
    let queue = BufferQueue::new(&budget, 20, 4);
    let mut writer = FileWriter::new(&result_name, Some(&header));

    queue.start_input();
    queue.finish_input();
    writer.work(&queue, &spill_name);
    drop(writer);

    let mut file = std::fs::File::open(&result_path).unwrap();
    assert_eq!(Header::read_from(&mut file).unwrap(), header);
}
