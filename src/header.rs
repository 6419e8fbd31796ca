//! Result-file header: four little-endian u64 values prefixed to the record
//! stream — `{K, count_max, filter_min, filter_max}`.

use std::io::{self, Read, Write};

/// Fixed-size prefix of every result file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub k: u64,
    pub count_max: u64,
    pub filter_min: u64,
    pub filter_max: u64,
}

impl Header {
    /// Serialized size in bytes.
    pub const SIZE: usize = 4 * 8;

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        for value in [self.k, self.count_max, self.filter_min, self.filter_max] {
            writer.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> io::Result<Header> {
        let mut values = [0u64; 4];
        let mut bytes = [0u8; 8];
        for value in values.iter_mut() {
            reader.read_exact(&mut bytes)?;
            *value = u64::from_le_bytes(bytes);
        }
        Ok(Header {
            k: values[0],
            count_max: values[1],
            filter_min: values[2],
            filter_max: values[3],
        })
    }
}
