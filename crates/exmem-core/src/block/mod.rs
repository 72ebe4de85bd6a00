//! Block-cached file layer.
//!
//! A [`BlockFile`] presents an on-disk file as a flat sequence of fixed-size
//! records, split into logical blocks that are cached in memory and written
//! back lazily. [`BlockStream`] is a cursor over such a file supporting
//! forward and backward sequential access as well as random seeks;
//! [`FileStream`] bundles one file with one cursor for the common
//! one-reader-or-writer case.
//!
//! Block size is `2 MiB × block factor`; a small factor makes blocks tiny,
//! which the tests use to exercise boundary crossings cheaply.

mod file;
mod stream;

pub use file::BlockFile;
pub use stream::{BlockStream, FileStream};

/// Base logical block size in bytes, scaled by a file's block factor.
pub const BASE_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Number of cached blocks a file keeps around beyond those pinned by
/// streams. Eviction is least-recently-used among unpinned blocks.
pub(crate) const CACHE_BLOCKS: usize = 8;

/// Returns the block size in bytes for the given block factor.
#[must_use]
pub fn block_size(block_factor: f64) -> usize {
    (BASE_BLOCK_SIZE as f64 * block_factor) as usize
}

/// Returns the block factor producing blocks of `bytes` bytes.
#[must_use]
pub fn calculate_block_factor(bytes: usize) -> f64 {
    bytes as f64 / BASE_BLOCK_SIZE as f64
}

/// How a file may be accessed by the streams opened against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only; writes fail with [`Error::ReadOnly`](exmem_common::Error::ReadOnly).
    Read,
    /// Write-only.
    Write,
    /// Both directions.
    ReadWrite,
}

impl AccessType {
    pub(crate) fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub(crate) fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Origin for [`BlockStream::seek`] offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Relative to the start of the stream.
    Start,
    /// Relative to the current offset.
    Current,
    /// Relative to the end of the stream.
    End,
}

/// A record with a fixed on-disk encoding.
///
/// Records are serialized explicitly rather than reinterpreted from raw
/// bytes; `encode` must fill exactly [`ENCODED_SIZE`](Self::ENCODED_SIZE)
/// bytes and `decode` must read exactly that many.
pub trait FixedRecord: Clone {
    /// Encoded size in bytes.
    const ENCODED_SIZE: usize;

    /// Writes the record into `buf`, which is `ENCODED_SIZE` bytes long.
    fn encode(&self, buf: &mut [u8]);

    /// Reads a record back out of `buf`.
    fn decode(buf: &[u8]) -> Self;
}

macro_rules! fixed_record_int {
    ($($t:ty),*) => {
        $(
            impl FixedRecord for $t {
                const ENCODED_SIZE: usize = std::mem::size_of::<$t>();

                fn encode(&self, buf: &mut [u8]) {
                    buf.copy_from_slice(&self.to_le_bytes());
                }

                fn decode(buf: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(buf);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

fixed_record_int!(u8, u16, u32, u64, i8, i16, i32, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_factor_roundtrip() {
        let factor = calculate_block_factor(128);
        assert_eq!(block_size(factor), 128);
        assert_eq!(block_size(1.0), BASE_BLOCK_SIZE);
    }

    #[test]
    fn test_fixed_record_ints() {
        let mut buf = [0u8; 8];
        0xdead_beef_u64.encode(&mut buf);
        assert_eq!(u64::decode(&buf), 0xdead_beef);

        let mut buf = [0u8; 4];
        (-7i32).encode(&mut buf);
        assert_eq!(i32::decode(&buf), -7);
    }
}
