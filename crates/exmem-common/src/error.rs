//! Error types shared across the exmem crates.
//!
//! Only environment failures are represented here: I/O errors, format
//! mismatches against on-disk metadata, out-of-range seeks, and reads past
//! the end of a stream. Protocol misuse (pushing after `end`, assigning a
//! memory budget below a stage's declared minimum, closing a file with live
//! streams) indicates a caller bug and panics instead of returning an error.

use std::io;
use thiserror::Error;

/// Unified error type for the exmem engine.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying storage.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A read was attempted past the end of the stream.
    #[error("end of stream")]
    EndOfStream,

    /// A seek target outside the valid `[0, size]` range.
    #[error("seek out of range: offset {offset} not in [0, {size}]")]
    OutOfRange {
        /// The requested logical offset.
        offset: i64,
        /// The stream size the offset was checked against.
        size: u64,
    },

    /// On-disk metadata disagrees with what the caller expects.
    #[error("format mismatch: {0}")]
    Format(String),

    /// A write was attempted on a file opened read-only.
    #[error("stream is read only")]
    ReadOnly,
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
