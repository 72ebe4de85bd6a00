//! Files of variable-length records.
//!
//! Records are laid out as `[header][payload]` with no padding; the header
//! is a fixed-size encoded value and a caller-supplied [`SizeExtractor`]
//! derives the payload length from it. Records freely straddle block
//! boundaries. Item counts are persisted in the block file's user-data
//! region.
//!
//! Reads materialize each record into a [`ScratchAllocator`] before
//! handing out a byte-slice view.

mod alloc;

pub use alloc::{ExponentialAllocator, FixedAllocator, ScratchAllocator};

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use exmem_common::memory::{self, SPACE_OVERHEAD};
use exmem_common::{Error, Result};

use crate::block::{AccessType, BlockFile, BlockStream, FixedRecord, Whence};

/// Derives a record's payload length from its decoded header.
///
/// This is the only way the file learns how long a record is; the extractor
/// must be a pure function of the header.
pub trait SizeExtractor: Clone {
    /// Fixed-size header preceding every payload.
    type Header: FixedRecord;

    /// Number of payload bytes following a header.
    fn payload_len(&self, header: &Self::Header) -> usize;
}

/// Byte count persisted ahead of any caller user data.
const COUNT_BYTES: usize = 8;

struct VarState {
    items: u64,
}

/// A file of `[header][payload]` records addressed by byte offset.
///
/// Wraps a byte-granular [`BlockFile`]; any number of [`VarStream`] cursors
/// may be open against it. The logical item count is persisted on close.
pub struct VarFile<E: SizeExtractor> {
    inner: BlockFile<u8>,
    state: Rc<RefCell<VarState>>,
    extractor: E,
    user_data_len: usize,
}

impl<E: SizeExtractor> VarFile<E> {
    /// Opens (creating if writable) the file at `path`.
    ///
    /// `user_data_len` reserves caller metadata alongside the item count the
    /// file keeps for itself.
    pub fn open(
        path: impl AsRef<Path>,
        access: AccessType,
        extractor: E,
        user_data_len: usize,
        block_factor: f64,
    ) -> Result<Self> {
        let inner = BlockFile::open(path, access, COUNT_BYTES + user_data_len, block_factor)?;
        let mut blob = vec![0u8; COUNT_BYTES + user_data_len];
        inner.read_user_data(&mut blob)?;
        let items = u64::from_le_bytes(blob[..COUNT_BYTES].try_into().expect("8 bytes"));
        if items > 0 && inner.is_empty() {
            return Err(Error::Format(format!(
                "item count {items} recorded for an empty file"
            )));
        }
        Ok(Self {
            inner,
            state: Rc::new(RefCell::new(VarState { items })),
            extractor,
            user_data_len,
        })
    }

    /// Logical number of records in the file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.state.borrow().items
    }

    /// Whether the file holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload-plus-header bytes stored.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.inner.len()
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.inner.path()
    }

    /// Whether streams may read from this file.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.inner.is_readable()
    }

    /// Whether streams may write to this file.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    /// Copies the caller's user-data blob into `out`.
    pub fn read_user_data(&self, out: &mut [u8]) -> Result<()> {
        let mut blob = vec![0u8; COUNT_BYTES + self.user_data_len];
        self.inner.read_user_data(&mut blob)?;
        if out.len() != self.user_data_len {
            return Err(Error::Format(format!(
                "user data size mismatch: file has {}, caller asked for {}",
                self.user_data_len,
                out.len()
            )));
        }
        out.copy_from_slice(&blob[COUNT_BYTES..]);
        Ok(())
    }

    /// Replaces the caller's user-data blob; persisted on close.
    pub fn write_user_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.user_data_len {
            return Err(Error::Format(format!(
                "user data size mismatch: file has {}, caller supplied {}",
                self.user_data_len,
                data.len()
            )));
        }
        let mut blob = vec![0u8; COUNT_BYTES + self.user_data_len];
        self.inner.read_user_data(&mut blob)?;
        blob[COUNT_BYTES..].copy_from_slice(data);
        self.inner.write_user_data(&blob)
    }

    /// Opens a cursor with a growable scratch.
    #[must_use]
    pub fn stream(&self) -> VarStream<E, ExponentialAllocator> {
        self.stream_with(ExponentialAllocator::new())
    }

    /// Opens a cursor reading into the given scratch allocator.
    #[must_use]
    pub fn stream_with<A: ScratchAllocator>(&self, scratch: A) -> VarStream<E, A> {
        VarStream {
            stream: self.inner.stream(),
            state: Rc::clone(&self.state),
            extractor: self.extractor.clone(),
            scratch,
            current_len: 0,
        }
    }

    /// Persists the item count and writes dirty blocks out to the OS,
    /// keeping the file open. Failures propagate, unlike the best-effort
    /// write-back on drop.
    pub fn flush(&mut self) -> Result<()> {
        if self.inner.is_writable() && self.inner.is_open() {
            let mut blob = vec![0u8; COUNT_BYTES + self.user_data_len];
            self.inner.read_user_data(&mut blob)?;
            blob[..COUNT_BYTES].copy_from_slice(&self.state.borrow().items.to_le_bytes());
            self.inner.write_user_data(&blob)?;
        }
        self.inner.flush()
    }

    /// Persists the item count and closes the underlying file.
    ///
    /// # Panics
    ///
    /// Panics if any stream into the file is still alive.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.inner.close()
    }
}

impl<E: SizeExtractor> Drop for VarFile<E> {
    fn drop(&mut self) {
        // Item count must reach the header even without an explicit close.
        if self.inner.is_open() && self.inner.is_writable() {
            let mut blob = vec![0u8; COUNT_BYTES + self.user_data_len];
            if self.inner.read_user_data(&mut blob).is_ok() {
                blob[..COUNT_BYTES].copy_from_slice(&self.state.borrow().items.to_le_bytes());
                let _ = self.inner.write_user_data(&blob);
            }
        }
    }
}

/// One cursor into a [`VarFile`].
///
/// Positions are byte offsets; the caller is responsible for only seeking
/// to record boundaries. Reads hand out a view into the stream's scratch,
/// valid until the next read.
pub struct VarStream<E: SizeExtractor, A: ScratchAllocator = ExponentialAllocator> {
    stream: BlockStream<u8>,
    state: Rc<RefCell<VarState>>,
    extractor: E,
    scratch: A,
    current_len: usize,
}

impl<E: SizeExtractor, A: ScratchAllocator> VarStream<E, A> {
    /// Current byte offset of the cursor.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        self.stream.offset()
    }

    /// Total bytes in the file.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.stream.len()
    }

    /// Logical number of records in the file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.state.borrow().items
    }

    /// Whether the file holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the cursor to an absolute byte offset, which must be a record
    /// boundary for subsequent reads to make sense.
    pub fn byte_seek(&mut self, offset: u64) -> Result<()> {
        self.stream.seek(offset as i64, Whence::Start)
    }

    /// Moves the cursor to the end of the file.
    pub fn byte_seek_end(&mut self) -> Result<()> {
        self.stream.seek(0, Whence::End)
    }

    /// Whether a read would succeed.
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.stream.can_read()
    }

    /// Reads the record at the cursor and advances past it.
    ///
    /// The returned slice is `[header][payload]` and stays valid until the
    /// next read or swap.
    pub fn read(&mut self) -> Result<&[u8]> {
        let header_len = E::Header::ENCODED_SIZE;
        self.scratch.ensure(header_len);
        self.stream.read_bytes(&mut self.scratch.buf_mut()[..header_len])?;
        let header = E::Header::decode(&self.scratch.buf()[..header_len]);
        let total = header_len + self.extractor.payload_len(&header);
        self.scratch.ensure(total);
        if let Err(err) = self
            .stream
            .read_bytes(&mut self.scratch.buf_mut()[header_len..total])
        {
            // A header with no room for its payload means the file is bad,
            // not merely exhausted.
            return Err(match err {
                Error::EndOfStream => Error::Format(format!(
                    "record at byte {} is truncated",
                    self.stream.offset() - header_len as u64
                )),
                other => other,
            });
        }
        self.current_len = total;
        Ok(&self.scratch.buf()[..total])
    }

    /// The record most recently read, if any.
    #[must_use]
    pub fn current(&self) -> Option<&[u8]> {
        (self.current_len > 0).then(|| &self.scratch.buf()[..self.current_len])
    }

    /// Exchanges the scratch (and the current record length) with the
    /// caller's buffer. Lets a merger keep the winning record without
    /// copying it.
    pub fn swap_scratch(&mut self, buf: &mut Vec<u8>, len: &mut usize) {
        self.scratch.swap(buf);
        std::mem::swap(&mut self.current_len, len);
    }

    /// Appends one serialized `[header][payload]` record.
    ///
    /// Fails with [`Error::Format`] when the slice length disagrees with
    /// the extractor's answer for the embedded header.
    ///
    /// # Panics
    ///
    /// Panics if the cursor is not at the end of the file; records are
    /// append-only.
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        assert!(
            self.byte_offset() == self.byte_size(),
            "variable-record writes are append-only"
        );
        let header_len = E::Header::ENCODED_SIZE;
        if record.len() < header_len {
            return Err(Error::Format(format!(
                "record of {} bytes is shorter than its {header_len}-byte header",
                record.len()
            )));
        }
        let header = E::Header::decode(&record[..header_len]);
        let expected = header_len + self.extractor.payload_len(&header);
        if record.len() != expected {
            return Err(Error::Format(format!(
                "record length {} disagrees with header-derived length {expected}",
                record.len()
            )));
        }
        self.stream.write_bytes(record)?;
        self.state.borrow_mut().items += 1;
        Ok(())
    }

    /// Appends `items` pre-serialized records in one pass. The caller
    /// vouches that `bytes` holds exactly that many well-formed records.
    ///
    /// # Panics
    ///
    /// Panics if the cursor is not at the end of the file.
    pub fn byte_write(&mut self, bytes: &[u8], items: u64) -> Result<()> {
        assert!(
            self.byte_offset() == self.byte_size(),
            "variable-record writes are append-only"
        );
        self.stream.write_bytes(bytes)?;
        self.state.borrow_mut().items += items;
        Ok(())
    }
}

/// A variable-record file with exactly one cursor.
///
/// Mirrors [`FileStream`](crate::block::FileStream) for run files of
/// variable-length records, registering its footprint with the global
/// memory registry.
pub struct VarFileStream<E: SizeExtractor, A: ScratchAllocator = ExponentialAllocator> {
    stream: VarStream<E, A>,
    file: VarFile<E>,
    registered: usize,
}

impl<E: SizeExtractor> VarFileStream<E, ExponentialAllocator> {
    /// Opens the file at `path` with one cursor at byte zero.
    pub fn open(
        path: impl AsRef<Path>,
        access: AccessType,
        extractor: E,
        block_factor: f64,
    ) -> Result<Self> {
        Self::open_with(path, access, extractor, block_factor, ExponentialAllocator::new())
    }
}

impl<E: SizeExtractor, A: ScratchAllocator> VarFileStream<E, A> {
    /// Opens the file at `path` reading into the given scratch allocator.
    pub fn open_with(
        path: impl AsRef<Path>,
        access: AccessType,
        extractor: E,
        block_factor: f64,
        scratch: A,
    ) -> Result<Self> {
        let file = VarFile::open(path, access, extractor, 0, block_factor)?;
        let stream = file.stream_with(scratch);
        let registered = Self::memory_usage(block_factor);
        memory::with_global(|r| r.register(registered));
        Ok(Self {
            stream,
            file,
            registered,
        })
    }

    /// Estimated resident size of a file plus one stream, excluding the
    /// scratch (which the caller sizes).
    #[must_use]
    pub fn memory_usage(block_factor: f64) -> usize {
        BlockFile::<u8>::memory_usage(block_factor)
            + BlockStream::<u8>::memory_usage()
            + SPACE_OVERHEAD
    }

    /// Logical number of records in the file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.stream.len()
    }

    /// Whether the file holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.file.path()
    }

    /// See [`VarStream::byte_offset`].
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        self.stream.byte_offset()
    }

    /// See [`VarStream::byte_size`].
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.stream.byte_size()
    }

    /// See [`VarStream::byte_seek`].
    pub fn byte_seek(&mut self, offset: u64) -> Result<()> {
        self.stream.byte_seek(offset)
    }

    /// See [`VarStream::can_read`].
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.stream.can_read()
    }

    /// See [`VarStream::read`].
    pub fn read(&mut self) -> Result<&[u8]> {
        self.stream.read()
    }

    /// See [`VarStream::current`].
    #[must_use]
    pub fn current(&self) -> Option<&[u8]> {
        self.stream.current()
    }

    /// See [`VarStream::swap_scratch`].
    pub fn swap_scratch(&mut self, buf: &mut Vec<u8>, len: &mut usize) {
        self.stream.swap_scratch(buf, len);
    }

    /// See [`VarStream::write`].
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        self.stream.write(record)
    }

    /// See [`VarStream::byte_write`].
    pub fn byte_write(&mut self, bytes: &[u8], items: u64) -> Result<()> {
        self.stream.byte_write(bytes, items)
    }

    /// Persists the item count and dirty blocks, propagating any failure;
    /// see [`VarFile::flush`].
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }
}

impl<E: SizeExtractor, A: ScratchAllocator> Drop for VarFileStream<E, A> {
    fn drop(&mut self) {
        memory::with_global(|r| r.release(self.registered));
    }
}
