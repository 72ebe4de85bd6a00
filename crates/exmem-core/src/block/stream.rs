//! Cursors over block files.
//!
//! A [`BlockStream`] is a position within one [`BlockFile`], pinning at most
//! one cached block at a time. [`FileStream`] bundles a file with a single
//! stream for the common one-cursor case and accounts for its memory with
//! the global registry.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use exmem_common::memory::{self, SPACE_OVERHEAD};
use exmem_common::{Error, Result};

use super::file::{Block, BlockFile, FileCore};
use super::{AccessType, FixedRecord, Whence};

/// One read/write cursor into a [`BlockFile`].
///
/// Seeking is cheap: the target block is only loaded when the next item is
/// actually read or written. The stream pins the block it last touched,
/// keeping it out of eviction until the cursor moves on or the stream drops.
pub struct BlockStream<T: FixedRecord> {
    core: Rc<RefCell<FileCore>>,
    pos: u64,
    block: Option<Rc<RefCell<Block>>>,
    _marker: PhantomData<T>,
}

impl<T: FixedRecord> BlockStream<T> {
    pub(crate) fn new(core: Rc<RefCell<FileCore>>) -> Self {
        core.borrow_mut().streams += 1;
        Self {
            core,
            pos: 0,
            block: None,
            _marker: PhantomData,
        }
    }

    /// Current item offset of the cursor.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.pos
    }

    /// Logical number of items in the underlying file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.core.borrow().size
    }

    /// Whether the underlying file holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the cursor. Offsets from `Whence::End` are relative to the
    /// logical size; the one-past-the-end position is a valid target.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<()> {
        let size = self.len();
        let base = match whence {
            Whence::Start => 0i64,
            Whence::Current => self.pos as i64,
            Whence::End => size as i64,
        };
        let target = base + offset;
        if target < 0 || target as u64 > size {
            return Err(Error::OutOfRange {
                offset: target,
                size,
            });
        }
        self.pos = target as u64;
        Ok(())
    }

    /// Whether a forward read would succeed.
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.core.borrow().is_readable() && self.pos < self.len()
    }

    /// Whether a backward read would succeed.
    #[must_use]
    pub fn can_read_back(&self) -> bool {
        self.core.borrow().is_readable() && self.pos > 0
    }

    /// Reads the item at the cursor and advances.
    ///
    /// Returns [`Error::EndOfStream`] at the end of the file.
    ///
    /// # Panics
    ///
    /// Panics if the file was opened write-only.
    pub fn read(&mut self) -> Result<T> {
        assert!(
            self.core.borrow().is_readable(),
            "read on a write-only stream"
        );
        if self.pos >= self.len() {
            return Err(Error::EndOfStream);
        }
        let item_size = self.core.borrow().item_size;
        let block_items = self.core.borrow().block_items;
        let block = self.pin_block(self.pos / block_items as u64)?;
        let idx = (self.pos % block_items as u64) as usize;
        let block = block.borrow();
        let item = T::decode(&block.data[idx * item_size..(idx + 1) * item_size]);
        self.pos += 1;
        Ok(item)
    }

    /// Reads the item just before the cursor and moves back over it.
    ///
    /// Returns [`Error::EndOfStream`] at the start of the file.
    ///
    /// # Panics
    ///
    /// Panics if the file was opened write-only.
    pub fn read_back(&mut self) -> Result<T> {
        assert!(
            self.core.borrow().is_readable(),
            "read on a write-only stream"
        );
        if self.pos == 0 {
            return Err(Error::EndOfStream);
        }
        self.pos -= 1;
        let item_size = self.core.borrow().item_size;
        let block_items = self.core.borrow().block_items;
        let block = self.pin_block(self.pos / block_items as u64)?;
        let idx = (self.pos % block_items as u64) as usize;
        let block = block.borrow();
        Ok(T::decode(&block.data[idx * item_size..(idx + 1) * item_size]))
    }

    /// Writes at the cursor and advances, overwriting in the middle of the
    /// file and extending it at the end.
    pub fn write(&mut self, item: &T) -> Result<()> {
        if !self.core.borrow().is_writable() {
            return Err(Error::ReadOnly);
        }
        let item_size = self.core.borrow().item_size;
        let block_items = self.core.borrow().block_items;
        let block = self.pin_block(self.pos / block_items as u64)?;
        let idx = (self.pos % block_items as u64) as usize;
        {
            let mut block = block.borrow_mut();
            item.encode(&mut block.data[idx * item_size..(idx + 1) * item_size]);
            block.size = block.size.max(idx + 1);
            block.dirty = true;
        }
        self.pos += 1;
        let mut core = self.core.borrow_mut();
        core.size = core.size.max(self.pos);
        Ok(())
    }

    fn pin_block(&mut self, number: u64) -> Result<Rc<RefCell<Block>>> {
        if let Some(block) = &self.block {
            if block.borrow().number == number {
                return Ok(Rc::clone(block));
            }
        }
        self.block = None;
        let block = self.core.borrow_mut().get_block(number)?;
        self.block = Some(Rc::clone(&block));
        Ok(block)
    }

    /// Estimated resident size of one stream. The pinned block lives in the
    /// file's arena and is charged there.
    #[must_use]
    pub fn memory_usage() -> usize {
        std::mem::size_of::<Self>() + SPACE_OVERHEAD
    }
}

impl BlockStream<u8> {
    /// Fills `out` from the cursor, advancing past it. Fails with
    /// [`Error::EndOfStream`] without consuming anything if fewer than
    /// `out.len()` bytes remain.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        assert!(
            self.core.borrow().is_readable(),
            "read on a write-only stream"
        );
        if self.pos + out.len() as u64 > self.len() {
            return Err(Error::EndOfStream);
        }
        let block_items = self.core.borrow().block_items;
        let mut done = 0;
        while done < out.len() {
            let block = self.pin_block(self.pos / block_items as u64)?;
            let idx = (self.pos % block_items as u64) as usize;
            let n = (out.len() - done).min(block_items - idx);
            let block = block.borrow();
            out[done..done + n].copy_from_slice(&block.data[idx..idx + n]);
            done += n;
            self.pos += n as u64;
        }
        Ok(())
    }

    /// Writes `bytes` at the cursor, advancing past them.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.core.borrow().is_writable() {
            return Err(Error::ReadOnly);
        }
        let block_items = self.core.borrow().block_items;
        let mut done = 0;
        while done < bytes.len() {
            let block = self.pin_block(self.pos / block_items as u64)?;
            let idx = (self.pos % block_items as u64) as usize;
            let n = (bytes.len() - done).min(block_items - idx);
            {
                let mut block = block.borrow_mut();
                block.data[idx..idx + n].copy_from_slice(&bytes[done..done + n]);
                block.size = block.size.max(idx + n);
                block.dirty = true;
            }
            done += n;
            self.pos += n as u64;
        }
        let mut core = self.core.borrow_mut();
        core.size = core.size.max(self.pos);
        Ok(())
    }
}

impl<T: FixedRecord> Drop for BlockStream<T> {
    fn drop(&mut self) {
        self.block = None;
        self.core.borrow_mut().streams -= 1;
    }
}

/// A block file with exactly one cursor, opened and torn down together.
///
/// Run files and other single-reader temporaries use this shape. Its
/// estimated footprint is registered with the global memory registry for
/// the lifetime of the value.
pub struct FileStream<T: FixedRecord> {
    stream: BlockStream<T>,
    file: BlockFile<T>,
    registered: usize,
}

impl<T: FixedRecord> FileStream<T> {
    /// Opens the file at `path` with a single cursor at offset zero.
    pub fn open(path: impl AsRef<Path>, access: AccessType, block_factor: f64) -> Result<Self> {
        let file = BlockFile::open(path, access, 0, block_factor)?;
        let stream = file.stream();
        let registered = Self::memory_usage(block_factor);
        memory::with_global(|r| r.register(registered));
        Ok(Self {
            stream,
            file,
            registered,
        })
    }

    /// Estimated resident size of a file plus one stream, block cache
    /// included.
    #[must_use]
    pub fn memory_usage(block_factor: f64) -> usize {
        BlockFile::<T>::memory_usage(block_factor) + BlockStream::<T>::memory_usage()
    }

    /// Writes dirty blocks and the header out to the OS, propagating any
    /// failure; see [`BlockFile::flush`].
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    /// Logical number of items in the file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.stream.len()
    }

    /// Whether the file holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Current item offset of the cursor.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.stream.offset()
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.file.path()
    }

    /// See [`BlockStream::seek`].
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<()> {
        self.stream.seek(offset, whence)
    }

    /// See [`BlockStream::can_read`].
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.stream.can_read()
    }

    /// See [`BlockStream::can_read_back`].
    #[must_use]
    pub fn can_read_back(&self) -> bool {
        self.stream.can_read_back()
    }

    /// See [`BlockStream::read`].
    pub fn read(&mut self) -> Result<T> {
        self.stream.read()
    }

    /// See [`BlockStream::read_back`].
    pub fn read_back(&mut self) -> Result<T> {
        self.stream.read_back()
    }

    /// See [`BlockStream::write`].
    pub fn write(&mut self, item: &T) -> Result<()> {
        self.stream.write(item)
    }
}

impl<T: FixedRecord> Drop for FileStream<T> {
    fn drop(&mut self) {
        memory::with_global(|r| r.release(self.registered));
    }
}
