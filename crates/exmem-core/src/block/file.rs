//! Block file: on-disk layout, block arena, and LRU write-back caching.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use exmem_common::memory::SPACE_OVERHEAD;
use exmem_common::{Error, Result};
use hashbrown::HashMap;
use tracing::trace;

use super::stream::BlockStream;
use super::{block_size, AccessType, FixedRecord, CACHE_BLOCKS};

const MAGIC: u32 = 0x4558_4d42; // "EXMB"
const VERSION: u32 = 1;

/// Fixed portion of the file header, ahead of the user-data blob.
const HEADER_FIXED: u64 = 32;

/// One cached window onto a block of the file.
///
/// `size` is the high-water mark of valid items in the block; it never
/// decreases while the block is a write target.
pub(crate) struct Block {
    pub(crate) number: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) size: usize,
    pub(crate) dirty: bool,
}

/// State shared between a [`BlockFile`] and every stream opened against it.
///
/// The arena maps block numbers to at most one cached block each. A block is
/// pinned while some stream holds its `Rc`; eviction only considers unpinned
/// blocks, least recently used first.
pub(crate) struct FileCore {
    file: File,
    path: PathBuf,
    access: AccessType,
    pub(crate) item_size: usize,
    pub(crate) block_items: usize,
    block_bytes: usize,
    header_len: u64,
    user_data: Vec<u8>,
    /// Logical item count; equals the highest offset ever written.
    pub(crate) size: u64,
    pub(crate) open: bool,
    pub(crate) streams: usize,
    blocks: HashMap<u64, Rc<RefCell<Block>>>,
    lru: VecDeque<u64>,
}

impl FileCore {
    fn new(
        file: File,
        path: PathBuf,
        access: AccessType,
        item_size: usize,
        block_bytes: usize,
        user_data: Vec<u8>,
        size: u64,
    ) -> Self {
        let header_len = HEADER_FIXED + user_data.len() as u64;
        Self {
            file,
            path,
            access,
            item_size,
            block_items: block_bytes / item_size,
            block_bytes,
            header_len,
            user_data,
            size,
            open: true,
            streams: 0,
            blocks: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.access.writable()
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.access.readable()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cached block for `number`, loading (and possibly
    /// evicting) as needed. The returned block is pinned for as long as the
    /// caller holds the `Rc`.
    pub(crate) fn get_block(&mut self, number: u64) -> Result<Rc<RefCell<Block>>> {
        if let Some(block) = self.blocks.get(&number) {
            let block = Rc::clone(block);
            self.touch(number);
            return Ok(block);
        }
        if self.blocks.len() >= CACHE_BLOCKS {
            self.evict_one()?;
        }
        let block = self.load_block(number)?;
        let block = Rc::new(RefCell::new(block));
        self.blocks.insert(number, Rc::clone(&block));
        self.lru.push_back(number);
        Ok(block)
    }

    fn touch(&mut self, number: u64) {
        if let Some(pos) = self.lru.iter().position(|&n| n == number) {
            self.lru.remove(pos);
            self.lru.push_back(number);
        }
    }

    /// Evicts the least-recently-used block no stream is pinning, writing it
    /// back first if dirty. Does nothing when every cached block is pinned;
    /// the arena then grows past its soft capacity.
    fn evict_one(&mut self) -> Result<()> {
        let victim = self
            .lru
            .iter()
            .position(|n| self.blocks.get(n).is_some_and(|b| Rc::strong_count(b) == 1));
        let Some(pos) = victim else {
            return Ok(());
        };
        let number = self.lru.remove(pos).expect("lru position is valid");
        if let Some(block) = self.blocks.remove(&number) {
            let block = block.borrow();
            if block.dirty {
                trace!(block = number, items = block.size, "evicting dirty block");
                self.write_back(&block)?;
            }
        }
        Ok(())
    }

    fn load_block(&mut self, number: u64) -> Result<Block> {
        let mut data = vec![0u8; self.block_bytes];
        let offset = self.header_len + number * self.block_bytes as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        // Blocks past the physical end of the file stay zero-filled.
        while filled < data.len() {
            let n = self.file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Block {
            number,
            data,
            size: self.valid_items(number),
            dirty: false,
        })
    }

    /// Number of valid items in block `number` according to the logical size.
    fn valid_items(&self, number: u64) -> usize {
        let start = number * self.block_items as u64;
        if self.size <= start {
            0
        } else {
            (self.size - start).min(self.block_items as u64) as usize
        }
    }

    fn write_back(&mut self, block: &Block) -> Result<()> {
        let offset = self.header_len + block.number * self.block_bytes as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&block.data[..block.size * self.item_size])?;
        Ok(())
    }

    /// Writes every dirty cached block back to disk, keeping it cached.
    fn flush_blocks(&mut self) -> Result<()> {
        let blocks: Vec<_> = self.blocks.values().map(Rc::clone).collect();
        for block in blocks {
            let mut block = block.borrow_mut();
            if block.dirty {
                self.write_back(&block)?;
                block.dirty = false;
            }
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = vec![0u8; self.header_len as usize];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&(self.item_size as u64).to_le_bytes());
        header[16..24].copy_from_slice(&(self.user_data.len() as u64).to_le_bytes());
        header[24..32].copy_from_slice(&self.size.to_le_bytes());
        header[32..].copy_from_slice(&self.user_data);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    /// Writes every dirty block and the header out to the OS, keeping the
    /// file open and the cache warm. No-op on read-only or closed files.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.open && self.is_writable() {
            self.flush_blocks()?;
            self.write_header()?;
            self.file.flush()?;
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        assert!(
            self.streams == 0,
            "cannot close {:?}: {} stream(s) still open",
            self.path,
            self.streams
        );
        self.flush()?;
        self.blocks.clear();
        self.lru.clear();
        self.open = false;
        Ok(())
    }

    fn truncate(&mut self, items: u64) -> Result<()> {
        self.size = items;
        let block_items = self.block_items as u64;
        self.blocks.retain(|&n, block| {
            let start = n * block_items;
            if start >= items {
                return false;
            }
            let mut b = block.borrow_mut();
            b.size = b.size.min((items - start).min(block_items) as usize);
            true
        });
        self.lru.retain(|n| self.blocks.contains_key(n));
        self.file
            .set_len(self.header_len + items * self.item_size as u64)?;
        Ok(())
    }
}

impl Drop for FileCore {
    fn drop(&mut self) {
        // Best-effort durability when the file is dropped without close().
        // Callers who must observe write failures flush explicitly first.
        let _ = self.flush();
    }
}

/// A file of fixed-size records with block caching.
///
/// The file owns the block arena; any number of [`BlockStream`] cursors may
/// be opened against it, each pinning at most one block. The file must not
/// be closed while streams are alive, and it outlives its streams (the
/// underlying state is shared, so dropping the `BlockFile` first is safe).
pub struct BlockFile<T: FixedRecord> {
    core: Rc<RefCell<FileCore>>,
    _marker: PhantomData<T>,
}

impl<T: FixedRecord> BlockFile<T> {
    /// Opens (creating if writable) the file at `path`.
    ///
    /// `user_data_len` reserves a metadata blob in the file header, written
    /// back on close. Opening an existing file whose stored item size or
    /// user-data capacity disagrees is a [`Error::Format`] failure.
    pub fn open(
        path: impl AsRef<Path>,
        access: AccessType,
        user_data_len: usize,
        block_factor: f64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let item_size = T::ENCODED_SIZE;
        let block_bytes = block_size(block_factor);
        assert!(
            block_bytes >= item_size,
            "block size {block_bytes} is smaller than one {item_size}-byte record"
        );
        let block_bytes = block_bytes - block_bytes % item_size;

        let file = OpenOptions::new()
            .read(true)
            .write(access.writable())
            .create(access.writable())
            .open(&path)?;

        let physical = file.metadata()?.len();
        let (user_data, size) = if physical == 0 {
            (vec![0u8; user_data_len], 0)
        } else {
            Self::read_header(&file, item_size, user_data_len)?
        };

        let core = FileCore::new(file, path, access, item_size, block_bytes, user_data, size);
        Ok(Self {
            core: Rc::new(RefCell::new(core)),
            _marker: PhantomData,
        })
    }

    fn read_header(mut file: &File, item_size: usize, user_data_len: usize) -> Result<(Vec<u8>, u64)> {
        let mut fixed = [0u8; HEADER_FIXED as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut fixed)
            .map_err(|_| Error::Format("file too short for header".to_string()))?;
        let magic = u32::from_le_bytes(fixed[0..4].try_into().expect("4 bytes"));
        let version = u32::from_le_bytes(fixed[4..8].try_into().expect("4 bytes"));
        let stored_item = u64::from_le_bytes(fixed[8..16].try_into().expect("8 bytes"));
        let stored_user = u64::from_le_bytes(fixed[16..24].try_into().expect("8 bytes"));
        let count = u64::from_le_bytes(fixed[24..32].try_into().expect("8 bytes"));
        if magic != MAGIC || version != VERSION {
            return Err(Error::Format("not an exmem block file".to_string()));
        }
        if stored_item != item_size as u64 {
            return Err(Error::Format(format!(
                "item size mismatch: file has {stored_item}, expected {item_size}"
            )));
        }
        if stored_user != user_data_len as u64 {
            return Err(Error::Format(format!(
                "user data size mismatch: file has {stored_user}, expected {user_data_len}"
            )));
        }
        let mut user_data = vec![0u8; user_data_len];
        file.read_exact(&mut user_data)
            .map_err(|_| Error::Format("truncated user data".to_string()))?;
        Ok((user_data, count))
    }

    /// Logical number of items in the file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.core.borrow().size
    }

    /// Whether the file holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether streams may read from this file.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.core.borrow().is_readable()
    }

    /// Whether streams may write to this file.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.core.borrow().is_writable()
    }

    /// Whether the file is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.borrow().open
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.core.borrow().path().to_path_buf()
    }

    /// Opens a new cursor over this file.
    ///
    /// # Panics
    ///
    /// Panics if the file has been closed.
    #[must_use]
    pub fn stream(&self) -> BlockStream<T> {
        assert!(self.is_open(), "cannot open a stream on a closed file");
        BlockStream::new(Rc::clone(&self.core))
    }

    /// Copies the user-data blob into `out`, whose length must equal the
    /// capacity reserved at open.
    pub fn read_user_data(&self, out: &mut [u8]) -> Result<()> {
        let core = self.core.borrow();
        if out.len() != core.user_data.len() {
            return Err(Error::Format(format!(
                "user data size mismatch: file has {}, caller asked for {}",
                core.user_data.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&core.user_data);
        Ok(())
    }

    /// Replaces the user-data blob; persisted when the file is closed.
    pub fn write_user_data(&mut self, data: &[u8]) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if data.len() != core.user_data.len() {
            return Err(Error::Format(format!(
                "user data size mismatch: file has {}, caller supplied {}",
                core.user_data.len(),
                data.len()
            )));
        }
        core.user_data.copy_from_slice(data);
        Ok(())
    }

    /// Shrinks the file to `items` logical items.
    pub fn truncate(&mut self, items: u64) -> Result<()> {
        self.core.borrow_mut().truncate(items)
    }

    /// Writes dirty blocks and the header out to the OS without closing.
    ///
    /// Unlike the best-effort write-back on drop, failures propagate; call
    /// this whenever a write error must not go unnoticed.
    pub fn flush(&mut self) -> Result<()> {
        self.core.borrow_mut().flush()
    }

    /// Flushes dirty blocks and the header, then marks the file closed.
    ///
    /// No-op when already closed.
    ///
    /// # Panics
    ///
    /// Panics if any stream into the file is still alive.
    pub fn close(&mut self) -> Result<()> {
        self.core.borrow_mut().close()
    }

    /// Estimated resident size of the file, dominated by the block arena.
    ///
    /// The arena retains up to [`CACHE_BLOCKS`] blocks, pinned ones
    /// included, so the estimate charges for all of them.
    #[must_use]
    pub fn memory_usage(block_factor: f64) -> usize {
        std::mem::size_of::<FileCore>()
            + std::mem::size_of::<Self>()
            + CACHE_BLOCKS * (std::mem::size_of::<Block>() + block_size(block_factor))
            + SPACE_OVERHEAD
    }
}
