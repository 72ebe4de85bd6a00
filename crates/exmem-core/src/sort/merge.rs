//! K-way merging of sorted run files.
//!
//! A merger holds one open reader per run and a binary heap of run indices
//! keyed by each run's head record. Pulling yields the global minimum and
//! advances that run. Run files belong to the merger: they are deleted
//! when it drops, consumed or not.

use std::path::PathBuf;

use exmem_common::temp::TempFile;
use exmem_common::{Error, Result};

use super::RecordCompare;
use crate::block::{AccessType, FileStream, FixedRecord};
use crate::varfile::{SizeExtractor, VarFileStream};

/// Restores the min-heap property downward from `pos`. `less(a, b)` orders
/// run indices by their head records.
pub(crate) fn sift_down(
    heap: &mut [usize],
    mut pos: usize,
    mut less: impl FnMut(usize, usize) -> bool,
) {
    loop {
        let left = 2 * pos + 1;
        if left >= heap.len() {
            break;
        }
        let mut child = left;
        let right = left + 1;
        if right < heap.len() && less(heap[right], heap[left]) {
            child = right;
        }
        if less(heap[child], heap[pos]) {
            heap.swap(child, pos);
            pos = child;
        } else {
            break;
        }
    }
}

/// Builds a min-heap in place.
pub(crate) fn heapify(heap: &mut [usize], mut less: impl FnMut(usize, usize) -> bool) {
    for pos in (0..heap.len() / 2).rev() {
        sift_down(heap, pos, &mut less);
    }
}

/// Merger over runs of fixed-size records.
pub struct RunMerger<T: FixedRecord, C: RecordCompare<T>> {
    streams: Vec<FileStream<T>>,
    _guards: Vec<TempFile>,
    heads: Vec<Option<T>>,
    heap: Vec<usize>,
    current: Option<T>,
    comparator: C,
    remaining: u64,
}

impl<T: FixedRecord, C: RecordCompare<T>> RunMerger<T, C> {
    /// Opens every run for reading and primes the heap with each run's
    /// first record. The merger takes ownership of the files.
    pub(crate) fn open(paths: Vec<PathBuf>, comparator: C, block_factor: f64) -> Result<Self> {
        let mut streams = Vec::with_capacity(paths.len());
        let mut guards = Vec::with_capacity(paths.len());
        let mut heads = Vec::with_capacity(paths.len());
        let mut heap = Vec::with_capacity(paths.len());
        let mut remaining = 0;
        for path in paths {
            let mut stream: FileStream<T> =
                FileStream::open(&path, AccessType::Read, block_factor)?;
            guards.push(TempFile::from_path(path));
            remaining += stream.len();
            if stream.can_read() {
                heap.push(heads.len());
                heads.push(Some(stream.read()?));
            } else {
                heads.push(None);
            }
            streams.push(stream);
        }
        let comparator_ref = &comparator;
        heapify(&mut heap, |a, b| {
            head_less(comparator_ref, &heads, a, b)
        });
        Ok(Self {
            streams,
            _guards: guards,
            heads,
            heap,
            current: None,
            comparator,
            remaining,
        })
    }

    /// Whether another record is available.
    #[must_use]
    pub fn can_pull(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Records not yet pulled.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Yields the smallest head record and advances its run.
    pub fn pull(&mut self) -> Result<&T> {
        let Some(&winner) = self.heap.first() else {
            return Err(Error::EndOfStream);
        };
        let item = self.heads[winner].take().ok_or(Error::EndOfStream)?;
        if self.streams[winner].can_read() {
            self.heads[winner] = Some(self.streams[winner].read()?);
        } else {
            let last = self.heap.pop().unwrap_or(winner);
            if !self.heap.is_empty() {
                self.heap[0] = last;
            }
        }
        let Self {
            heap,
            heads,
            comparator,
            ..
        } = self;
        if !heap.is_empty() {
            sift_down(heap, 0, |a, b| head_less(&*comparator, heads, a, b));
        }
        self.remaining -= 1;
        Ok(self.current.insert(item))
    }
}

fn head_less<T, C: RecordCompare<T>>(
    comparator: &C,
    heads: &[Option<T>],
    a: usize,
    b: usize,
) -> bool {
    match (&heads[a], &heads[b]) {
        (Some(a), Some(b)) => comparator.compare(a, b).is_lt(),
        // heap entries always have a head; empty slots sort last
        (Some(_), None) => true,
        _ => false,
    }
}

/// Merger over runs of variable-length records.
///
/// Each reader's head record lives in that reader's scratch; pulling swaps
/// the winner's scratch with the merger's output buffer instead of copying
/// the payload.
pub struct VarRunMerger<E: SizeExtractor, C: RecordCompare<[u8]>> {
    streams: Vec<VarFileStream<E>>,
    _guards: Vec<TempFile>,
    heap: Vec<usize>,
    out: Vec<u8>,
    out_len: usize,
    comparator: C,
    remaining: u64,
}

impl<E: SizeExtractor, C: RecordCompare<[u8]>> VarRunMerger<E, C> {
    pub(crate) fn open(
        paths: Vec<PathBuf>,
        extractor: E,
        comparator: C,
        block_factor: f64,
    ) -> Result<Self> {
        let mut streams = Vec::with_capacity(paths.len());
        let mut guards = Vec::with_capacity(paths.len());
        let mut heap = Vec::with_capacity(paths.len());
        let mut remaining = 0;
        for path in paths {
            let mut stream =
                VarFileStream::open(&path, AccessType::Read, extractor.clone(), block_factor)?;
            guards.push(TempFile::from_path(path));
            remaining += stream.len();
            if stream.can_read() {
                stream.read()?;
                heap.push(streams.len());
            }
            streams.push(stream);
        }
        let comparator_ref = &comparator;
        heapify(&mut heap, |a, b| {
            var_head_less(comparator_ref, &streams, a, b)
        });
        Ok(Self {
            streams,
            _guards: guards,
            heap,
            out: Vec::new(),
            out_len: 0,
            comparator,
            remaining,
        })
    }

    /// Whether another record is available.
    #[must_use]
    pub fn can_pull(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Records not yet pulled.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Yields the smallest head record, valid until the next pull.
    pub fn pull(&mut self) -> Result<&[u8]> {
        let Some(&winner) = self.heap.first() else {
            return Err(Error::EndOfStream);
        };
        // Keep the winner's record by trading buffers, not copying bytes.
        self.streams[winner].swap_scratch(&mut self.out, &mut self.out_len);
        if self.streams[winner].can_read() {
            self.streams[winner].read()?;
        } else {
            let last = self.heap.pop().unwrap_or(winner);
            if !self.heap.is_empty() {
                self.heap[0] = last;
            }
        }
        let Self {
            heap,
            streams,
            comparator,
            ..
        } = self;
        if !heap.is_empty() {
            sift_down(heap, 0, |a, b| var_head_less(&*comparator, streams, a, b));
        }
        self.remaining -= 1;
        Ok(&self.out[..self.out_len])
    }
}

fn var_head_less<E: SizeExtractor, C: RecordCompare<[u8]>>(
    comparator: &C,
    streams: &[VarFileStream<E>],
    a: usize,
    b: usize,
) -> bool {
    match (streams[a].current(), streams[b].current()) {
        (Some(a), Some(b)) => comparator.compare(a, b).is_lt(),
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::calculate_block_factor;
    use crate::sort::NaturalOrder;
    use crate::varfile::VarFile;
    use tempfile::tempdir;

    fn tiny_factor() -> f64 {
        calculate_block_factor(128)
    }

    fn write_run(path: &std::path::Path, items: &[u32]) {
        let mut fs: FileStream<u32> =
            FileStream::open(path, AccessType::ReadWrite, tiny_factor()).unwrap();
        for item in items {
            fs.write(item).unwrap();
        }
    }

    #[test]
    fn test_three_way_merge() {
        let dir = tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("run_{i}"))).collect();
        write_run(&paths[0], &[1, 5, 9, 13]);
        write_run(&paths[1], &[2, 6, 10]);
        write_run(&paths[2], &[0, 3, 4, 7, 8, 11, 12]);
        let mut merger: RunMerger<u32, NaturalOrder> =
            RunMerger::open(paths.clone(), NaturalOrder, tiny_factor()).unwrap();
        assert_eq!(merger.remaining(), 14);
        let mut out = Vec::new();
        while merger.can_pull() {
            out.push(*merger.pull().unwrap());
        }
        assert_eq!(out, (0..14).collect::<Vec<u32>>());
        assert!(matches!(merger.pull(), Err(Error::EndOfStream)));
        drop(merger);
        for path in paths {
            assert!(!path.exists(), "run files are deleted on drop");
        }
    }

    #[test]
    fn test_unconsumed_runs_deleted_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_0");
        write_run(&path, &[1, 2, 3]);
        let merger: RunMerger<u32, NaturalOrder> =
            RunMerger::open(vec![path.clone()], NaturalOrder, tiny_factor()).unwrap();
        drop(merger);
        assert!(!path.exists());
    }

    #[derive(Clone)]
    struct Blob;

    impl SizeExtractor for Blob {
        type Header = u32;

        fn payload_len(&self, header: &u32) -> usize {
            *header as usize
        }
    }

    fn blob(payload: &[u8]) -> Vec<u8> {
        let mut rec = (payload.len() as u32).to_le_bytes().to_vec();
        rec.extend_from_slice(payload);
        rec
    }

    fn write_var_run(path: &std::path::Path, records: &[&[u8]]) {
        let file = VarFile::open(path, AccessType::ReadWrite, Blob, 0, tiny_factor()).unwrap();
        let mut s = file.stream();
        for payload in records {
            s.write(&blob(payload)).unwrap();
        }
    }

    #[test]
    fn test_var_merge_with_buffer_swap() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("vrun_0");
        let b = dir.path().join("vrun_1");
        // compare by payload only, skipping the 4-byte header
        let by_payload = |x: &[u8], y: &[u8]| x[4..].cmp(&y[4..]);
        write_var_run(&a, &[b"apple", b"melon", b"pear"]);
        write_var_run(&b, &[b"banana", b"kiwi", b"plum"]);
        let mut merger =
            VarRunMerger::open(vec![a.clone(), b.clone()], Blob, by_payload, tiny_factor())
                .unwrap();
        let mut out = Vec::new();
        while merger.can_pull() {
            let rec = merger.pull().unwrap();
            out.push(rec[4..].to_vec());
        }
        let expected: Vec<Vec<u8>> = ["apple", "banana", "kiwi", "melon", "pear", "plum"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        assert_eq!(out, expected);
        drop(merger);
        assert!(!a.exists() && !b.exists());
    }
}
