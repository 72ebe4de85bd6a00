//! End-to-end file layer tests: persistence, seeks, and boundary cases.

use exmem_core::block::{
    calculate_block_factor, AccessType, BlockFile, FileStream, FixedRecord, Whence,
};
use exmem_core::varfile::{SizeExtractor, VarFile};
use exmem_core::Error;
use tempfile::tempdir;

fn tiny_factor() -> f64 {
    calculate_block_factor(128)
}

#[derive(Debug, Clone, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

impl FixedRecord for Point {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.x.to_le_bytes());
        buf[4..].copy_from_slice(&self.y.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            x: i32::decode(&buf[..4]),
            y: i32::decode(&buf[4..]),
        }
    }
}

#[test]
fn test_struct_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("points");
    {
        let mut fs: FileStream<Point> =
            FileStream::open(&path, AccessType::ReadWrite, tiny_factor()).unwrap();
        for i in 0..300 {
            fs.write(&Point { x: i, y: -i }).unwrap();
        }
    }
    let mut fs: FileStream<Point> =
        FileStream::open(&path, AccessType::Read, tiny_factor()).unwrap();
    assert_eq!(fs.len(), 300);
    fs.seek(0, Whence::Start).unwrap();
    for i in 0..300 {
        assert_eq!(fs.read().unwrap(), Point { x: i, y: -i });
    }
}

#[test]
fn test_interleaved_seek_read_write() {
    let dir = tempdir().unwrap();
    let mut fs: FileStream<u64> =
        FileStream::open(dir.path().join("mix"), AccessType::ReadWrite, tiny_factor()).unwrap();
    for i in 0..100u64 {
        fs.write(&i).unwrap();
    }
    // jump around: every read sees the latest write, repeated reads agree
    for &pos in &[99i64, 0, 57, 16, 16, 84] {
        fs.seek(pos, Whence::Start).unwrap();
        let first = fs.read().unwrap();
        fs.seek(pos, Whence::Start).unwrap();
        assert_eq!(fs.read().unwrap(), first);
        assert_eq!(first, pos as u64);
    }
    fs.seek(-1, Whence::End).unwrap();
    fs.write(&u64::MAX).unwrap();
    fs.seek(-1, Whence::Current).unwrap();
    assert_eq!(fs.read().unwrap(), u64::MAX);
    assert_eq!(fs.len(), 100);
}

#[test]
fn test_eviction_preserves_far_apart_writes() {
    let dir = tempdir().unwrap();
    // 32 items per block, far more blocks than the cache holds
    let mut fs: FileStream<u32> =
        FileStream::open(dir.path().join("wide"), AccessType::ReadWrite, tiny_factor()).unwrap();
    for i in 0..2000u32 {
        fs.write(&(i * 3)).unwrap();
    }
    // strided readback revisits evicted blocks
    for start in 0..4u32 {
        let mut pos = start;
        while (pos as u64) < fs.len() {
            fs.seek(pos as i64, Whence::Start).unwrap();
            assert_eq!(fs.read().unwrap(), pos * 3);
            pos += 997;
        }
    }
}

#[derive(Clone)]
struct Lengths;

impl SizeExtractor for Lengths {
    type Header = u32;

    fn payload_len(&self, header: &u32) -> usize {
        *header as usize
    }
}

fn var_record(payload: &[u8]) -> Vec<u8> {
    let mut rec = (payload.len() as u32).to_le_bytes().to_vec();
    rec.extend_from_slice(payload);
    rec
}

#[test]
fn test_zero_length_then_block_sized_payload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("edge");
    // one full block of payload, guaranteed to straddle a boundary after
    // the headers already written
    let big = vec![0xabu8; 128];
    {
        let file = VarFile::open(&path, AccessType::ReadWrite, Lengths, 0, tiny_factor()).unwrap();
        let mut s = file.stream();
        s.write(&var_record(&[])).unwrap();
        s.write(&var_record(&big)).unwrap();
        s.write(&var_record(&[])).unwrap();
    }
    let file = VarFile::open(&path, AccessType::Read, Lengths, 0, tiny_factor()).unwrap();
    assert_eq!(file.len(), 3);
    let mut s = file.stream();
    assert_eq!(s.read().unwrap(), var_record(&[]).as_slice());
    assert_eq!(s.read().unwrap(), var_record(&big).as_slice());
    assert_eq!(s.read().unwrap(), var_record(&[]).as_slice());
    assert!(!s.can_read());
}

#[test]
fn test_var_count_persists_without_explicit_close() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("implicit");
    {
        let file = VarFile::open(&path, AccessType::ReadWrite, Lengths, 0, tiny_factor()).unwrap();
        let mut s = file.stream();
        for i in 0..10u8 {
            s.write(&var_record(&vec![i; i as usize])).unwrap();
        }
        // no close(): drop order must still persist the count
    }
    let file = VarFile::open(&path, AccessType::Read, Lengths, 0, tiny_factor()).unwrap();
    assert_eq!(file.len(), 10);
}

#[test]
fn test_truncate_then_extend() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trunc");
    let mut file: BlockFile<u32> =
        BlockFile::open(&path, AccessType::ReadWrite, 0, tiny_factor()).unwrap();
    {
        let mut s = file.stream();
        for i in 0..100u32 {
            s.write(&i).unwrap();
        }
    }
    file.truncate(40).unwrap();
    assert_eq!(file.len(), 40);
    let mut s = file.stream();
    s.seek(0, Whence::End).unwrap();
    assert_eq!(s.offset(), 40);
    s.write(&4040).unwrap();
    s.seek(39, Whence::Start).unwrap();
    assert_eq!(s.read().unwrap(), 39);
    assert_eq!(s.read().unwrap(), 4040);
    assert!(matches!(s.read(), Err(Error::EndOfStream)));
}
