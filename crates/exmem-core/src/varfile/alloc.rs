//! Scratch allocators backing variable-record reads.
//!
//! A stream over variable-length records materializes each record into a
//! scratch buffer before handing out a view. The allocator decides how that
//! buffer grows.

/// Owned, resizable byte scratch.
///
/// The buffer is always at least as large as the largest record requested
/// through [`ensure`](ScratchAllocator::ensure) since the last swap.
pub trait ScratchAllocator {
    /// Grows the buffer to hold at least `len` bytes, preserving contents.
    fn ensure(&mut self, len: usize);

    /// The current scratch contents.
    fn buf(&self) -> &[u8];

    /// Mutable view of the scratch.
    fn buf_mut(&mut self) -> &mut [u8];

    /// Exchanges the scratch with `other` wholesale.
    fn swap(&mut self, other: &mut Vec<u8>);
}

/// Doubles capacity on demand and never shrinks.
///
/// The default choice: amortizes reallocation when record sizes drift
/// upward over a scan.
#[derive(Debug, Default)]
pub struct ExponentialAllocator {
    buf: Vec<u8>,
}

impl ExponentialAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator pre-sized to `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
        }
    }
}

impl ScratchAllocator for ExponentialAllocator {
    fn ensure(&mut self, len: usize) {
        if len > self.buf.len() {
            self.buf.resize(len.next_power_of_two(), 0);
        }
    }

    fn buf(&self) -> &[u8] {
        &self.buf
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn swap(&mut self, other: &mut Vec<u8>) {
        std::mem::swap(&mut self.buf, other);
    }
}

/// Fixed-capacity scratch for callers with a hard per-record bound.
///
/// Used where memory was negotiated up front and a record larger than the
/// agreed bound is a caller bug.
#[derive(Debug)]
pub struct FixedAllocator {
    buf: Vec<u8>,
    capacity: usize,
}

impl FixedAllocator {
    /// Creates a scratch of exactly `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            capacity,
        }
    }

    /// The fixed capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl ScratchAllocator for FixedAllocator {
    fn ensure(&mut self, len: usize) {
        assert!(
            len <= self.capacity,
            "record of {len} bytes exceeds fixed scratch capacity {}",
            self.capacity
        );
        if self.buf.len() < self.capacity {
            self.buf.resize(self.capacity, 0);
        }
    }

    fn buf(&self) -> &[u8] {
        &self.buf
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn swap(&mut self, other: &mut Vec<u8>) {
        std::mem::swap(&mut self.buf, other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_preserves_contents() {
        let mut a = ExponentialAllocator::new();
        a.ensure(3);
        a.buf_mut()[..3].copy_from_slice(b"abc");
        a.ensure(100);
        assert!(a.buf().len() >= 100);
        assert_eq!(&a.buf()[..3], b"abc");
        let before = a.buf().len();
        a.ensure(10);
        assert_eq!(a.buf().len(), before);
    }

    #[test]
    #[should_panic(expected = "exceeds fixed scratch capacity")]
    fn test_fixed_overflow_panics() {
        let mut a = FixedAllocator::new(16);
        a.ensure(17);
    }

    #[test]
    fn test_fixed_swap() {
        let mut a = FixedAllocator::new(4);
        a.buf_mut().copy_from_slice(b"wxyz");
        let mut other = b"1234".to_vec();
        a.swap(&mut other);
        assert_eq!(a.buf(), b"1234");
        assert_eq!(other, b"wxyz");
    }
}
