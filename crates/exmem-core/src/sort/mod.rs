//! External merge sort.
//!
//! Items are accumulated into a memory-budgeted buffer, sorted in place,
//! and flushed as runs; runs are then k-way merged down to a single sorted
//! stream. Fixed-size records sort a `Vec` of decoded values; variable
//! records sort an offset index over a packed byte arena and never move
//! the payloads.
//!
//! [`Sort`] and [`VarSort`] push their sorted output into a destination
//! stage; [`PullSort`] and [`PullVarSort`] are drained by pulling.

pub(crate) mod merge;
pub(crate) mod run;

mod fixed;
mod var;

pub use fixed::{PullSort, Sort};
pub use merge::{RunMerger, VarRunMerger};
pub use var::{PullVarSort, VarSort};

use std::cmp::Ordering;

use exmem_common::temp::TempPolicy;

/// Fewest items a sort buffer is ever sized for.
pub(crate) const MIN_BUFFER_ITEMS: usize = 2;

/// Hard cap on simultaneously open run files, independent of budget.
pub(crate) const MAX_OPEN_RUNS: usize = 128;

/// Ordering policy over records.
///
/// Implemented for any `Fn(&T, &T) -> Ordering` closure; [`NaturalOrder`]
/// covers `Ord` types. Mergers clone the comparator, one copy per phase.
pub trait RecordCompare<T: ?Sized> {
    /// Total order over records.
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

impl<T: ?Sized, F: Fn(&T, &T) -> Ordering> RecordCompare<T> for F {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}

/// Compares `Ord` records by their own ordering. Byte-slice records sort
/// lexicographically.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<T: Ord + ?Sized> RecordCompare<T> for NaturalOrder {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

/// Knobs shared by every sorter.
#[derive(Debug, Clone, Default)]
pub struct SortOptions {
    /// Block size factor for run files, as a fraction of the base block
    /// size. Zero means the default factor of 1.
    pub block_factor: f64,
    /// Where and how run files are named.
    pub temp: TempPolicy,
}

impl SortOptions {
    /// Default options: full-size blocks, system temp directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_factor: 1.0,
            temp: TempPolicy::default(),
        }
    }

    /// Sets the run-file block factor.
    #[must_use]
    pub fn with_block_factor(mut self, factor: f64) -> Self {
        self.block_factor = factor;
        self
    }

    /// Sets the temp-file policy for run files.
    #[must_use]
    pub fn with_temp(mut self, temp: TempPolicy) -> Self {
        self.temp = temp;
        self
    }

    pub(crate) fn factor(&self) -> f64 {
        if self.block_factor > 0.0 {
            self.block_factor
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_order_on_ints_and_bytes() {
        assert_eq!(NaturalOrder.compare(&1u32, &2u32), Ordering::Less);
        assert_eq!(
            NaturalOrder.compare(b"abc".as_slice(), b"ab".as_slice()),
            Ordering::Greater
        );
    }

    #[test]
    fn test_closure_comparator() {
        let reverse = |a: &u32, b: &u32| b.cmp(a);
        assert_eq!(reverse.compare(&1, &2), Ordering::Greater);
    }
}
