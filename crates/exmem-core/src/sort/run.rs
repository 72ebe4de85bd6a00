//! Run-file bookkeeping.

use std::path::PathBuf;

use exmem_common::temp::TempPolicy;

/// The dense sequence of run files one sorter instance produces.
///
/// Runs are named `<base>_<seq>` with sequence numbers counting up from
/// zero. Merging consumes the oldest runs and appends the merged result as
/// a fresh run, so the live window is a contiguous `first..next` range.
/// Paths handed out through [`pop_front`](RunSet::pop_front) or
/// [`drain`](RunSet::drain) become the caller's to delete; whatever is
/// still tracked is removed on drop.
pub(crate) struct RunSet {
    base: PathBuf,
    first: u64,
    next: u64,
}

impl RunSet {
    pub(crate) fn new(temp: &TempPolicy) -> Self {
        Self {
            base: temp.unique_path("sort"),
            first: 0,
            next: 0,
        }
    }

    pub(crate) fn name(&self, seq: u64) -> PathBuf {
        let mut name = self.base.clone().into_os_string();
        name.push(format!("_{seq}"));
        PathBuf::from(name)
    }

    /// Number of runs not yet consumed by a merge.
    pub(crate) fn live(&self) -> u64 {
        self.next - self.first
    }

    /// Allocates the next run's path; the caller creates the file.
    pub(crate) fn push(&mut self) -> PathBuf {
        let path = self.name(self.next);
        self.next += 1;
        path
    }

    /// Hands over the oldest live run; the caller now owns the file.
    pub(crate) fn pop_front(&mut self) -> PathBuf {
        assert!(self.first < self.next, "no live runs to take");
        let path = self.name(self.first);
        self.first += 1;
        path
    }

    /// Hands over every live run.
    pub(crate) fn drain(&mut self) -> Vec<PathBuf> {
        let paths = (self.first..self.next).map(|seq| self.name(seq)).collect();
        self.first = self.next;
        paths
    }
}

impl Drop for RunSet {
    fn drop(&mut self) {
        // Runs left behind by an abandoned sort must not outlive it.
        for seq in self.first..self.next {
            let _ = std::fs::remove_file(self.name(seq));
        }
    }
}
