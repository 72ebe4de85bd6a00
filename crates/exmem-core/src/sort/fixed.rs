//! Sorters for fixed-size records.

use exmem_common::memory::SPACE_OVERHEAD;
use exmem_common::temp::TempFile;
use exmem_common::Result;
use tracing::debug;

use super::merge::RunMerger;
use super::run::RunSet;
use super::{RecordCompare, SortOptions, MAX_OPEN_RUNS, MIN_BUFFER_ITEMS};
use crate::block::{AccessType, FileStream, FixedRecord};
use crate::streaming::{Grants, MemoryPlan, MemorySplit, MemoryUser, Phase, PullStage, PushStage};

/// Run formation shared by the push and pull sorters.
struct SortCore<T: FixedRecord, C: RecordCompare<T> + Clone> {
    comparator: C,
    options: SortOptions,
    runs: RunSet,
    buffer: Vec<T>,
    capacity: usize,
    mem: MemorySplit,
    total: u64,
}

impl<T: FixedRecord, C: RecordCompare<T> + Clone> SortCore<T, C> {
    fn new(comparator: C, options: SortOptions) -> Self {
        let stream_usage = FileStream::<T>::memory_usage(options.factor());
        let base = std::mem::size_of::<Self>();
        // input: the run-writer stream plus a buffer of at least two items
        let minimum_in =
            base + stream_usage + 2 * SPACE_OVERHEAD + MIN_BUFFER_ITEMS * T::ENCODED_SIZE;
        // output: at least two merge inputs and the merged result
        let minimum_out = base + 3 * (stream_usage + SPACE_OVERHEAD);
        Self {
            runs: RunSet::new(&options.temp),
            comparator,
            options,
            buffer: Vec::new(),
            capacity: MIN_BUFFER_ITEMS,
            mem: MemorySplit::new(minimum_in, minimum_out),
            total: 0,
        }
    }

    /// Sizes the buffer from the settled input budget.
    fn begin(&mut self) {
        let stream_usage = FileStream::<T>::memory_usage(self.options.factor());
        let spare = self
            .mem
            .input
            .memory()
            .saturating_sub(std::mem::size_of::<Self>() + stream_usage + 2 * SPACE_OVERHEAD);
        self.capacity = (spare / T::ENCODED_SIZE).max(MIN_BUFFER_ITEMS);
    }

    fn push(&mut self, item: &T) -> Result<()> {
        if self.buffer.len() >= self.capacity {
            self.flush()?;
        }
        self.buffer.push(item.clone());
        self.total += 1;
        Ok(())
    }

    fn buffer_bytes(&self) -> usize {
        self.buffer.len() * T::ENCODED_SIZE
    }

    fn sort_buffer(&mut self) {
        let comparator = &self.comparator;
        self.buffer.sort_unstable_by(|a, b| comparator.compare(a, b));
    }

    /// Sorts the buffer and writes it out as the next run.
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sort_buffer();
        let path = self.runs.push();
        let mut run: FileStream<T> =
            FileStream::open(&path, AccessType::ReadWrite, self.options.factor())?;
        for item in &self.buffer {
            run.write(item)?;
        }
        run.flush()?;
        debug!(run = %path.display(), items = self.buffer.len(), "flushed sorted run");
        self.buffer.clear();
        Ok(())
    }

    /// Fan-in affordable under the output budget.
    fn arity(&self) -> usize {
        let per_run = FileStream::<T>::memory_usage(self.options.factor()) + SPACE_OVERHEAD;
        let spare = self
            .mem
            .output
            .memory()
            .saturating_sub(std::mem::size_of::<Self>());
        (spare / per_run).clamp(2, MAX_OPEN_RUNS)
    }

    /// Merges oldest runs together until at most `arity` remain, so the
    /// final merge can open them all at once.
    fn base_merge(&mut self) -> Result<()> {
        let arity = self.arity() as u64;
        while self.runs.live() > arity {
            let take = (self.runs.live() - arity + 1).min(arity);
            let paths: Vec<_> = (0..take).map(|_| self.runs.pop_front()).collect();
            let out_path = self.runs.push();
            let mut merger =
                RunMerger::open(paths, self.comparator.clone(), self.options.factor())?;
            let mut out: FileStream<T> =
                FileStream::open(&out_path, AccessType::ReadWrite, self.options.factor())?;
            while merger.can_pull() {
                let item = merger.pull()?;
                out.write(item)?;
            }
            out.flush()?;
            debug!(merged = take, live = self.runs.live(), "intermediate merge");
        }
        Ok(())
    }

    /// Last flush decision at end of input: pending runs always get the
    /// tail; a run-free buffer goes to disk only if replaying it would not
    /// fit the output budget.
    fn final_flush(&mut self) -> Result<()> {
        if self.runs.live() > 0 || self.buffer_bytes() > self.mem.output.memory() {
            self.flush()?;
        }
        Ok(())
    }

    fn final_merger(&mut self) -> Result<RunMerger<T, C>> {
        self.base_merge()?;
        RunMerger::open(
            self.runs.drain(),
            self.comparator.clone(),
            self.options.factor(),
        )
    }
}

/// Push-through external sorter: push items in, and on `end` the fully
/// sorted sequence is pushed to the destination stage.
///
/// Inputs that fit the output budget never touch disk.
pub struct Sort<T: FixedRecord, D: PushStage<Item = T>, C: RecordCompare<T> + Clone> {
    core: SortCore<T, C>,
    dest: D,
    phase: Phase,
    begin_data: Option<D::BeginData>,
}

impl<T: FixedRecord, D: PushStage<Item = T>, C: RecordCompare<T> + Clone> Sort<T, D, C> {
    /// Creates a sorter pushing its output into `dest`.
    #[must_use]
    pub fn new(dest: D, comparator: C, options: SortOptions) -> Self {
        Self {
            core: SortCore::new(comparator, options),
            dest,
            phase: Phase::Idle,
            begin_data: None,
        }
    }

    /// Input-side hard floor.
    #[must_use]
    pub fn minimum_memory_in(&self) -> usize {
        self.core.mem.input.minimum_memory()
    }

    /// Output-side hard floor.
    #[must_use]
    pub fn minimum_memory_out(&self) -> usize {
        self.core.mem.output.minimum_memory()
    }

    /// Assigns the input-phase budget directly.
    ///
    /// # Panics
    ///
    /// Panics below [`minimum_memory_in`](Self::minimum_memory_in).
    pub fn set_memory_in(&mut self, bytes: usize) {
        self.core.mem.input.set_memory(bytes);
    }

    /// Assigns the output-phase budget directly.
    ///
    /// # Panics
    ///
    /// Panics below [`minimum_memory_out`](Self::minimum_memory_out).
    pub fn set_memory_out(&mut self, bytes: usize) {
        self.core.mem.output.set_memory(bytes);
    }

    /// Recovers the destination stage.
    #[must_use]
    pub fn into_inner(self) -> D {
        self.dest
    }
}

impl<T: FixedRecord, D: PushStage<Item = T>, C: RecordCompare<T> + Clone> PushStage
    for Sort<T, D, C>
{
    type Item = T;
    type BeginData = D::BeginData;
    type EndData = D::EndData;

    fn begin(&mut self, _items: Option<u64>, data: Option<D::BeginData>) -> Result<()> {
        self.phase.start("begin on a sorter");
        self.core.begin();
        self.begin_data = data;
        Ok(())
    }

    fn push(&mut self, item: &T) -> Result<()> {
        self.phase.active("push on a sorter");
        self.core.push(item)
    }

    fn end(&mut self, data: Option<D::EndData>) -> Result<()> {
        self.phase.finish("end on a sorter");
        let Self {
            core,
            dest,
            begin_data,
            ..
        } = self;
        core.final_flush()?;
        match core.runs.live() {
            0 => {
                core.sort_buffer();
                dest.begin(Some(core.total), begin_data.take())?;
                for item in &core.buffer {
                    dest.push(item)?;
                }
                core.buffer = Vec::new();
            }
            1 => {
                let path = core.runs.pop_front();
                let _guard = TempFile::from_path(path.clone());
                let mut run: FileStream<T> =
                    FileStream::open(&path, AccessType::Read, core.options.factor())?;
                dest.begin(Some(core.total), begin_data.take())?;
                while run.can_read() {
                    let item = run.read()?;
                    dest.push(&item)?;
                }
            }
            _ => {
                let mut merger = core.final_merger()?;
                dest.begin(Some(core.total), begin_data.take())?;
                while merger.can_pull() {
                    let item = merger.pull()?;
                    dest.push(item)?;
                }
            }
        }
        dest.end(data)
    }
}

impl<T, D, C> MemoryUser for Sort<T, D, C>
where
    T: FixedRecord,
    D: PushStage<Item = T> + MemoryUser,
    C: RecordCompare<T> + Clone,
{
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        self.core.mem.request(plan);
        self.dest.memory_requests(plan);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        self.core.mem.assign(grants);
        self.dest.assign_memory(grants);
    }
}

/// Where a [`PullSort`]'s sorted output comes from.
enum Output<T: FixedRecord, C: RecordCompare<T>> {
    Pending,
    Memory { next: usize },
    Run { stream: FileStream<T>, _guard: TempFile },
    Merge(RunMerger<T, C>),
}

/// External sorter drained by pulling.
///
/// Fill it as a [`PushStage`]; after `end`, drain the sorted sequence as a
/// [`PullStage`].
pub struct PullSort<T: FixedRecord, C: RecordCompare<T> + Clone> {
    core: SortCore<T, C>,
    output: Output<T, C>,
    current: Option<T>,
    phase_in: Phase,
    phase_out: Phase,
}

impl<T: FixedRecord, C: RecordCompare<T> + Clone> PullSort<T, C> {
    /// Creates an empty sorter.
    #[must_use]
    pub fn new(comparator: C, options: SortOptions) -> Self {
        Self {
            core: SortCore::new(comparator, options),
            output: Output::Pending,
            current: None,
            phase_in: Phase::Idle,
            phase_out: Phase::Idle,
        }
    }

    /// Input-side hard floor.
    #[must_use]
    pub fn minimum_memory_in(&self) -> usize {
        self.core.mem.input.minimum_memory()
    }

    /// Output-side hard floor.
    #[must_use]
    pub fn minimum_memory_out(&self) -> usize {
        self.core.mem.output.minimum_memory()
    }

    /// Assigns the input-phase budget directly.
    pub fn set_memory_in(&mut self, bytes: usize) {
        self.core.mem.input.set_memory(bytes);
    }

    /// Assigns the output-phase budget directly.
    pub fn set_memory_out(&mut self, bytes: usize) {
        self.core.mem.output.set_memory(bytes);
    }
}

impl<T: FixedRecord, C: RecordCompare<T> + Clone> PushStage for PullSort<T, C> {
    type Item = T;
    type BeginData = ();
    type EndData = ();

    fn begin(&mut self, _items: Option<u64>, _data: Option<()>) -> Result<()> {
        self.phase_in.start("begin on a pull sorter");
        self.core.begin();
        Ok(())
    }

    fn push(&mut self, item: &T) -> Result<()> {
        self.phase_in.active("push on a pull sorter");
        self.core.push(item)
    }

    fn end(&mut self, _data: Option<()>) -> Result<()> {
        self.phase_in.finish("end on a pull sorter");
        self.core.final_flush()?;
        self.output = match self.core.runs.live() {
            0 => {
                self.core.sort_buffer();
                Output::Memory { next: 0 }
            }
            1 => {
                let path = self.core.runs.pop_front();
                let _guard = TempFile::from_path(path.clone());
                let stream: FileStream<T> =
                    FileStream::open(&path, AccessType::Read, self.core.options.factor())?;
                Output::Run { stream, _guard }
            }
            _ => Output::Merge(self.core.final_merger()?),
        };
        Ok(())
    }
}

impl<T: FixedRecord, C: RecordCompare<T> + Clone> PullStage for PullSort<T, C> {
    type Item = T;
    type BeginData = ();
    type EndData = ();

    fn pull_begin(&mut self) -> Result<(Option<u64>, Option<()>)> {
        assert!(
            self.phase_in == Phase::Done,
            "pull_begin on a pull sorter that is still filling"
        );
        self.phase_out.start("pull_begin on a pull sorter");
        Ok((Some(self.core.total), None))
    }

    fn can_pull(&self) -> bool {
        self.phase_out == Phase::Active
            && match &self.output {
                Output::Pending => false,
                Output::Memory { next } => *next < self.core.buffer.len(),
                Output::Run { stream, .. } => stream.can_read(),
                Output::Merge(merger) => merger.can_pull(),
            }
    }

    fn pull(&mut self) -> Result<&T> {
        self.phase_out.active("pull on a pull sorter");
        let item = match &mut self.output {
            Output::Pending => return Err(exmem_common::Error::EndOfStream),
            Output::Memory { next } => {
                let item = match self.core.buffer.get(*next) {
                    Some(item) => item.clone(),
                    None => return Err(exmem_common::Error::EndOfStream),
                };
                *next += 1;
                item
            }
            Output::Run { stream, .. } => stream.read()?,
            Output::Merge(merger) => merger.pull()?.clone(),
        };
        Ok(self.current.insert(item))
    }

    fn pull_end(&mut self) -> Result<Option<()>> {
        self.phase_out.finish("pull_end on a pull sorter");
        // dropping the output stage deletes any remaining run files
        self.output = Output::Pending;
        self.core.buffer = Vec::new();
        self.current = None;
        Ok(None)
    }
}

impl<T: FixedRecord, C: RecordCompare<T> + Clone> MemoryUser for PullSort<T, C> {
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        self.core.mem.request(plan);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        self.core.mem.assign(grants);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::calculate_block_factor;
    use crate::sort::NaturalOrder;
    use tempfile::tempdir;

    fn options(dir: &std::path::Path) -> SortOptions {
        SortOptions::new()
            .with_block_factor(calculate_block_factor(128))
            .with_temp(exmem_common::TempPolicy::default().with_dir(dir))
    }

    #[derive(Default)]
    struct Collect {
        items: Vec<u32>,
        announced: Option<u64>,
        begin_tag: Option<&'static str>,
        end_tag: Option<&'static str>,
    }

    impl PushStage for Collect {
        type Item = u32;
        type BeginData = &'static str;
        type EndData = &'static str;

        fn begin(&mut self, items: Option<u64>, data: Option<&'static str>) -> Result<()> {
            self.announced = items;
            self.begin_tag = data;
            Ok(())
        }

        fn push(&mut self, item: &u32) -> Result<()> {
            self.items.push(*item);
            Ok(())
        }

        fn end(&mut self, data: Option<&'static str>) -> Result<()> {
            self.end_tag = data;
            Ok(())
        }
    }

    /// Pseudo-random walk covering 0..n exactly once.
    fn scrambled(n: u32) -> Vec<u32> {
        let step = 229; // coprime with any n < 229
        (0..n).map(|i| (i * step) % n).collect()
    }

    fn run_sort(input: &[u32], extra_in: usize, dir: &std::path::Path) -> Collect {
        let mut sorter = Sort::new(Collect::default(), NaturalOrder, options(dir));
        let min_in = sorter.minimum_memory_in();
        sorter.set_memory_in(min_in + extra_in);
        sorter.begin(None, None).unwrap();
        for item in input {
            sorter.push(item).unwrap();
        }
        sorter.end(None).unwrap();
        sorter.into_inner()
    }

    #[test]
    fn test_in_memory_path() {
        let dir = tempdir().unwrap();
        let out = run_sort(&scrambled(25), 1 << 20, dir.path());
        assert_eq!(out.announced, Some(25));
        assert_eq!(out.items, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_multi_run_path() {
        let dir = tempdir().unwrap();
        // room for 9 items per run: 25 items form 3 runs
        let out = run_sort(&scrambled(25), 7 * 4, dir.path());
        assert_eq!(out.items, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_run_path() {
        let dir = tempdir().unwrap();
        let mut sorter = Sort::new(Collect::default(), NaturalOrder, options(dir.path()));
        let min_in = sorter.minimum_memory_in();
        let min_out = sorter.minimum_memory_out();
        // big enough input buffer that everything fits one run, but a tight
        // output budget that forbids the in-memory replay
        sorter.set_memory_in(min_in + 2000 * 4);
        sorter.set_memory_out(min_out);
        sorter.begin(None, None).unwrap();
        for item in scrambled(2000) {
            sorter.push(&item).unwrap();
        }
        sorter.end(None).unwrap();
        assert_eq!(sorter.into_inner().items, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input() {
        let dir = tempdir().unwrap();
        let out = run_sort(&[], 0, dir.path());
        assert_eq!(out.announced, Some(0));
        assert!(out.items.is_empty());
    }

    #[test]
    fn test_duplicates_survive() {
        let dir = tempdir().unwrap();
        let input: Vec<u32> = scrambled(50).into_iter().map(|v| v / 5).collect();
        let mut expected = input.clone();
        expected.sort_unstable();
        let out = run_sort(&input, 3 * 4, dir.path());
        assert_eq!(out.items, expected);
    }

    #[test]
    fn test_no_run_files_left_behind() {
        let dir = tempdir().unwrap();
        let _ = run_sort(&scrambled(200), 5 * 4, dir.path());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "temp dir should be empty: {leftovers:?}");
    }

    #[test]
    fn test_pull_sort_multi_run() {
        let dir = tempdir().unwrap();
        let mut sorter = PullSort::new(NaturalOrder, options(dir.path()));
        let min_in = sorter.minimum_memory_in();
        sorter.set_memory_in(min_in + 7 * 4);
        sorter.begin(None, None).unwrap();
        for item in scrambled(60) {
            sorter.push(&item).unwrap();
        }
        sorter.end(None).unwrap();
        assert_eq!(sorter.pull_begin().unwrap(), (Some(60), None));
        let mut out = Vec::new();
        while sorter.can_pull() {
            out.push(*sorter.pull().unwrap());
        }
        sorter.pull_end().unwrap();
        assert_eq!(out, (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_metadata_forwarded_to_destination() {
        let dir = tempdir().unwrap();
        let mut sorter = Sort::new(Collect::default(), NaturalOrder, options(dir.path()));
        let min_in = sorter.minimum_memory_in();
        // multiple runs, so the metadata has to survive until replay
        sorter.set_memory_in(min_in + 7 * 4);
        sorter.begin(None, Some("batch-7")).unwrap();
        for item in scrambled(30) {
            sorter.push(&item).unwrap();
        }
        sorter.end(Some("complete")).unwrap();
        let out = sorter.into_inner();
        assert_eq!(out.begin_tag, Some("batch-7"));
        assert_eq!(out.end_tag, Some("complete"));
        assert_eq!(out.items, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_custom_comparator_descending() {
        let dir = tempdir().unwrap();
        let mut sorter = Sort::new(
            Collect::default(),
            |a: &u32, b: &u32| b.cmp(a),
            options(dir.path()),
        );
        let min_in = sorter.minimum_memory_in();
        sorter.set_memory_in(min_in + 5 * 4);
        sorter.begin(None, None).unwrap();
        for item in scrambled(40) {
            sorter.push(&item).unwrap();
        }
        sorter.end(None).unwrap();
        assert_eq!(
            sorter.into_inner().items,
            (0..40).rev().collect::<Vec<_>>()
        );
    }
}
