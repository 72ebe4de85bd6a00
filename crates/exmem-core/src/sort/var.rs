//! Sorters for variable-length records.
//!
//! The input buffer is a packed byte arena plus a parallel offset index;
//! sorting permutes the index and never moves record bytes. Runs are
//! variable-record files merged with the buffer-swapping merger.

use exmem_common::memory::SPACE_OVERHEAD;
use exmem_common::temp::TempFile;
use exmem_common::Result;
use tracing::debug;

use super::merge::VarRunMerger;
use super::run::RunSet;
use super::{RecordCompare, SortOptions, MAX_OPEN_RUNS, MIN_BUFFER_ITEMS};
use crate::block::{AccessType, FixedRecord};
use crate::streaming::{Grants, MemoryPlan, MemorySplit, MemoryUser, Phase, PullStage, PushStage};
use crate::varfile::{SizeExtractor, VarFileStream};

/// The `[header][payload]` record starting at `offset` in the arena.
fn record_slice<'a, E: SizeExtractor>(extractor: &E, bytes: &'a [u8], offset: usize) -> &'a [u8] {
    let header_len = E::Header::ENCODED_SIZE;
    let header = E::Header::decode(&bytes[offset..offset + header_len]);
    &bytes[offset..offset + header_len + extractor.payload_len(&header)]
}

/// Run formation shared by the push and pull variable-record sorters.
struct VarSortCore<E: SizeExtractor, C: RecordCompare<[u8]> + Clone> {
    extractor: E,
    comparator: C,
    options: SortOptions,
    runs: RunSet,
    bytes: Vec<u8>,
    offsets: Vec<usize>,
    limit: usize,
    max_record: usize,
    mem: MemorySplit,
    total: u64,
}

impl<E: SizeExtractor, C: RecordCompare<[u8]> + Clone> VarSortCore<E, C> {
    fn new(extractor: E, comparator: C, options: SortOptions) -> Self {
        let stream_usage = VarFileStream::<E>::memory_usage(options.factor());
        let base = std::mem::size_of::<Self>();
        let index_entry = std::mem::size_of::<usize>();
        let minimum_in = base
            + stream_usage
            + 2 * SPACE_OVERHEAD
            + MIN_BUFFER_ITEMS * (index_entry + E::Header::ENCODED_SIZE);
        let minimum_out = base + 3 * (stream_usage + SPACE_OVERHEAD);
        Self {
            runs: RunSet::new(&options.temp),
            extractor,
            comparator,
            options,
            bytes: Vec::new(),
            offsets: Vec::new(),
            limit: 0,
            max_record: 0,
            mem: MemorySplit::new(minimum_in, minimum_out),
            total: 0,
        }
    }

    fn begin(&mut self) {
        let stream_usage = VarFileStream::<E>::memory_usage(self.options.factor());
        self.limit = self
            .mem
            .input
            .memory()
            .saturating_sub(std::mem::size_of::<Self>() + stream_usage + 2 * SPACE_OVERHEAD);
    }

    fn buffer_bytes(&self) -> usize {
        self.bytes.len() + self.offsets.len() * std::mem::size_of::<usize>()
    }

    /// Buffers one record, flushing a run first when it would not fit.
    ///
    /// # Panics
    ///
    /// Panics when a single record exceeds the whole input budget: no
    /// amount of flushing can make it fit.
    fn push(&mut self, record: &[u8]) -> Result<()> {
        let cost = record.len() + std::mem::size_of::<usize>();
        assert!(
            cost <= self.limit,
            "record of {} bytes exceeds the {}-byte sort buffer",
            record.len(),
            self.limit
        );
        if !self.offsets.is_empty() && self.buffer_bytes() + cost > self.limit {
            self.flush()?;
        }
        self.offsets.push(self.bytes.len());
        self.bytes.extend_from_slice(record);
        self.max_record = self.max_record.max(record.len());
        self.total += 1;
        Ok(())
    }

    /// Orders the offset index; record bytes stay put.
    fn sort_buffer(&mut self) {
        let Self {
            extractor,
            comparator,
            bytes,
            offsets,
            ..
        } = self;
        offsets.sort_unstable_by(|&a, &b| {
            comparator.compare(
                record_slice(extractor, bytes, a),
                record_slice(extractor, bytes, b),
            )
        });
    }

    fn flush(&mut self) -> Result<()> {
        if self.offsets.is_empty() {
            return Ok(());
        }
        self.sort_buffer();
        let path = self.runs.push();
        let mut run = VarFileStream::open(
            &path,
            AccessType::ReadWrite,
            self.extractor.clone(),
            self.options.factor(),
        )?;
        for &offset in &self.offsets {
            run.write(record_slice(&self.extractor, &self.bytes, offset))?;
        }
        run.flush()?;
        debug!(run = %path.display(), items = self.offsets.len(), "flushed sorted run");
        self.bytes.clear();
        self.offsets.clear();
        Ok(())
    }

    /// Fan-in affordable under the output budget; each open run also pays
    /// for a scratch sized to the largest record seen.
    fn arity(&self) -> usize {
        let stream_usage = VarFileStream::<E>::memory_usage(self.options.factor());
        let per_run = stream_usage + self.max_record + SPACE_OVERHEAD;
        let spare = self
            .mem
            .output
            .memory()
            .saturating_sub(std::mem::size_of::<Self>() + self.max_record);
        (spare / per_run.max(1)).clamp(2, MAX_OPEN_RUNS)
    }

    fn base_merge(&mut self) -> Result<()> {
        let arity = self.arity() as u64;
        while self.runs.live() > arity {
            let take = (self.runs.live() - arity + 1).min(arity);
            let paths: Vec<_> = (0..take).map(|_| self.runs.pop_front()).collect();
            let out_path = self.runs.push();
            let mut merger = VarRunMerger::open(
                paths,
                self.extractor.clone(),
                self.comparator.clone(),
                self.options.factor(),
            )?;
            let mut out = VarFileStream::open(
                &out_path,
                AccessType::ReadWrite,
                self.extractor.clone(),
                self.options.factor(),
            )?;
            while merger.can_pull() {
                let record = merger.pull()?;
                out.write(record)?;
            }
            out.flush()?;
            debug!(merged = take, live = self.runs.live(), "intermediate merge");
        }
        Ok(())
    }

    fn final_flush(&mut self) -> Result<()> {
        if self.runs.live() > 0 || self.buffer_bytes() > self.mem.output.memory() {
            self.flush()?;
        }
        Ok(())
    }

    fn final_merger(&mut self) -> Result<VarRunMerger<E, C>> {
        self.base_merge()?;
        VarRunMerger::open(
            self.runs.drain(),
            self.extractor.clone(),
            self.comparator.clone(),
            self.options.factor(),
        )
    }
}

/// Push-through external sorter for variable-length records.
pub struct VarSort<D, E, C>
where
    D: PushStage<Item = [u8]>,
    E: SizeExtractor,
    C: RecordCompare<[u8]> + Clone,
{
    core: VarSortCore<E, C>,
    dest: D,
    begin_data: Option<D::BeginData>,
    phase: Phase,
}

impl<D, E, C> VarSort<D, E, C>
where
    D: PushStage<Item = [u8]>,
    E: SizeExtractor,
    C: RecordCompare<[u8]> + Clone,
{
    /// Creates a sorter pushing its output into `dest`.
    #[must_use]
    pub fn new(dest: D, extractor: E, comparator: C, options: SortOptions) -> Self {
        Self {
            core: VarSortCore::new(extractor, comparator, options),
            dest,
            begin_data: None,
            phase: Phase::Idle,
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

    /// Recovers the destination stage.
    #[must_use]
    pub fn into_inner(self) -> D {
        self.dest
    }
}

impl<D, E, C> PushStage for VarSort<D, E, C>
where
    D: PushStage<Item = [u8]>,
    E: SizeExtractor,
    C: RecordCompare<[u8]> + Clone,
{
    type Item = [u8];
    type BeginData = D::BeginData;
    type EndData = D::EndData;

    fn begin(&mut self, _items: Option<u64>, data: Option<Self::BeginData>) -> Result<()> {
        self.phase.start("begin on a var sorter");
        self.begin_data = data;
        self.core.begin();
        Ok(())
    }

    fn push(&mut self, record: &[u8]) -> Result<()> {
        self.phase.active("push on a var sorter");
        self.core.push(record)
    }

    fn end(&mut self, data: Option<Self::EndData>) -> Result<()> {
        self.phase.finish("end on a var sorter");
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
                for &offset in &core.offsets {
                    dest.push(record_slice(&core.extractor, &core.bytes, offset))?;
                }
                core.bytes = Vec::new();
                core.offsets = Vec::new();
            }
            1 => {
                let path = core.runs.pop_front();
                let _guard = TempFile::from_path(path.clone());
                let mut run = VarFileStream::open(
                    &path,
                    AccessType::Read,
                    core.extractor.clone(),
                    core.options.factor(),
                )?;
                dest.begin(Some(core.total), begin_data.take())?;
                while run.can_read() {
                    let record = run.read()?;
                    dest.push(record)?;
                }
            }
            _ => {
                let mut merger = core.final_merger()?;
                dest.begin(Some(core.total), begin_data.take())?;
                while merger.can_pull() {
                    let record = merger.pull()?;
                    dest.push(record)?;
                }
            }
        }
        dest.end(data)
    }
}

impl<D, E, C> MemoryUser for VarSort<D, E, C>
where
    D: PushStage<Item = [u8]> + MemoryUser,
    E: SizeExtractor,
    C: RecordCompare<[u8]> + Clone,
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

/// Where a [`PullVarSort`]'s sorted output comes from.
enum Output<E: SizeExtractor, C: RecordCompare<[u8]>> {
    Pending,
    Memory { next: usize },
    Run { stream: VarFileStream<E>, _guard: TempFile },
    Merge(VarRunMerger<E, C>),
}

/// Variable-record external sorter drained by pulling.
pub struct PullVarSort<E: SizeExtractor, C: RecordCompare<[u8]> + Clone> {
    core: VarSortCore<E, C>,
    output: Output<E, C>,
    phase_in: Phase,
    phase_out: Phase,
}

impl<E: SizeExtractor, C: RecordCompare<[u8]> + Clone> PullVarSort<E, C> {
    /// Creates an empty sorter.
    #[must_use]
    pub fn new(extractor: E, comparator: C, options: SortOptions) -> Self {
        Self {
            core: VarSortCore::new(extractor, comparator, options),
            output: Output::Pending,
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

impl<E: SizeExtractor, C: RecordCompare<[u8]> + Clone> PushStage for PullVarSort<E, C> {
    type Item = [u8];
    type BeginData = ();
    type EndData = ();

    fn begin(&mut self, _items: Option<u64>, _data: Option<()>) -> Result<()> {
        self.phase_in.start("begin on a pull var sorter");
        self.core.begin();
        Ok(())
    }

    fn push(&mut self, record: &[u8]) -> Result<()> {
        self.phase_in.active("push on a pull var sorter");
        self.core.push(record)
    }

    fn end(&mut self, _data: Option<()>) -> Result<()> {
        self.phase_in.finish("end on a pull var sorter");
        self.core.final_flush()?;
        self.output = match self.core.runs.live() {
            0 => {
                self.core.sort_buffer();
                Output::Memory { next: 0 }
            }
            1 => {
                let path = self.core.runs.pop_front();
                let _guard = TempFile::from_path(path.clone());
                let stream = VarFileStream::open(
                    &path,
                    AccessType::Read,
                    self.core.extractor.clone(),
                    self.core.options.factor(),
                )?;
                Output::Run { stream, _guard }
            }
            _ => Output::Merge(self.core.final_merger()?),
        };
        Ok(())
    }
}

impl<E: SizeExtractor, C: RecordCompare<[u8]> + Clone> PullStage for PullVarSort<E, C> {
    type Item = [u8];
    type BeginData = ();
    type EndData = ();

    fn pull_begin(&mut self) -> Result<(Option<u64>, Option<()>)> {
        assert!(
            self.phase_in == Phase::Done,
            "pull_begin on a pull var sorter that is still filling"
        );
        self.phase_out.start("pull_begin on a pull var sorter");
        Ok((Some(self.core.total), None))
    }

    fn can_pull(&self) -> bool {
        self.phase_out == Phase::Active
            && match &self.output {
                Output::Pending => false,
                Output::Memory { next } => *next < self.core.offsets.len(),
                Output::Run { stream, .. } => stream.can_read(),
                Output::Merge(merger) => merger.can_pull(),
            }
    }

    fn pull(&mut self) -> Result<&[u8]> {
        self.phase_out.active("pull on a pull var sorter");
        match &mut self.output {
            Output::Pending => Err(exmem_common::Error::EndOfStream),
            Output::Memory { next } => {
                let Some(&offset) = self.core.offsets.get(*next) else {
                    return Err(exmem_common::Error::EndOfStream);
                };
                *next += 1;
                Ok(record_slice(&self.core.extractor, &self.core.bytes, offset))
            }
            Output::Run { stream, .. } => stream.read(),
            Output::Merge(merger) => merger.pull(),
        }
    }

    fn pull_end(&mut self) -> Result<Option<()>> {
        self.phase_out.finish("pull_end on a pull var sorter");
        self.output = Output::Pending;
        self.core.bytes = Vec::new();
        self.core.offsets = Vec::new();
        Ok(None)
    }
}

impl<E: SizeExtractor, C: RecordCompare<[u8]> + Clone> MemoryUser for PullVarSort<E, C> {
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        self.core.mem.request(plan);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        self.core.mem.assign(grants);
    }
}
