//! Reorder barriers: accumulate everything, then replay in arrival order.
//!
//! A buffer absorbs an entire round before its destination sees the first
//! item. Items that fit the negotiated budget stay in memory; the rest
//! spill to a temporary [`FileStream`] that is removed when the round ends.

use exmem_common::memory::SPACE_OVERHEAD;
use exmem_common::temp::{TempFile, TempPolicy};
use exmem_common::Result;
use tracing::debug;

use super::memory::{Grants, MemoryPlan, MemorySingle, MemoryUser};
use super::{Phase, PullStage, PushStage};
use crate::block::{AccessType, FileStream, FixedRecord, Whence};

struct Spill<T: FixedRecord> {
    stream: FileStream<T>,
    _guard: TempFile,
}

/// In-memory item store with disk overflow, shared by both buffer shapes.
struct Store<T: FixedRecord> {
    buf: Vec<T>,
    capacity: usize,
    spill: Option<Spill<T>>,
    temp: TempPolicy,
    block_factor: f64,
    total: u64,
}

impl<T: FixedRecord> Store<T> {
    fn new(temp: TempPolicy, block_factor: f64) -> Self {
        Self {
            buf: Vec::new(),
            capacity: 0,
            spill: None,
            temp,
            block_factor,
            total: 0,
        }
    }

    /// Bytes needed before a single item can be buffered: the spill stream
    /// must always be affordable.
    fn base_memory(block_factor: f64) -> usize {
        std::mem::size_of::<Self>()
            + FileStream::<T>::memory_usage(block_factor)
            + SPACE_OVERHEAD
    }

    fn size_for(&mut self, memory: usize) {
        let base = Self::base_memory(self.block_factor);
        self.capacity = memory.saturating_sub(base) / T::ENCODED_SIZE.max(1);
        self.capacity = self.capacity.max(1);
    }

    fn push(&mut self, item: &T) -> Result<()> {
        if self.buf.len() < self.capacity {
            self.buf.push(item.clone());
        } else {
            if self.spill.is_none() {
                let path = self.temp.unique_path("buffer");
                debug!(path = %path.display(), "buffer overflow, spilling to disk");
                let stream = FileStream::open(&path, AccessType::ReadWrite, self.block_factor)?;
                self.spill = Some(Spill {
                    stream,
                    _guard: TempFile::from_path(path),
                });
            }
            if let Some(spill) = &mut self.spill {
                spill.stream.write(item)?;
            }
        }
        self.total += 1;
        Ok(())
    }

    fn rewind_spill(&mut self) -> Result<()> {
        if let Some(spill) = &mut self.spill {
            spill.stream.seek(0, Whence::Start)?;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.buf = Vec::new();
        self.spill = None;
        self.total = 0;
    }
}

/// Push stage that holds back every item until `end`, then replays the lot
/// into its destination in arrival order.
pub struct Buffer<T: FixedRecord, D: PushStage<Item = T>> {
    dest: D,
    store: Store<T>,
    mem: MemorySingle,
    phase: Phase,
    begin_data: Option<D::BeginData>,
}

impl<T: FixedRecord, D: PushStage<Item = T>> Buffer<T, D> {
    /// Creates a buffer in front of `dest`, spilling under `temp` when the
    /// assigned budget runs out.
    #[must_use]
    pub fn new(dest: D, temp: TempPolicy, block_factor: f64) -> Self {
        let minimum = Store::<T>::base_memory(block_factor) + T::ENCODED_SIZE;
        Self {
            dest,
            store: Store::new(temp, block_factor),
            mem: MemorySingle::new(minimum),
            phase: Phase::Idle,
            begin_data: None,
        }
    }

    /// Recovers the destination stage.
    #[must_use]
    pub fn into_inner(self) -> D {
        self.dest
    }
}

impl<T: FixedRecord, D: PushStage<Item = T>> PushStage for Buffer<T, D> {
    type Item = T;
    type BeginData = D::BeginData;
    type EndData = D::EndData;

    fn begin(&mut self, _items: Option<u64>, data: Option<D::BeginData>) -> Result<()> {
        self.phase.start("begin on a buffer");
        self.store.size_for(self.mem.memory());
        self.begin_data = data;
        Ok(())
    }

    fn push(&mut self, item: &T) -> Result<()> {
        self.phase.active("push on a buffer");
        self.store.push(item)
    }

    fn end(&mut self, data: Option<D::EndData>) -> Result<()> {
        self.phase.finish("end on a buffer");
        self.dest.begin(Some(self.store.total), self.begin_data.take())?;
        for item in &self.store.buf {
            self.dest.push(item)?;
        }
        self.store.rewind_spill()?;
        if let Some(spill) = &mut self.store.spill {
            while spill.stream.can_read() {
                let item = spill.stream.read()?;
                self.dest.push(&item)?;
            }
        }
        self.dest.end(data)?;
        self.store.clear();
        Ok(())
    }
}

impl<T: FixedRecord, D: PushStage<Item = T> + MemoryUser> MemoryUser for Buffer<T, D> {
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        self.mem.request(plan);
        self.dest.memory_requests(plan);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        self.mem.assign(grants);
        self.dest.assign_memory(grants);
    }
}

/// Buffer drained by pulling instead of pushed onward.
///
/// Fill it as a [`PushStage`]; once `end` has run, drain it as a
/// [`PullStage`]. Items come out in arrival order.
pub struct PullBuffer<T: FixedRecord> {
    store: Store<T>,
    mem: MemorySingle,
    next: u64,
    current: Option<T>,
    phase_in: Phase,
    phase_out: Phase,
}

impl<T: FixedRecord> PullBuffer<T> {
    /// Creates an empty buffer spilling under `temp`.
    #[must_use]
    pub fn new(temp: TempPolicy, block_factor: f64) -> Self {
        let minimum = Store::<T>::base_memory(block_factor) + T::ENCODED_SIZE;
        Self {
            store: Store::new(temp, block_factor),
            mem: MemorySingle::new(minimum),
            next: 0,
            current: None,
            phase_in: Phase::Idle,
            phase_out: Phase::Idle,
        }
    }

    /// Items accumulated so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.store.total
    }

    /// Whether nothing has been buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.total == 0
    }
}

impl<T: FixedRecord> PushStage for PullBuffer<T> {
    type Item = T;
    type BeginData = ();
    type EndData = ();

    fn begin(&mut self, _items: Option<u64>, _data: Option<()>) -> Result<()> {
        self.phase_in.start("begin on a pull buffer");
        self.store.size_for(self.mem.memory());
        Ok(())
    }

    fn push(&mut self, item: &T) -> Result<()> {
        self.phase_in.active("push on a pull buffer");
        self.store.push(item)
    }

    fn end(&mut self, _data: Option<()>) -> Result<()> {
        self.phase_in.finish("end on a pull buffer");
        Ok(())
    }
}

impl<T: FixedRecord> PullStage for PullBuffer<T> {
    type Item = T;
    type BeginData = ();
    type EndData = ();

    fn pull_begin(&mut self) -> Result<(Option<u64>, Option<()>)> {
        assert!(
            self.phase_in == Phase::Done,
            "pull_begin on a pull buffer that is still filling"
        );
        self.phase_out.start("pull_begin on a pull buffer");
        self.next = 0;
        self.store.rewind_spill()?;
        Ok((Some(self.store.total), None))
    }

    fn can_pull(&self) -> bool {
        self.phase_out == Phase::Active && self.next < self.store.total
    }

    fn pull(&mut self) -> Result<&T> {
        self.phase_out.active("pull on a pull buffer");
        let item = if (self.next as usize) < self.store.buf.len() {
            self.store.buf[self.next as usize].clone()
        } else {
            let spill = self
                .store
                .spill
                .as_mut()
                .ok_or(exmem_common::Error::EndOfStream)?;
            spill.stream.read()?
        };
        self.next += 1;
        Ok(self.current.insert(item))
    }

    fn pull_end(&mut self) -> Result<Option<()>> {
        self.phase_out.finish("pull_end on a pull buffer");
        self.current = None;
        self.store.clear();
        Ok(None)
    }
}

impl<T: FixedRecord> MemoryUser for PullBuffer<T> {
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        self.mem.request(plan);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        self.mem.assign(grants);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::calculate_block_factor;
    use crate::streaming::divide_memory;
    use tempfile::tempdir;

    fn tiny_factor() -> f64 {
        calculate_block_factor(128)
    }

    fn policy(dir: &std::path::Path) -> TempPolicy {
        TempPolicy::default().with_dir(dir)
    }

    /// Push stage recording everything it sees.
    #[derive(Default)]
    struct Recorder {
        items: Vec<u32>,
        begun: Option<Option<u64>>,
        begin_tag: Option<&'static str>,
        end_tag: Option<&'static str>,
        ended: bool,
    }

    impl PushStage for Recorder {
        type Item = u32;
        type BeginData = &'static str;
        type EndData = &'static str;

        fn begin(&mut self, items: Option<u64>, data: Option<&'static str>) -> Result<()> {
            self.begun = Some(items);
            self.begin_tag = data;
            Ok(())
        }

        fn push(&mut self, item: &u32) -> Result<()> {
            self.items.push(*item);
            Ok(())
        }

        fn end(&mut self, data: Option<&'static str>) -> Result<()> {
            self.end_tag = data;
            self.ended = true;
            Ok(())
        }
    }

    impl MemoryUser for Recorder {
        fn memory_requests(&self, plan: &mut MemoryPlan) {
            plan.request(0, 0.0);
        }

        fn assign_memory(&mut self, grants: &mut Grants) {
            let _ = grants.take();
        }
    }

    #[test]
    fn test_buffer_replays_in_arrival_order_with_spill() {
        let dir = tempdir().unwrap();
        let mut buffer = Buffer::new(Recorder::default(), policy(dir.path()), tiny_factor());
        // minimum only: room for a single in-memory item, everything else spills
        let minimum = buffer.mem.minimum_memory();
        divide_memory(&mut buffer, minimum);
        buffer.begin(None, None).unwrap();
        for i in 0..500u32 {
            buffer.push(&i).unwrap();
        }
        buffer.end(None).unwrap();
        let recorder = buffer.into_inner();
        assert_eq!(recorder.begun, Some(Some(500)));
        assert!(recorder.ended);
        assert_eq!(recorder.items, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_metadata_survives_the_reorder_barrier() {
        let dir = tempdir().unwrap();
        let mut buffer = Buffer::new(Recorder::default(), policy(dir.path()), tiny_factor());
        buffer.begin(None, Some("round-1")).unwrap();
        for i in 0..20u32 {
            buffer.push(&i).unwrap();
        }
        buffer.end(Some("drained")).unwrap();
        let recorder = buffer.into_inner();
        assert_eq!(recorder.begin_tag, Some("round-1"));
        assert_eq!(recorder.end_tag, Some("drained"));
        assert_eq!(recorder.items, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_buffer_stays_in_memory_when_budget_allows() {
        let dir = tempdir().unwrap();
        let mut buffer = Buffer::new(Recorder::default(), policy(dir.path()), tiny_factor());
        let minimum = buffer.mem.minimum_memory();
        divide_memory(&mut buffer, minimum + 100 * 4);
        buffer.begin(None, None).unwrap();
        for i in 0..100u32 {
            buffer.push(&i).unwrap();
        }
        assert!(buffer.store.spill.is_none());
        buffer.end(None).unwrap();
        assert_eq!(buffer.into_inner().items, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_pull_buffer_roundtrip() {
        let dir = tempdir().unwrap();
        let mut buffer: PullBuffer<u32> = PullBuffer::new(policy(dir.path()), tiny_factor());
        let minimum = buffer.mem.minimum_memory();
        divide_memory(&mut buffer, minimum);
        buffer.begin(None, None).unwrap();
        for i in 0..300u32 {
            buffer.push(&i).unwrap();
        }
        buffer.end(None).unwrap();
        assert_eq!(buffer.pull_begin().unwrap(), (Some(300), None));
        let mut seen = Vec::new();
        while buffer.can_pull() {
            seen.push(*buffer.pull().unwrap());
        }
        buffer.pull_end().unwrap();
        assert_eq!(seen, (0..300).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "still filling")]
    fn test_pull_before_fill_finished_panics() {
        let dir = tempdir().unwrap();
        let mut buffer: PullBuffer<u32> = PullBuffer::new(policy(dir.path()), tiny_factor());
        buffer.begin(None, None).unwrap();
        let _ = buffer.pull_begin();
    }
}
