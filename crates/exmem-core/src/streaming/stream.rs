//! Adapters between pipelines and block files.

use exmem_common::Result;
use tracing::trace;

use super::memory::{Grants, MemoryPlan, MemorySingle, MemoryUser};
use super::{Phase, PullStage, PushStage};
use crate::block::{FileStream, FixedRecord, Whence};

/// Push stage that appends every item to a [`FileStream`].
///
/// The terminal stage of a pipeline that materializes its output. Requests
/// no surplus memory; the stream's own footprint is registered globally.
pub struct StreamSink<T: FixedRecord> {
    stream: FileStream<T>,
    mem: MemorySingle,
    phase: Phase,
}

impl<T: FixedRecord> StreamSink<T> {
    /// Wraps an open, writable stream.
    #[must_use]
    pub fn new(stream: FileStream<T>) -> Self {
        Self {
            stream,
            mem: MemorySingle::with_priority(std::mem::size_of::<Self>(), 0.0),
            phase: Phase::Idle,
        }
    }

    /// Recovers the stream, cursor left after the last written item.
    #[must_use]
    pub fn into_inner(self) -> FileStream<T> {
        self.stream
    }
}

impl<T: FixedRecord> PushStage for StreamSink<T> {
    type Item = T;
    type BeginData = ();
    type EndData = ();

    fn begin(&mut self, items: Option<u64>, _data: Option<()>) -> Result<()> {
        self.phase.start("begin on a stream sink");
        if let Some(items) = items {
            trace!(items, "stream sink expecting items");
        }
        Ok(())
    }

    fn push(&mut self, item: &T) -> Result<()> {
        self.phase.active("push on a stream sink");
        self.stream.write(item)
    }

    fn end(&mut self, _data: Option<()>) -> Result<()> {
        self.phase.finish("end on a stream sink");
        self.stream.flush()
    }
}

impl<T: FixedRecord> MemoryUser for StreamSink<T> {
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        self.mem.request(plan);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        self.mem.assign(grants);
    }
}

/// Drives a whole push pipeline from the contents of a stream.
pub struct StreamSource<T: FixedRecord, D: PushStage<Item = T>> {
    stream: FileStream<T>,
    dest: D,
}

impl<T: FixedRecord, D: PushStage<Item = T>> StreamSource<T, D> {
    /// Pairs a readable stream with the pipeline to feed.
    #[must_use]
    pub fn new(stream: FileStream<T>, dest: D) -> Self {
        Self { stream, dest }
    }

    /// Pushes every item in file order, running the destination's full
    /// lifecycle.
    pub fn process(&mut self) -> Result<()> {
        self.process_with(None, None)
    }

    /// Like [`process`](Self::process), handing out-of-band metadata to the
    /// destination's `begin` and `end`.
    pub fn process_with(
        &mut self,
        begin: Option<D::BeginData>,
        end: Option<D::EndData>,
    ) -> Result<()> {
        self.stream.seek(0, Whence::Start)?;
        self.dest.begin(Some(self.stream.len()), begin)?;
        while self.stream.can_read() {
            let item = self.stream.read()?;
            self.dest.push(&item)?;
        }
        self.dest.end(end)
    }

    /// Pushes every item in reverse file order.
    pub fn process_back(&mut self) -> Result<()> {
        self.stream.seek(0, Whence::End)?;
        self.dest.begin(Some(self.stream.len()), None)?;
        while self.stream.can_read_back() {
            let item = self.stream.read_back()?;
            self.dest.push(&item)?;
        }
        self.dest.end(None)
    }

    /// Recovers the stream and the pipeline.
    #[must_use]
    pub fn into_parts(self) -> (FileStream<T>, D) {
        (self.stream, self.dest)
    }
}

impl<T: FixedRecord, D: PushStage<Item = T> + MemoryUser> MemoryUser for StreamSource<T, D> {
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        plan.request(std::mem::size_of::<Self>(), 0.0);
        self.dest.memory_requests(plan);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        let _ = grants.take();
        self.dest.assign_memory(grants);
    }
}

/// Scan direction for [`PullStreamSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// First item to last.
    Forward,
    /// Last item to first.
    Backward,
}

/// Pull stage yielding the items of a stream one at a time.
pub struct PullStreamSource<T: FixedRecord> {
    stream: FileStream<T>,
    direction: Direction,
    current: Option<T>,
    phase: Phase,
}

impl<T: FixedRecord> PullStreamSource<T> {
    /// Wraps a readable stream; the cursor is positioned at `pull_begin`.
    #[must_use]
    pub fn new(stream: FileStream<T>, direction: Direction) -> Self {
        Self {
            stream,
            direction,
            current: None,
            phase: Phase::Idle,
        }
    }

    /// Recovers the stream.
    #[must_use]
    pub fn into_inner(self) -> FileStream<T> {
        self.stream
    }
}

impl<T: FixedRecord> PullStage for PullStreamSource<T> {
    type Item = T;
    type BeginData = ();
    type EndData = ();

    fn pull_begin(&mut self) -> Result<(Option<u64>, Option<()>)> {
        self.phase.start("pull_begin on a stream source");
        match self.direction {
            Direction::Forward => self.stream.seek(0, Whence::Start)?,
            Direction::Backward => self.stream.seek(0, Whence::End)?,
        }
        Ok((Some(self.stream.len()), None))
    }

    fn can_pull(&self) -> bool {
        self.phase == Phase::Active
            && match self.direction {
                Direction::Forward => self.stream.can_read(),
                Direction::Backward => self.stream.can_read_back(),
            }
    }

    fn pull(&mut self) -> Result<&T> {
        self.phase.active("pull on a stream source");
        let item = match self.direction {
            Direction::Forward => self.stream.read()?,
            Direction::Backward => self.stream.read_back()?,
        };
        Ok(self.current.insert(item))
    }

    fn pull_end(&mut self) -> Result<Option<()>> {
        self.phase.finish("pull_end on a stream source");
        self.current = None;
        Ok(None)
    }
}

impl<T: FixedRecord> MemoryUser for PullStreamSource<T> {
    fn memory_requests(&self, plan: &mut MemoryPlan) {
        plan.request(std::mem::size_of::<Self>(), 0.0);
    }

    fn assign_memory(&mut self, grants: &mut Grants) {
        let _ = grants.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{calculate_block_factor, AccessType};
    use tempfile::tempdir;

    fn tiny_factor() -> f64 {
        calculate_block_factor(128)
    }

    fn filled(dir: &std::path::Path, items: u32) -> FileStream<u32> {
        let mut fs =
            FileStream::open(dir.join("items"), AccessType::ReadWrite, tiny_factor()).unwrap();
        for i in 0..items {
            fs.write(&i).unwrap();
        }
        fs
    }

    #[test]
    fn test_source_to_sink_copies_in_order() {
        let dir = tempdir().unwrap();
        let input = filled(dir.path(), 75);
        let output =
            FileStream::open(dir.path().join("out"), AccessType::ReadWrite, tiny_factor()).unwrap();
        let mut source = StreamSource::new(input, StreamSink::new(output));
        source.process().unwrap();
        let (_, sink) = source.into_parts();
        let mut out = sink.into_inner();
        assert_eq!(out.len(), 75);
        out.seek(0, Whence::Start).unwrap();
        for i in 0..75u32 {
            assert_eq!(out.read().unwrap(), i);
        }
    }

    #[test]
    fn test_process_back_reverses() {
        let dir = tempdir().unwrap();
        let input = filled(dir.path(), 10);
        let output =
            FileStream::open(dir.path().join("out"), AccessType::ReadWrite, tiny_factor()).unwrap();
        let mut source = StreamSource::new(input, StreamSink::new(output));
        source.process_back().unwrap();
        let (_, sink) = source.into_parts();
        let mut out = sink.into_inner();
        out.seek(0, Whence::Start).unwrap();
        for i in (0..10u32).rev() {
            assert_eq!(out.read().unwrap(), i);
        }
    }

    #[test]
    fn test_pull_source_forward_and_backward() {
        let dir = tempdir().unwrap();
        let mut source = PullStreamSource::new(filled(dir.path(), 5), Direction::Forward);
        assert_eq!(source.pull_begin().unwrap(), (Some(5), None));
        let mut seen = Vec::new();
        while source.can_pull() {
            seen.push(*source.pull().unwrap());
        }
        source.pull_end().unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let mut source = PullStreamSource::new(source.into_inner(), Direction::Backward);
        source.pull_begin().unwrap();
        let mut seen = Vec::new();
        while source.can_pull() {
            seen.push(*source.pull().unwrap());
        }
        source.pull_end().unwrap();
        assert_eq!(seen, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    #[should_panic(expected = "outside begin/end")]
    fn test_push_before_begin_panics() {
        let dir = tempdir().unwrap();
        let output =
            FileStream::open(dir.path().join("out"), AccessType::ReadWrite, tiny_factor()).unwrap();
        let mut sink = StreamSink::new(output);
        let _ = sink.push(&1u32);
    }
}
