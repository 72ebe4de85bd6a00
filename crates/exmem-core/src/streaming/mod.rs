//! Streaming component protocol.
//!
//! Pipelines are built from push stages (data driven top-down) and pull
//! stages (data drawn bottom-up). A stage declares how much memory it needs
//! before any item moves; [`divide_memory`] settles the budget for a whole
//! pipeline in one round. Lifecycle misuse (pushing before `begin`, pulling
//! after `pull_end`) is a caller bug and panics.
//!
//! [`StreamSink`], [`StreamSource`], and [`PullStreamSource`] adapt
//! pipelines to block files; [`Buffer`] and [`PullBuffer`] are reorder
//! barriers that spill to disk when their budget runs out.

mod buffer;
mod memory;
mod stream;

pub use buffer::{Buffer, PullBuffer};
pub use memory::{
    divide_memory, Grants, MemoryPlan, MemoryRequest, MemorySingle, MemorySplit, MemoryUser,
};
pub use stream::{Direction, PullStreamSource, StreamSink, StreamSource};

use exmem_common::Result;

/// A stage items are pushed through.
///
/// The lifecycle is `begin`, any number of `push`es, `end`, exactly once
/// per stage. `begin` and `end` carry optional out-of-band metadata with
/// the items; reordering stages such as sorters and buffers hold the begin
/// metadata back and deliver it to their destination when the replay
/// starts.
pub trait PushStage {
    /// Item type accepted; unsized for byte-slice records.
    type Item: ?Sized;

    /// Metadata accepted alongside `begin`.
    type BeginData;

    /// Metadata accepted alongside `end`.
    type EndData;

    /// Starts a round. `items` carries the total count when the upstream
    /// knows it, letting the stage size buffers exactly.
    fn begin(&mut self, items: Option<u64>, data: Option<Self::BeginData>) -> Result<()>;

    /// Hands one item to the stage.
    fn push(&mut self, item: &Self::Item) -> Result<()>;

    /// Finishes the round, flushing anything the stage held back.
    fn end(&mut self, data: Option<Self::EndData>) -> Result<()>;
}

/// A stage items are pulled out of.
pub trait PullStage {
    /// Item type produced; unsized for byte-slice records.
    type Item: ?Sized;

    /// Metadata produced alongside `pull_begin`.
    type BeginData;

    /// Metadata produced alongside `pull_end`.
    type EndData;

    /// Starts a round, reporting the item count when known plus any
    /// metadata the stage carries for its consumer.
    fn pull_begin(&mut self) -> Result<(Option<u64>, Option<Self::BeginData>)>;

    /// Whether another item is available.
    fn can_pull(&self) -> bool;

    /// Produces the next item. The borrow is valid until the next pull.
    fn pull(&mut self) -> Result<&Self::Item>;

    /// Finishes the round, releasing resources the round held.
    fn pull_end(&mut self) -> Result<Option<Self::EndData>>;
}

/// Where a stage is in its lifecycle; used by stages to panic on misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Active,
    Done,
}

impl Phase {
    pub(crate) fn start(&mut self, what: &str) {
        assert!(*self == Phase::Idle, "{what} while already begun or ended");
        *self = Phase::Active;
    }

    pub(crate) fn active(self, what: &str) {
        assert!(self == Phase::Active, "{what} outside begin/end");
    }

    pub(crate) fn finish(&mut self, what: &str) {
        assert!(*self == Phase::Active, "{what} without a matching begin");
        *self = Phase::Done;
    }
}
