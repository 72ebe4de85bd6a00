//! Global registry bookkeeping across a full sort cycle.
//!
//! This lives alone in its own test binary: the registry is process-wide,
//! and concurrent tests opening streams would shift the baseline under us.

use exmem_common::memory;
use exmem_common::TempPolicy;
use exmem_core::block::calculate_block_factor;
use exmem_core::sort::{NaturalOrder, PullSort, SortOptions};
use exmem_core::streaming::{PullStage, PushStage};
use tempfile::tempdir;

#[test]
fn test_registry_returns_to_baseline_after_sort_cycle() {
    let dir = tempdir().unwrap();
    let baseline = memory::with_global(|r| r.used());
    {
        let options = SortOptions::new()
            .with_block_factor(calculate_block_factor(128))
            .with_temp(TempPolicy::default().with_dir(dir.path()));
        let mut sorter = PullSort::new(NaturalOrder, options);
        let min_in = sorter.minimum_memory_in();
        // room for 6 items per run: 200 pushes spill into many runs
        sorter.set_memory_in(min_in + 4 * 4);
        sorter.begin(None, None).unwrap();
        for i in (0..200u32).rev() {
            sorter.push(&i).unwrap();
        }
        sorter.end(None).unwrap();
        let during = memory::with_global(|r| r.used());
        assert!(
            during > baseline,
            "open run streams must be registered: {during} vs {baseline}"
        );
        sorter.pull_begin().unwrap();
        let mut prev = 0;
        while sorter.can_pull() {
            let item = *sorter.pull().unwrap();
            assert!(item >= prev);
            prev = item;
        }
        sorter.pull_end().unwrap();
    }
    let after = memory::with_global(|r| r.used());
    assert_eq!(after, baseline, "every registered stream must be released");
}
