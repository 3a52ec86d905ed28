//! Background heap defragmenter.
//!
//! A low-priority task wakes every few seconds, reads the heap
//! statistics, and re-runs forward coalescing over the free list when
//! the policy below says fragmentation is worth paying for. At most
//! [`DEFRAG_MAX_PASSES`] passes run per activation.

use crate::{
    config::{
        DEFRAG_FORCE_INTERVAL_MS, DEFRAG_FRAGMENTATION_PCT, DEFRAG_FREE_BLOCKS_LIMIT,
        DEFRAG_MAX_PASSES,
    },
    mm::heap::{HeapStats, LockedHeap},
    sync::IrqLock,
};

/// Defragmenter counters, exported next to the heap statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefragStats {
    pub total_runs: u64,
    pub total_merges: u64,
    pub last_run_ms: u64,
}

static STATS: IrqLock<DefragStats> = IrqLock::new(DefragStats {
    total_runs: 0,
    total_merges: 0,
    last_run_ms: 0,
});

pub fn stats() -> DefragStats {
    *STATS.lock()
}

/// The activation policy: coalesce when fragmentation is high, the free
/// list is long, the largest block has shrunk below half the free
/// space, or a minute has passed since the previous run.
pub fn should_run(heap: &HeapStats, now_ms: u64, last_run_ms: u64) -> bool {
    if heap.free_blocks_count <= 1 {
        return false;
    }
    heap.fragmentation_percent > DEFRAG_FRAGMENTATION_PCT
        || heap.free_blocks_count > DEFRAG_FREE_BLOCKS_LIMIT
        || heap.largest_free_block < heap.free / 2
        || now_ms.saturating_sub(last_run_ms) >= DEFRAG_FORCE_INTERVAL_MS
}

/// One activation: bounded multi-pass forward coalesce. Returns the
/// merges performed.
pub fn run(heap: &LockedHeap, now_ms: u64) -> usize {
    let mut merges = 0;
    for _ in 0..DEFRAG_MAX_PASSES {
        let pass = heap.coalesce_pass();
        merges += pass;
        if pass == 0 {
            break;
        }
    }

    let mut stats = STATS.lock();
    stats.total_runs += 1;
    stats.total_merges += merges as u64;
    stats.last_run_ms = now_ms;

    if merges > 0 {
        log::info!(target: "heap", "defrag merged {} blocks", merges);
    }
    merges
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod task {
    use super::*;
    use crate::{
        config::DEFRAG_INTERVAL_MS,
        mm::heap::KERNEL_HEAP,
        sched::scheduler::task_sleep,
        time,
    };

    /// Entry point of the defragmenter task.
    pub extern "C" fn defrag_main(_arg: *mut ()) {
        loop {
            task_sleep(DEFRAG_INTERVAL_MS);
            let heap_stats = KERNEL_HEAP.stats();
            let now = time::now_ms();
            let last = stats().last_run_ms;
            if should_run(&heap_stats, now, last) {
                run(&KERNEL_HEAP, now);
            }
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use task::defrag_main;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn stats_with(frag: u32, blocks: usize, largest: usize, free: usize) -> HeapStats {
        HeapStats {
            used: 0,
            free,
            free_blocks_count: blocks,
            largest_free_block: largest,
            fragmentation_percent: frag,
        }
    }

    #[test]
    fn single_block_never_triggers() {
        let s = stats_with(0, 1, 4096, 4096);
        assert!(!should_run(&s, 1_000_000, 0));
    }

    #[test]
    fn high_fragmentation_triggers() {
        let s = stats_with(DEFRAG_FRAGMENTATION_PCT + 1, 5, 1000, 4000);
        assert!(should_run(&s, 1000, 1000));
    }

    #[test]
    fn long_free_list_triggers() {
        let s = stats_with(0, DEFRAG_FREE_BLOCKS_LIMIT + 1, 4000, 4000);
        assert!(should_run(&s, 1000, 1000));
    }

    #[test]
    fn shrunken_largest_block_triggers() {
        let s = stats_with(10, 3, 1999, 4000);
        assert!(should_run(&s, 1000, 1000));
    }

    #[test]
    fn elapsed_minute_forces_a_run() {
        let s = stats_with(0, 2, 4000, 4100);
        assert!(!should_run(&s, 59_000, 0));
        assert!(should_run(&s, 60_000, 0));
    }
}
