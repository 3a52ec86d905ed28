//! Central table of kernel tunables.
//!
//! Every constant that governs sizing, timing, or policy lives here so the
//! subsystems never carry magic numbers at their use sites.

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Size covered by one page-directory entry (a full page table or a 4 MiB
/// large page).
pub const LARGE_PAGE_SIZE: usize = 4 * 1024 * 1024;

/// Number of page-directory entries forming the shared kernel half
/// (virtual 0 .. 3 GiB). Entries at and above this index are per-address-
/// space user territory.
pub const KERNEL_DIR_ENTRIES: usize = 768;

/// Base of the direct-map window: physical address `p` is visible at
/// `KERNEL_VIRTUAL_BASE + p` (wrapping modulo 4 GiB).
pub const KERNEL_VIRTUAL_BASE: u32 = 0x4000_0000;

/// Alternate direct-map window used when the primary window is occupied
/// by a conflicting mapping.
pub const ALT_WINDOW_BASE: u32 = 0x8000_0000;

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// Size of the statically reserved kernel heap.
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Alignment of every heap allocation.
pub const HEAP_ALIGN: usize = 16;

/// Smallest payload a block is allowed to carry; split remainders below
/// this are left attached to the allocation.
pub const HEAP_MIN_BLOCK: usize = 16;

/// Allocations of this size or larger have their payload zeroed.
pub const HEAP_ZERO_THRESHOLD: usize = 1024;

/// Requests above this size use best-fit instead of first-fit.
pub const HEAP_BEST_FIT_THRESHOLD: usize = 4096;

// ---------------------------------------------------------------------------
// Defragmenter
// ---------------------------------------------------------------------------

/// How often the defragmenter task wakes up.
pub const DEFRAG_INTERVAL_MS: u64 = 5_000;

/// Fragmentation percentage above which a coalesce run is triggered.
pub const DEFRAG_FRAGMENTATION_PCT: u32 = 25;

/// Free-block count above which a coalesce run is triggered.
pub const DEFRAG_FREE_BLOCKS_LIMIT: usize = 20;

/// A run is forced when this much time has passed since the previous one.
pub const DEFRAG_FORCE_INTERVAL_MS: u64 = 60_000;

/// Maximum coalesce passes per activation.
pub const DEFRAG_MAX_PASSES: u32 = 10;

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Scheduler tick rate.
pub const TIMER_HZ: u32 = 100;

/// PIT reload value producing [`TIMER_HZ`] (1193182 Hz / 11931 ≈ 100 Hz).
pub const PIT_DIVISOR: u16 = 11931;

/// Milliseconds per tick.
pub const TICK_MS: u64 = 1000 / TIMER_HZ as u64;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Kernel stack size handed to every task.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Fixed-size task name buffer in the TCB.
pub const TASK_NAME_LEN: usize = 32;

/// Time slices, in ticks, per priority. Priority buys a longer quantum,
/// never selection preference.
pub const QUANTUM_LOW: u32 = 2;
pub const QUANTUM_NORMAL: u32 = 4;
pub const QUANTUM_HIGH: u32 = 8;

/// Lowest stack pointer a restored context may carry (below lies real-mode
/// and BIOS territory).
pub const CONTEXT_MIN_ESP: u32 = 0x0010_0000;

/// Highest stack pointer a restored context may carry (4 GiB - 64 KiB).
pub const CONTEXT_MAX_ESP: u32 = 0xFFFF_0000;

/// EFLAGS bits a task context may keep across validation (CF, PF, AF, ZF,
/// SF, TF, DF, OF).
pub const EFLAGS_KEEP_MASK: u32 = 0x0000_0CD5;

/// EFLAGS bits forced on for every task (IF plus the always-one bit 1).
pub const EFLAGS_REQUIRED: u32 = 0x0000_0202;

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Exponential-backoff ceiling for a contended mutex, in pause cycles.
pub const MUTEX_BACKOFF_CAP: u32 = 1000;

/// A contended lock yields the CPU after this many spin iterations.
pub const MUTEX_YIELD_EVERY: u32 = 10;

/// Soft deadline after which a blocked lock gives up.
pub const MUTEX_TIMEOUT_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// Maximum payload carried by one message.
pub const MAX_MSG: usize = 256;

/// Bound on queued messages per task.
pub const MAX_MESSAGES_PER_QUEUE: usize = 64;

/// Sleep interval while polling in a blocking receive.
pub const RECEIVE_POLL_MS: u64 = 10;

/// Soft deadline after which a blocking receive gives up.
pub const RECEIVE_TIMEOUT_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

/// Magic value EAX must carry on entry from a Multiboot2 loader.
pub const MULTIBOOT2_BOOT_MAGIC: u32 = 0x36D7_6289;

/// How often the cleanup task scans for reapable tasks.
pub const CLEANUP_INTERVAL_MS: u64 = 500;
