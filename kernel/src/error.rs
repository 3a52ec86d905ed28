//! Kernel error types.
//!
//! One top-level [`KernelError`] composed of per-subsystem sub-enums.
//! Expected failures (§7 of the design notes) travel through these values;
//! nothing in the core unwinds.

use core::fmt;

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Top-level kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-management failures.
    Mm(MmError),
    /// Heap-allocator failures.
    Heap(HeapError),
    /// Scheduler failures.
    Sched(SchedError),
    /// Messaging failures.
    Ipc(IpcError),
    /// Mutex failures.
    Sync(SyncError),
    /// Boot-sequencer failures.
    Boot(BootError),
    /// A subsystem was used before its `init` ran.
    NotInitialized { subsystem: &'static str },
    /// Catch-all for malformed arguments.
    InvalidArgument {
        name: &'static str,
        reason: &'static str,
    },
}

/// MMU and physical-memory errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// A virtual address is already mapped to a different frame.
    MappingConflict { virt: u32, existing: u32 },
    /// The queried or unmapped address has no mapping.
    NotMapped { virt: u32 },
    /// The operation would have to split a 4 MiB entry.
    LargePageSplit { virt: u32 },
    /// No physical frame available.
    OutOfFrames,
    /// Both direct-map windows are occupied by conflicting mappings.
    WindowBusy { phys: u32 },
}

/// Heap-allocator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free block satisfies the request.
    OutOfMemory { requested: usize },
    /// `alloc(0)` is declined.
    ZeroSize,
    /// The freed pointer lies outside the heap (including null).
    OutOfBounds { addr: usize },
    /// The freed pointer is not allocation-aligned.
    Misaligned { addr: usize },
    /// The block header carries neither sentinel; the heap is corrupt.
    BadMagic { addr: usize, found: u32 },
    /// The block header already carries the FREE sentinel.
    DoubleFree { addr: usize },
}

/// Scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No task with that id exists.
    TaskNotFound { id: u32 },
    /// `task_destroy` was asked to destroy the running task.
    DestroyCurrent { id: u32 },
    /// The task name exceeds the TCB name buffer.
    NameTooLong { len: usize },
    /// A context failed pre-switch validation.
    InvalidContext { reason: &'static str },
}

/// Messaging errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The target queue is at its depth bound.
    QueueFull { capacity: usize },
    /// The payload exceeds the per-message maximum.
    MessageTooLarge { size: usize, max: usize },
    /// Non-blocking receive found nothing.
    Empty,
    /// Blocking receive gave up after the soft timeout.
    Timeout,
    /// The target task does not exist.
    TaskNotFound { id: u32 },
}

/// Mutex errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// `lock` gave up after the soft timeout.
    Timeout { name: &'static str },
    /// `try_lock` found the mutex held.
    WouldBlock,
}

/// Boot-sequencer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// EAX did not carry the Multiboot2 magic.
    BadMagic { found: u32 },
    /// The tag list carries no memory map.
    MissingMemoryMap,
    /// The tag list could not be parsed.
    MalformedTags,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mm(e) => write!(f, "mm: {}", e),
            Self::Heap(e) => write!(f, "heap: {}", e),
            Self::Sched(e) => write!(f, "sched: {}", e),
            Self::Ipc(e) => write!(f, "ipc: {}", e),
            Self::Sync(e) => write!(f, "sync: {}", e),
            Self::Boot(e) => write!(f, "boot: {}", e),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{}': {}", name, reason)
            }
        }
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MappingConflict { virt, existing } => write!(
                f,
                "virtual {:#010x} already maps frame {:#010x}",
                virt, existing
            ),
            Self::NotMapped { virt } => write!(f, "virtual {:#010x} is not mapped", virt),
            Self::LargePageSplit { virt } => {
                write!(f, "refusing to split 4 MiB entry covering {:#010x}", virt)
            }
            Self::OutOfFrames => write!(f, "no free physical frames"),
            Self::WindowBusy { phys } => {
                write!(f, "no direct-map window free for physical {:#010x}", phys)
            }
        }
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "no block fits {} bytes", requested)
            }
            Self::ZeroSize => write!(f, "zero-size allocation"),
            Self::OutOfBounds { addr } => write!(f, "pointer {:#010x} outside heap", addr),
            Self::Misaligned { addr } => write!(f, "pointer {:#010x} misaligned", addr),
            Self::BadMagic { addr, found } => {
                write!(f, "corrupt header at {:#010x} (magic {:#010x})", addr, found)
            }
            Self::DoubleFree { addr } => write!(f, "double free at {:#010x}", addr),
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { id } => write!(f, "task {} not found", id),
            Self::DestroyCurrent { id } => {
                write!(f, "task {} cannot destroy itself", id)
            }
            Self::NameTooLong { len } => write!(f, "task name of {} bytes too long", len),
            Self::InvalidContext { reason } => write!(f, "invalid context: {}", reason),
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { capacity } => write!(f, "queue full ({} messages)", capacity),
            Self::MessageTooLarge { size, max } => {
                write!(f, "payload of {} bytes exceeds {}", size, max)
            }
            Self::Empty => write!(f, "queue empty"),
            Self::Timeout => write!(f, "receive timed out"),
            Self::TaskNotFound { id } => write!(f, "task {} not found", id),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { name } => write!(f, "lock '{}' timed out", name),
            Self::WouldBlock => write!(f, "lock held"),
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => {
                write!(f, "bad Multiboot2 magic {:#010x}", found)
            }
            Self::MissingMemoryMap => write!(f, "bootloader supplied no memory map"),
            Self::MalformedTags => write!(f, "malformed Multiboot2 tag list"),
        }
    }
}

impl From<MmError> for KernelError {
    fn from(err: MmError) -> Self {
        Self::Mm(err)
    }
}

impl From<HeapError> for KernelError {
    fn from(err: HeapError) -> Self {
        Self::Heap(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

impl From<SyncError> for KernelError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl From<BootError> for KernelError {
    fn from(err: BootError) -> Self {
        Self::Boot(err)
    }
}
