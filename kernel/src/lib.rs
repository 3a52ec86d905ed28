//! EmberOS kernel core.
//!
//! A 32-bit x86 monolithic kernel booted by a Multiboot2 loader:
//! two-level paging with a shared kernel half, a free-list heap with a
//! background defragmenter, an IDT dispatcher whose fault policy kills
//! user tasks instead of panicking, a priority round-robin scheduler
//! with an IRET-based context switch, reentrant mutexes, and per-task
//! message queues with wake-on-send.
//!
//! The crate builds two ways: for the bare-metal target (everything),
//! and for the host, where the hardware layers drop out and the policy
//! and data-structure layers run under the standard test harness.

#![no_std]

extern crate alloc;

// Host builds (unit tests, tooling) link std and use its allocator so
// test code can allocate freely.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::GlobalHeap = mm::heap::GlobalHeap;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod config;
pub mod error;
pub mod framebuffer;
pub mod interrupt;
pub mod ipc;
pub mod kernel;
pub mod klog;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod time;

pub use error::{KernelError, KernelResult};
pub use kernel::{kernel, try_kernel};
