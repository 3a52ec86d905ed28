//! Intra-kernel synchronization primitives.

pub mod irq;
pub mod mutex;

pub use irq::{InterruptGuard, IrqCell, IrqLock};
pub use mutex::KMutex;
