//! In-process message passing: one bounded queue per task, wake-on-send.

pub mod queue;

pub use queue::{Message, MessageQueue};

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use queue::{receive, send};
