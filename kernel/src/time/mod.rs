//! Timekeeping.
//!
//! One global tick counter driven by the timer interrupt (PIT at boot,
//! local APIC after the probe). Everything in the kernel that needs time
//! reads it from here; the only calibration loop in the tree is the PIT
//! channel-2 window inside the APIC bring-up.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TICK_MS;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Milliseconds since boot, at tick granularity.
#[inline]
pub fn now_ms() -> u64 {
    ticks() * TICK_MS
}

/// Convert a millisecond interval into ticks, rounding up so short
/// sleeps never round to zero.
#[inline]
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(TICK_MS).max(1)
}

/// Called by the timer ISR on every tick. Advances the clock, then hands
/// the scheduler its preemption point.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::AcqRel);

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::sched::scheduler::timer_tick();
}

/// Test hook: move the clock forward without a hardware tick.
#[cfg(not(target_os = "none"))]
pub fn advance_ticks(n: u64) {
    TICKS.fetch_add(n, Ordering::AcqRel);
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod pit {
    use crate::{
        arch::x86::port::port_out8,
        config::{PIT_DIVISOR, TIMER_HZ},
    };

    /// Program PIT channel 0: rate generator at [`TIMER_HZ`].
    pub fn init() {
        // SAFETY: standard channel-0 mode-2 programming sequence.
        unsafe {
            port_out8(0x43, 0x34); // channel 0, lobyte/hibyte, mode 2
            port_out8(0x40, (PIT_DIVISOR & 0xFF) as u8);
            port_out8(0x40, (PIT_DIVISOR >> 8) as u8);
        }
        crate::println!("[time] PIT at {} Hz (divisor {})", TIMER_HZ, PIT_DIVISOR);
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use pit::init as init_pit;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ms_conversion_rounds_up() {
        assert_eq!(ms_to_ticks(0), 1);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(15), 2);
        assert_eq!(ms_to_ticks(100), 10);
    }

    #[test]
    fn clock_advances_with_ticks() {
        // Other tests share the global clock, so only monotonicity and a
        // lower bound are stable here.
        let t0 = now_ms();
        advance_ticks(3);
        assert!(now_ms() - t0 >= 3 * TICK_MS);
    }
}
