//! Local APIC bring-up (single hart).
//!
//! Preferred over the 8259 when the CPUID probe reports one. The MMIO
//! block is reached through the direct-map window the boot sequencer
//! installs; the timer is calibrated once against the PIT and then runs
//! in periodic mode on the same vector the PIT used.

use core::sync::atomic::{AtomicU32, Ordering};

use super::{cpu, port::port_in8, port::port_out8};
use crate::config::TIMER_HZ;

/// APIC base address MSR.
const IA32_APIC_BASE: u32 = 0x1B;
/// Physical base mask within the MSR.
const APIC_BASE_MASK: u64 = 0xFFFF_F000;

// Register offsets within the 4 KiB MMIO block.
const REG_EOI: u32 = 0xB0;
const REG_SPURIOUS: u32 = 0xF0;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INITIAL: u32 = 0x380;
const REG_TIMER_CURRENT: u32 = 0x390;
const REG_TIMER_DIVIDE: u32 = 0x3E0;

/// Spurious-vector register: enable bit plus vector 0xFF.
const SPURIOUS_ENABLE: u32 = 0x100 | 0xFF;
/// LVT timer: periodic mode.
const TIMER_PERIODIC: u32 = 1 << 17;
/// Divide-by-16 encoding.
const DIVIDE_BY_16: u32 = 0x3;

/// Virtual base of the mapped MMIO block; zero until [`init`].
static LAPIC_VIRT: AtomicU32 = AtomicU32::new(0);

/// Physical base of the local APIC from the MSR.
pub fn physical_base() -> u32 {
    // SAFETY: IA32_APIC_BASE exists whenever CPUID reported an APIC.
    (unsafe { cpu::rdmsr(IA32_APIC_BASE) } & APIC_BASE_MASK) as u32
}

fn reg_read(offset: u32) -> u32 {
    let base = LAPIC_VIRT.load(Ordering::Acquire);
    debug_assert_ne!(base, 0);
    // SAFETY: init stored a mapped MMIO base; registers are u32 aligned.
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

fn reg_write(offset: u32, value: u32) {
    let base = LAPIC_VIRT.load(Ordering::Acquire);
    debug_assert_ne!(base, 0);
    // SAFETY: as in `reg_read`.
    unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) }
}

/// Whether the APIC has been brought up.
pub fn is_active() -> bool {
    LAPIC_VIRT.load(Ordering::Acquire) != 0
}

/// Enable the local APIC through the already-mapped MMIO block and start
/// its timer at [`TIMER_HZ`] on `timer_vector`.
///
/// # Safety
///
/// `mmio_virt` must map the local APIC's 4 KiB register block; the PIT
/// must still be ticking (it is used for calibration); interrupts must be
/// disabled.
pub unsafe fn init(mmio_virt: u32, timer_vector: u8) {
    LAPIC_VIRT.store(mmio_virt, Ordering::Release);

    reg_write(REG_SPURIOUS, SPURIOUS_ENABLE);
    reg_write(REG_TIMER_DIVIDE, DIVIDE_BY_16);

    let ticks_per_period = calibrate_timer();
    reg_write(REG_LVT_TIMER, TIMER_PERIODIC | timer_vector as u32);
    reg_write(REG_TIMER_INITIAL, ticks_per_period);

    log::info!(
        target: "apic",
        "local APIC at {:#010x}, timer {} counts per {} Hz period",
        physical_base(),
        ticks_per_period,
        TIMER_HZ
    );
}

/// Count APIC timer ticks across one PIT-measured 10 ms window, using
/// PIT channel 2 under the port-0x61 gate (the speaker channel, which
/// does not disturb channel 0).
fn calibrate_timer() -> u32 {
    const PIT_FREQ: u32 = 1_193_182;
    let pit_count = PIT_FREQ / TIMER_HZ; // one timer period

    // SAFETY: channel-2 one-shot setup under the 0x61 gate; standard
    // calibration sequence with no persistent effect.
    unsafe {
        // Gate channel 2 off, speaker off.
        let gate = port_in8(0x61) & 0xFC;
        port_out8(0x61, gate);
        // Channel 2, lobyte/hibyte, mode 0.
        port_out8(0x43, 0xB0);
        port_out8(0x42, (pit_count & 0xFF) as u8);
        port_out8(0x42, (pit_count >> 8) as u8);

        reg_write(REG_TIMER_INITIAL, u32::MAX);
        // Gate on: the one-shot starts counting down.
        port_out8(0x61, gate | 0x01);
        // OUT2 (bit 5) rises when the count expires.
        while port_in8(0x61) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        let elapsed = u32::MAX - reg_read(REG_TIMER_CURRENT);
        reg_write(REG_TIMER_INITIAL, 0);
        port_out8(0x61, gate);

        elapsed.max(1)
    }
}

/// Signal end-of-interrupt.
pub fn end_of_interrupt() {
    reg_write(REG_EOI, 0);
}
