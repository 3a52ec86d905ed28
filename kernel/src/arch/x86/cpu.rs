//! CPU control: flags, control registers, TLB, and the CPUID probe.

use core::arch::asm;

/// EFLAGS interrupt-enable bit.
pub const EFLAGS_IF: u32 = 1 << 9;
/// EFLAGS CPUID-availability toggle bit.
const EFLAGS_ID: u32 = 1 << 21;

/// Save EFLAGS and clear IF. Pairs with [`restore_flags`].
///
/// # Safety
///
/// The caller must eventually restore the returned flags; leaving
/// interrupts disabled indefinitely stalls the whole system.
#[inline(always)]
pub unsafe fn disable_interrupts_saving_flags() -> u32 {
    let flags: u32;
    // SAFETY: pushfd/pop reads EFLAGS; cli only clears IF.
    unsafe {
        asm!("pushfd", "pop {}", "cli", out(reg) flags, options(nomem, preserves_flags));
    }
    flags
}

/// Restore EFLAGS saved by [`disable_interrupts_saving_flags`].
///
/// # Safety
///
/// `flags` must come from a previous save on this CPU.
#[inline(always)]
pub unsafe fn restore_flags(flags: u32) {
    // SAFETY: writes back a previously valid EFLAGS image.
    unsafe {
        asm!("push {}", "popfd", in(reg) flags, options(nomem));
    }
}

/// Whether IF is currently set.
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    let flags: u32;
    // SAFETY: reading EFLAGS has no side effects.
    unsafe {
        asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & EFLAGS_IF != 0
}

/// Enable interrupts.
///
/// # Safety
///
/// Only valid once the IDT and interrupt controller are programmed.
#[inline(always)]
pub unsafe fn enable_interrupts() {
    // SAFETY: sti only sets IF.
    unsafe { asm!("sti", options(nomem, nostack)) };
}

/// Halt until the next interrupt.
#[inline(always)]
pub fn halt() {
    // SAFETY: hlt resumes on the next interrupt; harmless.
    unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
}

/// Spin-loop hint.
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

/// Stop the CPU for good: interrupts off, halt loop.
pub fn halt_forever() -> ! {
    // SAFETY: terminal path; nothing runs after this.
    unsafe { asm!("cli", options(nomem, nostack)) };
    loop {
        halt();
    }
}

// ---------------------------------------------------------------------------
// Control registers and TLB
// ---------------------------------------------------------------------------

/// Load a page-directory physical address into CR3.
///
/// # Safety
///
/// The directory must describe a space that keeps the executing code and
/// stack mapped.
#[inline(always)]
pub unsafe fn load_cr3(phys: u32) {
    // SAFETY: per the function contract.
    unsafe { asm!("mov cr3, {}", in(reg) phys, options(nostack, preserves_flags)) };
}

/// Current CR3 value.
#[inline(always)]
pub fn read_cr3() -> u32 {
    let value: u32;
    // SAFETY: reading CR3 has no side effects.
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

/// Faulting address of the most recent page fault.
#[inline(always)]
pub fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: reading CR2 has no side effects.
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

/// Set CR0.PG and CR0.PE, turning paging on.
///
/// # Safety
///
/// CR3 must already point at a directory that identity-maps the
/// currently executing code.
#[inline(always)]
pub unsafe fn enable_paging() {
    // SAFETY: per the function contract.
    unsafe {
        asm!(
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000001",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// Set CR4.PSE so 4 MiB directory entries are honoured.
///
/// # Safety
///
/// Must run before any LARGE entry is installed.
#[inline(always)]
pub unsafe fn enable_pse() {
    // SAFETY: setting PSE has no effect on existing 4 KiB mappings.
    unsafe {
        asm!(
            "mov {tmp}, cr4",
            "or {tmp}, 0x10",
            "mov cr4, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// Drop the TLB entry for one page.
///
/// # Safety
///
/// Always safe on a valid address; grouped as unsafe because it executes
/// a privileged instruction.
#[inline(always)]
pub unsafe fn invlpg(virt: u32) {
    // SAFETY: invlpg only invalidates a TLB entry.
    unsafe { asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags)) };
}

// ---------------------------------------------------------------------------
// CPUID
// ---------------------------------------------------------------------------

/// Feature summary from the CPUID probe.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub vendor: [u8; 12],
    pub features_edx: u32,
    pub features_ecx: u32,
}

impl CpuInfo {
    /// Local APIC present (leaf 1, EDX bit 9).
    pub fn has_apic(&self) -> bool {
        self.features_edx & (1 << 9) != 0
    }

    /// 4 MiB pages supported (leaf 1, EDX bit 3).
    pub fn has_pse(&self) -> bool {
        self.features_edx & (1 << 3) != 0
    }

    /// Timestamp counter present (leaf 1, EDX bit 4).
    pub fn has_tsc(&self) -> bool {
        self.features_edx & (1 << 4) != 0
    }

    pub fn vendor_str(&self) -> &str {
        core::str::from_utf8(&self.vendor).unwrap_or("<non-utf8>")
    }
}

/// Whether the CPUID instruction exists (EFLAGS.ID toggles).
fn cpuid_supported() -> bool {
    let diff: u32;
    // SAFETY: toggling the ID bit in EFLAGS is side-effect free.
    unsafe {
        asm!(
            "pushfd",
            "pop {a}",
            "mov {b}, {a}",
            "xor {a}, {id}",
            "push {a}",
            "popfd",
            "pushfd",
            "pop {a}",
            "xor {a}, {b}",
            a = out(reg) diff,
            b = out(reg) _,
            id = const EFLAGS_ID,
            options(nomem)
        );
    }
    diff & EFLAGS_ID != 0
}

/// Execute CPUID. EBX is shuffled through another register because LLVM
/// reserves it on x86.
fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
    // SAFETY: cpuid is side-effect free.
    unsafe {
        asm!(
            "xchg {b}, ebx",
            "cpuid",
            "xchg {b}, ebx",
            inout("eax") leaf => eax,
            b = out(reg) ebx,
            inout("ecx") 0u32 => ecx,
            out("edx") edx,
            options(nomem, nostack, preserves_flags)
        );
    }
    (eax, ebx, ecx, edx)
}

/// Probe the processor. Falls back to an all-zero feature set on
/// antiques without CPUID.
pub fn probe() -> CpuInfo {
    if !cpuid_supported() {
        return CpuInfo {
            vendor: *b"unknown     ",
            features_edx: 0,
            features_ecx: 0,
        };
    }

    let (_, b, c, d) = cpuid(0);
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&b.to_le_bytes());
    vendor[4..8].copy_from_slice(&d.to_le_bytes());
    vendor[8..12].copy_from_slice(&c.to_le_bytes());

    let (_, _, ecx, edx) = cpuid(1);
    CpuInfo {
        vendor,
        features_edx: edx,
        features_ecx: ecx,
    }
}

/// Read a model-specific register.
///
/// # Safety
///
/// The MSR must exist on this processor.
#[inline(always)]
pub unsafe fn rdmsr(msr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: per the function contract.
    unsafe {
        asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nomem, nostack, preserves_flags));
    }
    ((hi as u64) << 32) | lo as u64
}

/// Write a model-specific register.
///
/// # Safety
///
/// The MSR must exist and the value must be valid for it.
#[inline(always)]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    // SAFETY: per the function contract.
    unsafe {
        asm!("wrmsr", in("ecx") msr, in("eax") value as u32, in("edx") (value >> 32) as u32, options(nomem, nostack, preserves_flags));
    }
}
