//! CPU context block and the context-switch entry points.
//!
//! The assembly reads [`CpuContext`] fields through `offset_of!` const
//! operands, so the struct layout and the selector table are the only
//! sources of truth; there are no duplicated numeric offsets.

use super::gdt::selectors;
use crate::{
    config::{CONTEXT_MAX_ESP, CONTEXT_MIN_ESP, EFLAGS_KEEP_MASK, EFLAGS_REQUIRED},
    error::{KernelResult, SchedError},
};

/// Saved processor state for one task.
///
/// Segment selectors are stored widened to `u32` so every field has the
/// same size and the assembly can use plain dword moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub ss: u32,
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
            eflags: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
        }
    }

    /// Initial context for a kernel task: flat ring-0 segments, IF set,
    /// EIP at the entry trampoline and ESP at the prepared synthetic
    /// frame.
    pub fn kernel_task(entry: u32, esp: u32) -> Self {
        Self {
            esp,
            eip: entry,
            eflags: EFLAGS_REQUIRED,
            cs: selectors::KERNEL_CODE as u32,
            ds: selectors::KERNEL_DATA as u32,
            es: selectors::KERNEL_DATA as u32,
            fs: selectors::KERNEL_DATA as u32,
            gs: selectors::KERNEL_DATA as u32,
            ss: selectors::KERNEL_DATA as u32,
            ..Self::zeroed()
        }
    }
}

/// Strip a task's EFLAGS down to the arithmetic/direction bits and force
/// IF plus the always-one bit.
pub fn sanitized_eflags(orig: u32) -> u32 {
    (orig & EFLAGS_KEEP_MASK) | EFLAGS_REQUIRED
}

/// The stack-pointer plausibility window enforced by the switch assembly.
pub fn esp_plausible(esp: u32) -> bool {
    (CONTEXT_MIN_ESP..CONTEXT_MAX_ESP).contains(&esp)
}

/// Pre-flight check for the very first context handed to
/// [`start_first_task`]: non-null EIP/ESP, ring-0 selectors, ESP fixed up
/// to 16-byte alignment, EFLAGS sanitised.
pub fn validate_initial(ctx: &mut CpuContext) -> KernelResult<()> {
    if ctx.eip == 0 {
        return Err(SchedError::InvalidContext { reason: "null EIP" }.into());
    }
    if ctx.esp == 0 {
        return Err(SchedError::InvalidContext { reason: "null ESP" }.into());
    }
    if !esp_plausible(ctx.esp) {
        return Err(SchedError::InvalidContext {
            reason: "ESP outside plausible range",
        }
        .into());
    }
    if ctx.cs != selectors::KERNEL_CODE as u32 {
        return Err(SchedError::InvalidContext { reason: "bad CS" }.into());
    }
    if ctx.ds != selectors::KERNEL_DATA as u32 || ctx.ss != selectors::KERNEL_DATA as u32 {
        return Err(SchedError::InvalidContext {
            reason: "bad DS/SS",
        }
        .into());
    }
    if ctx.esp % 16 != 0 {
        ctx.esp &= !0xF;
    }
    ctx.eflags = sanitized_eflags(ctx.eflags);
    Ok(())
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod switch_asm {
    use core::mem::offset_of;

    use super::CpuContext;
    use crate::config::{CONTEXT_MAX_ESP, CONTEXT_MIN_ESP};

    // Both entry points restore through an IRET frame so a task's EFLAGS
    // (and with them IF) come back in the same instruction that jumps to
    // its EIP. Loading SS inhibits interrupts for one instruction, which
    // makes the SS:ESP switch atomic.
    core::arch::global_asm!(
        ".global context_switch_save_and_restore",
        "context_switch_save_and_restore:",
        "    mov eax, [esp + 4]",
        "    test eax, eax",
        "    jz 2f",
        // Save into *old. EAX is recorded as 0 so the function appears
        // to return success when this context is eventually resumed.
        "    mov [eax + {o_ebx}], ebx",
        "    mov [eax + {o_ecx}], ecx",
        "    mov [eax + {o_edx}], edx",
        "    mov [eax + {o_esi}], esi",
        "    mov [eax + {o_edi}], edi",
        "    mov [eax + {o_ebp}], ebp",
        "    mov dword ptr [eax + {o_eax}], 0",
        "    mov ecx, [esp]",
        "    mov [eax + {o_eip}], ecx",
        "    lea ecx, [esp + 4]",
        "    mov [eax + {o_esp}], ecx",
        "    pushfd",
        "    pop ecx",
        "    mov [eax + {o_eflags}], ecx",
        "    mov ecx, cs",
        "    mov [eax + {o_cs}], ecx",
        "    mov ecx, ds",
        "    mov [eax + {o_ds}], ecx",
        "    mov ecx, es",
        "    mov [eax + {o_es}], ecx",
        "    mov ecx, fs",
        "    mov [eax + {o_fs}], ecx",
        "    mov ecx, gs",
        "    mov [eax + {o_gs}], ecx",
        "    mov ecx, ss",
        "    mov [eax + {o_ss}], ecx",
        "2:",
        "    mov edx, [esp + 8]",
        // Decline stacks outside the plausible window.
        "    mov ecx, [edx + {o_esp}]",
        "    cmp ecx, {min_esp}",
        "    jb 3f",
        "    cmp ecx, {max_esp}",
        "    jae 3f",
        "    mov eax, [edx + {o_ds}]",
        "    mov ds, ax",
        "    mov eax, [edx + {o_es}]",
        "    mov es, ax",
        "    mov eax, [edx + {o_fs}]",
        "    mov fs, ax",
        "    mov eax, [edx + {o_gs}]",
        "    mov gs, ax",
        "    mov eax, [edx + {o_ss}]",
        "    mov ss, ax",
        "    mov esp, [edx + {o_esp}]",
        "    push dword ptr [edx + {o_eflags}]",
        "    push dword ptr [edx + {o_cs}]",
        "    push dword ptr [edx + {o_eip}]",
        "    mov eax, [edx + {o_eax}]",
        "    mov ebx, [edx + {o_ebx}]",
        "    mov ecx, [edx + {o_ecx}]",
        "    mov esi, [edx + {o_esi}]",
        "    mov edi, [edx + {o_edi}]",
        "    mov ebp, [edx + {o_ebp}]",
        "    mov edx, [edx + {o_edx}]",
        "    iretd",
        "3:",
        "    mov eax, 1",
        "    ret",
        ".global start_first_task",
        "start_first_task:",
        "    mov edx, [esp + 4]",
        "    mov eax, [edx + {o_ds}]",
        "    mov ds, ax",
        "    mov eax, [edx + {o_es}]",
        "    mov es, ax",
        "    mov eax, [edx + {o_fs}]",
        "    mov fs, ax",
        "    mov eax, [edx + {o_gs}]",
        "    mov gs, ax",
        "    mov eax, [edx + {o_ss}]",
        "    mov ss, ax",
        "    mov esp, [edx + {o_esp}]",
        "    push dword ptr [edx + {o_eflags}]",
        "    or dword ptr [esp], {if_bit}",
        "    push dword ptr [edx + {o_cs}]",
        "    push dword ptr [edx + {o_eip}]",
        "    mov eax, [edx + {o_eax}]",
        "    mov ebx, [edx + {o_ebx}]",
        "    mov ecx, [edx + {o_ecx}]",
        "    mov esi, [edx + {o_esi}]",
        "    mov edi, [edx + {o_edi}]",
        "    mov ebp, [edx + {o_ebp}]",
        "    mov edx, [edx + {o_edx}]",
        "    iretd",
        o_eax = const offset_of!(CpuContext, eax),
        o_ebx = const offset_of!(CpuContext, ebx),
        o_ecx = const offset_of!(CpuContext, ecx),
        o_edx = const offset_of!(CpuContext, edx),
        o_esi = const offset_of!(CpuContext, esi),
        o_edi = const offset_of!(CpuContext, edi),
        o_ebp = const offset_of!(CpuContext, ebp),
        o_esp = const offset_of!(CpuContext, esp),
        o_eip = const offset_of!(CpuContext, eip),
        o_eflags = const offset_of!(CpuContext, eflags),
        o_cs = const offset_of!(CpuContext, cs),
        o_ds = const offset_of!(CpuContext, ds),
        o_es = const offset_of!(CpuContext, es),
        o_fs = const offset_of!(CpuContext, fs),
        o_gs = const offset_of!(CpuContext, gs),
        o_ss = const offset_of!(CpuContext, ss),
        min_esp = const CONTEXT_MIN_ESP,
        max_esp = const CONTEXT_MAX_ESP,
        if_bit = const 0x200u32,
    );

    extern "C" {
        pub fn context_switch_save_and_restore(
            old: *mut CpuContext,
            new: *const CpuContext,
        ) -> u32;
        pub fn start_first_task(ctx: *const CpuContext) -> !;
    }
}

/// Switch from the context in `old` (saved in place; null skips the
/// save) to the context in `new`. On success this "returns" only when
/// the old context is scheduled again; an implausible new stack pointer
/// returns an error immediately without switching.
///
/// # Safety
///
/// Both pointers must reference valid contexts; `new` must describe a
/// runnable ring-0 task whose stack is mapped. Interrupts must be
/// disabled by the caller.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn switch(old: *mut CpuContext, new: *const CpuContext) -> KernelResult<()> {
    // SAFETY: forwarded to the assembly per the function contract.
    let rc = unsafe { switch_asm::context_switch_save_and_restore(old, new) };
    if rc == 0 {
        Ok(())
    } else {
        Err(SchedError::InvalidContext {
            reason: "stack pointer outside plausible range",
        }
        .into())
    }
}

/// Jump into the very first task. Never returns; IF is forced on in the
/// restored EFLAGS.
///
/// # Safety
///
/// `ctx` must have passed [`validate_initial`]; the scheduler must
/// consider the task RUNNING.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn start_first(ctx: *const CpuContext) -> ! {
    // SAFETY: forwarded per the function contract.
    unsafe { switch_asm::start_first_task(ctx) }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn eflags_sanitisation_keeps_arithmetic_bits_only() {
        // All bits set: only the keep-mask survives, IF and bit 1 forced.
        assert_eq!(sanitized_eflags(0xFFFF_FFFF), EFLAGS_KEEP_MASK | EFLAGS_REQUIRED);
        // Empty flags still gain IF and the reserved bit.
        assert_eq!(sanitized_eflags(0), EFLAGS_REQUIRED);
        // IOPL (bits 12-13) never survives.
        assert_eq!(sanitized_eflags(0x3000) & 0x3000, 0);
    }

    #[test]
    fn kernel_task_context_shape() {
        let ctx = CpuContext::kernel_task(0x40_0000, 0x80_0000);
        assert_eq!(ctx.eip, 0x40_0000);
        assert_eq!(ctx.esp, 0x80_0000);
        assert_eq!(ctx.eflags, EFLAGS_REQUIRED);
        assert_eq!(ctx.cs, selectors::KERNEL_CODE as u32);
        assert_eq!(ctx.ss, selectors::KERNEL_DATA as u32);
        assert_eq!(ctx.eax, 0);
    }

    #[test]
    fn validation_fixes_alignment_and_sanitises() {
        let mut ctx = CpuContext::kernel_task(0x40_0000, 0x80_0008);
        ctx.eflags = 0xFFFF_FFFF;
        validate_initial(&mut ctx).unwrap();
        assert_eq!(ctx.esp, 0x80_0000);
        assert_eq!(ctx.eflags, EFLAGS_KEEP_MASK | EFLAGS_REQUIRED);
    }

    #[test]
    fn validation_rejects_bad_contexts() {
        let mut null_eip = CpuContext::kernel_task(0, 0x80_0000);
        assert!(validate_initial(&mut null_eip).is_err());

        let mut low_esp = CpuContext::kernel_task(0x40_0000, 0x1000);
        assert!(validate_initial(&mut low_esp).is_err());

        let mut bad_cs = CpuContext::kernel_task(0x40_0000, 0x80_0000);
        bad_cs.cs = selectors::USER_CODE as u32;
        assert!(validate_initial(&mut bad_cs).is_err());
    }

    #[test]
    fn esp_window_matches_spec_bounds() {
        assert!(!esp_plausible(CONTEXT_MIN_ESP - 1));
        assert!(esp_plausible(CONTEXT_MIN_ESP));
        assert!(esp_plausible(CONTEXT_MAX_ESP - 4));
        assert!(!esp_plausible(CONTEXT_MAX_ESP));
    }
}
