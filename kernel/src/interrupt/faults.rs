//! Exception policy.
//!
//! Each fault is classified once into a [`FaultSite`] (kernel or user,
//! from the low bits of the saved CS) and the (vector, site) pair maps
//! to one [`FaultAction`]. Kernel faults are fatal except for a
//! recoverable divide error; user faults terminate the offending task
//! and context-switch to the next runnable one instead of panicking.

use crate::sched::TaskId;

/// Where the fault happened, computed once per fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSite {
    Kernel,
    User(TaskId),
}

impl FaultSite {
    /// Classify from a saved CS selector and the id of the interrupted
    /// task.
    pub fn classify(cs: u32, current: TaskId) -> Self {
        if cs & 0x3 == 3 {
            FaultSite::User(current)
        } else {
            FaultSite::Kernel
        }
    }
}

/// What the dispatcher does about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Log and return to the faulting instruction's successor state.
    Resume,
    /// Kernel divide error: zero EAX and step over the DIV/IDIV.
    RecoverDivide,
    /// Kill the user task and switch to the next runnable one.
    TerminateTask,
    /// Render the panic screen and halt.
    Panic,
}

/// The exception policy table.
pub fn policy(vector: u32, site: FaultSite) -> FaultAction {
    match (vector, site) {
        (0, FaultSite::Kernel) => FaultAction::RecoverDivide,
        (8, _) => FaultAction::Panic,
        (10..=14, FaultSite::Kernel) => FaultAction::Panic,
        (_, FaultSite::User(_)) => FaultAction::TerminateTask,
        (_, FaultSite::Kernel) => FaultAction::Resume,
    }
}

/// Exception mnemonics for vectors 0..31.
pub const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point error",
    "virtualization error",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security exception",
    "reserved",
];

/// Length in bytes of the DIV/IDIV instruction starting at `code`, or
/// `None` if the bytes are not a divide at all. Covers exactly the
/// encodings that can raise #DE: `F6 /6`, `F6 /7`, `F7 /6`, `F7 /7`,
/// with an optional operand-size prefix, including SIB and displacement
/// forms. Anything else declines recovery.
pub fn div_instruction_len(code: &[u8]) -> Option<usize> {
    let mut i = 0;
    // At most one operand-size prefix is produced for DIV/IDIV.
    if code.get(i) == Some(&0x66) {
        i += 1;
    }
    let opcode = *code.get(i)?;
    if opcode != 0xF6 && opcode != 0xF7 {
        return None;
    }
    i += 1;

    let modrm = *code.get(i)?;
    let reg = (modrm >> 3) & 0x7;
    if reg != 6 && reg != 7 {
        return None; // the /6 (DIV) and /7 (IDIV) groups only
    }
    i += 1;

    let mode = modrm >> 6;
    let rm = modrm & 0x7;
    if mode == 0b11 {
        return Some(i); // register operand
    }

    let mut sib_base_disp32 = false;
    if rm == 0b100 {
        let sib = *code.get(i)?;
        i += 1;
        if mode == 0b00 && sib & 0x7 == 0b101 {
            sib_base_disp32 = true;
        }
    }

    match mode {
        0b00 => {
            if rm == 0b101 || sib_base_disp32 {
                i += 4;
            }
        }
        0b01 => i += 1,
        0b10 => i += 4,
        _ => unreachable!(),
    }
    Some(i)
}

// ---------------------------------------------------------------------------
// Bare-metal handling
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod handling {
    use super::*;
    use crate::{
        arch::x86::{context, cpu},
        interrupt::{panic, Regs},
        kernel::kernel,
        sched::scheduler::current_task_id,
        sync::InterruptGuard,
    };

    /// Entry for vectors 0..31.
    pub fn handle_exception(regs: &mut Regs) {
        let site = FaultSite::classify(regs.cs, current_task_id());
        let name = EXCEPTION_NAMES
            .get(regs.vector as usize)
            .copied()
            .unwrap_or("unknown");

        match policy(regs.vector, site) {
            FaultAction::Resume => {
                log::warn!(
                    target: "int",
                    "kernel {} at {:#010x} (err {:#x}), resuming",
                    name,
                    regs.eip,
                    regs.err_code
                );
            }
            FaultAction::RecoverDivide => recover_divide(regs),
            FaultAction::TerminateTask => terminate_user_task(regs, name),
            FaultAction::Panic => panic::exception_panic(regs),
        }
    }

    /// Kernel-mode #DE: zero the quotient register and step over the
    /// faulting DIV/IDIV. Anything that is not a divide instruction
    /// means corrupted control flow, which is fatal.
    fn recover_divide(regs: &mut Regs) {
        // SAFETY: EIP pointed at executing kernel code one instruction
        // ago, so reading a few bytes from it is sound.
        let code = unsafe { core::slice::from_raw_parts(regs.eip as *const u8, 8) };
        match div_instruction_len(code) {
            Some(len) => {
                log::warn!(
                    target: "int",
                    "kernel divide error at {:#010x}, zeroing EAX and skipping {} bytes",
                    regs.eip,
                    len
                );
                regs.eax = 0;
                regs.eip += len as u32;
            }
            None => panic::exception_panic(regs),
        }
    }

    /// The delicate path: the faulting user address space may be gone,
    /// so the kernel directory is loaded first; the task is marked
    /// ZOMBIE (its TCB and stack stay live, the cleanup task reaps them
    /// later) and the scheduler promotes the next READY task. The final
    /// context switch abandons this ISR frame on the dead task's stack
    /// and never returns.
    fn terminate_user_task(regs: &mut Regs, name: &str) {
        let fault_addr = if regs.vector == 14 {
            Some(cpu::read_cr2())
        } else {
            None
        };
        log::warn!(
            target: "int",
            "user task {} killed by {} at {:#010x} (err {:#x}, addr {:?})",
            current_task_id(),
            name,
            regs.eip,
            regs.err_code,
            fault_addr,
        );

        // 1. Back to the kernel address space.
        let kernel_pd = kernel().mmu.lock().directory_phys();
        // SAFETY: the kernel directory maps this code and stack.
        unsafe { cpu::load_cr3(kernel_pd.as_u32()) };

        // 2-4. Zombify, pick a successor, update the current pointer.
        let pair = {
            let _guard = InterruptGuard::new();
            // SAFETY: interrupts disabled; borrow scoped to this block.
            unsafe { kernel().sched.get_mut() }.terminate_current()
        };

        // 5. Switch away for good.
        if let Some((old, new)) = pair {
            // SAFETY: both contexts are arena-owned; the old one belongs
            // to the zombie and is never restored.
            let _ = unsafe { context::switch(old, new) };
        }
        // No scheduler or no successor: nothing left to run.
        panic::exception_panic(regs);
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use handling::handle_exception;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn site_classification_uses_cpl_bits() {
        assert_eq!(
            FaultSite::classify(0x08, TaskId(3)),
            FaultSite::Kernel
        );
        assert_eq!(
            FaultSite::classify(0x1B, TaskId(3)),
            FaultSite::User(TaskId(3))
        );
    }

    #[test]
    fn policy_table_matches_design() {
        use FaultAction::*;
        let user = FaultSite::User(TaskId(1));
        let kernel = FaultSite::Kernel;

        assert_eq!(policy(0, kernel), RecoverDivide);
        assert_eq!(policy(0, user), TerminateTask);
        assert_eq!(policy(8, kernel), Panic);
        assert_eq!(policy(8, user), Panic);
        for v in [10, 11, 12, 13, 14] {
            assert_eq!(policy(v, kernel), Panic);
            assert_eq!(policy(v, user), TerminateTask);
        }
        assert_eq!(policy(6, kernel), Resume);
        assert_eq!(policy(6, user), TerminateTask);
    }

    #[test]
    fn div_lengths_for_register_forms() {
        // div eax -> F7 F0; idiv ecx -> F7 F9; div cl -> F6 F1.
        assert_eq!(div_instruction_len(&[0xF7, 0xF0]), Some(2));
        assert_eq!(div_instruction_len(&[0xF7, 0xF9]), Some(2));
        assert_eq!(div_instruction_len(&[0xF6, 0xF1]), Some(2));
    }

    #[test]
    fn div_lengths_for_memory_forms() {
        // div dword ptr [eax] -> F7 30.
        assert_eq!(div_instruction_len(&[0xF7, 0x30]), Some(2));
        // div dword ptr [eax+0x10] -> F7 70 10 (disp8).
        assert_eq!(div_instruction_len(&[0xF7, 0x70, 0x10]), Some(3));
        // div dword ptr [eax+0x12345678] -> F7 B0 .. (disp32).
        assert_eq!(
            div_instruction_len(&[0xF7, 0xB0, 0x78, 0x56, 0x34, 0x12]),
            Some(6)
        );
        // div dword ptr [0x12345678] -> F7 35 .. (mod 00, rm 101).
        assert_eq!(
            div_instruction_len(&[0xF7, 0x35, 0x78, 0x56, 0x34, 0x12]),
            Some(6)
        );
        // div byte ptr [esp+0x10] -> F6 74 24 10 (SIB + disp8).
        assert_eq!(div_instruction_len(&[0xF6, 0x74, 0x24, 0x10]), Some(4));
        // SIB with no base (mod 00, base 101): F7 34 25 disp32.
        assert_eq!(
            div_instruction_len(&[0xF7, 0x34, 0x25, 0x00, 0x10, 0x00, 0x00]),
            Some(7)
        );
        // Operand-size prefix: div word ptr [eax] -> 66 F7 30.
        assert_eq!(div_instruction_len(&[0x66, 0xF7, 0x30]), Some(3));
    }

    #[test]
    fn non_divide_bytes_decline_recovery() {
        // mov eax, imm32.
        assert_eq!(div_instruction_len(&[0xB8, 0x01, 0x00, 0x00, 0x00]), None);
        // F7 /0 is TEST, not DIV.
        assert_eq!(div_instruction_len(&[0xF7, 0xC0, 0x01, 0, 0, 0]), None);
        // Truncated buffer.
        assert_eq!(div_instruction_len(&[0xF7]), None);
        assert_eq!(div_instruction_len(&[]), None);
    }
}
