//! Interrupt and exception dispatch.
//!
//! All 49 installed vectors (32 exceptions, 16 hardware IRQs, the
//! syscall trap) funnel through assembly stubs into one
//! `isr_handler(&mut Regs)`. Exceptions go to the fault policy in
//! [`faults`]; IRQs are acknowledged on the active controller and fanned
//! out to registered handlers; vector 0x80 reaches the pluggable syscall
//! dispatcher.

pub mod faults;
pub mod panic;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod stubs;

use crate::sync::IrqLock;

/// Saved register frame built by the ISR stubs. Field order mirrors the
/// push sequence (lowest address first): segment registers, `pusha`
/// block, vector/error, then the CPU-pushed IRET frame. The final two
/// fields are only valid when the CPU entered from ring 3.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Regs {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

/// Handler signature for hardware IRQ lines.
pub type IrqHandler = fn(u8);

/// Handler signature for the syscall trap. Receives the full frame; the
/// return path restores any register the handler mutates.
pub type SyscallHandler = fn(&mut Regs);

/// Registered per-line IRQ handlers (16 legacy lines).
static IRQ_HANDLERS: IrqLock<[Option<IrqHandler>; 16]> = IrqLock::new([None; 16]);

/// The pluggable syscall dispatcher (an out-of-scope collaborator).
static SYSCALL_HANDLER: IrqLock<Option<SyscallHandler>> = IrqLock::new(None);

/// Register a handler for a hardware IRQ line. One handler per line.
pub fn register_irq_handler(irq: u8, handler: IrqHandler) -> crate::KernelResult<()> {
    if irq >= 16 {
        return Err(crate::KernelError::InvalidArgument {
            name: "irq",
            reason: "only 16 legacy IRQ lines exist",
        });
    }
    let mut handlers = IRQ_HANDLERS.lock();
    if handlers[irq as usize].is_some() {
        return Err(crate::KernelError::InvalidArgument {
            name: "irq",
            reason: "handler already registered",
        });
    }
    handlers[irq as usize] = Some(handler);
    Ok(())
}

/// Remove the handler for an IRQ line.
pub fn unregister_irq_handler(irq: u8) -> crate::KernelResult<()> {
    if irq >= 16 {
        return Err(crate::KernelError::InvalidArgument {
            name: "irq",
            reason: "only 16 legacy IRQ lines exist",
        });
    }
    let mut handlers = IRQ_HANDLERS.lock();
    if handlers[irq as usize].take().is_none() {
        return Err(crate::KernelError::InvalidArgument {
            name: "irq",
            reason: "no handler registered",
        });
    }
    Ok(())
}

/// Install the syscall dispatcher invoked for vector 0x80.
pub fn set_syscall_handler(handler: SyscallHandler) {
    *SYSCALL_HANDLER.lock() = Some(handler);
}

// ---------------------------------------------------------------------------
// Bare-metal dispatch
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod dispatch {
    use core::sync::atomic::{AtomicU64, Ordering};

    use super::{Regs, IRQ_HANDLERS, SYSCALL_HANDLER};
    use crate::{
        arch::x86::{
            apic,
            idt::{self, Idt, GATE_INTERRUPT, GATE_TRAP_USER},
            pic,
        },
        interrupt::{faults, stubs},
        sync::IrqCell,
        time,
    };

    /// The one IDT. Lives in a cell so `init` can fill it while the
    /// loaded table address stays fixed.
    static IDT: IrqCell<Idt> = IrqCell::new(Idt::zeroed());

    static DISPATCH_COUNT: AtomicU64 = AtomicU64::new(0);
    static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);

    /// PIC masks for the legacy path: timer, keyboard, and cascade on
    /// the master; primary IDE on the slave.
    const MASTER_MASK: u8 = !0b0000_0111;
    const SLAVE_MASK: u8 = !(1 << 6);

    /// Program the IDT (zeroed, then 32 exception stubs, 16 IRQ stubs,
    /// the 0x80 trap), load it, and remap the PIC. The PIC remap happens
    /// unconditionally so legacy vectors can never collide with
    /// exceptions, even when the APIC takes over later.
    ///
    /// # Safety
    ///
    /// Must run once, with interrupts disabled, after the GDT is live.
    pub unsafe fn init() {
        // SAFETY: single boot-time call per the contract; interrupts are
        // off so nothing reads the table while it is filled.
        let table = unsafe { IDT.get_mut() };
        for vector in 0..32u8 {
            table.set(vector, stubs::stub_address(vector as usize), GATE_INTERRUPT);
        }
        for vector in 32..48u8 {
            table.set(vector, stubs::stub_address(vector as usize), GATE_INTERRUPT);
        }
        table.set(0x80, stubs::stub_address(48), GATE_TRAP_USER);

        // SAFETY: the cell is static, so the address handed to lidt
        // stays valid forever.
        unsafe { idt::load(&*(table as *const Idt)) };

        pic::remap();
        pic::set_masks(MASTER_MASK, SLAVE_MASK);
        crate::println!("[int] IDT loaded, PIC remapped to 0x20/0x28");
    }

    /// Hand the timer over to the local APIC; the PIT line is masked and
    /// the LAPIC timer fires the same vector.
    ///
    /// # Safety
    ///
    /// See [`apic::init`].
    pub unsafe fn enable_apic_timer(mmio_virt: u32) {
        // SAFETY: forwarded contract.
        unsafe { apic::init(mmio_virt, pic::REMAP_OFFSET) };
        pic::disable_irq(0);
    }

    pub fn dispatch_count() -> u64 {
        DISPATCH_COUNT.load(Ordering::Relaxed)
    }

    fn acknowledge(irq: u8) {
        if irq == 0 && apic::is_active() {
            apic::end_of_interrupt();
        } else {
            pic::end_of_interrupt(irq);
        }
    }

    fn handle_irq(regs: &mut Regs) {
        let irq = (regs.vector - 32) as u8;

        if !apic::is_active() && pic::is_spurious(irq) {
            SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
            if irq == 15 {
                // The cascade line still saw a real interrupt.
                pic::end_of_interrupt(2);
            }
            return;
        }

        // Acknowledge before the tick: the scheduler may context-switch
        // out of this frame and the controller must not stay blocked.
        acknowledge(irq);

        if irq == 0 {
            time::on_tick();
            return;
        }

        let handler = IRQ_HANDLERS.lock()[irq as usize];
        match handler {
            Some(h) => h(irq),
            None => log::trace!(target: "int", "unhandled IRQ {}", irq),
        }
    }

    fn handle_syscall(regs: &mut Regs) {
        let handler = *SYSCALL_HANDLER.lock();
        match handler {
            Some(h) => h(regs),
            None => {
                log::warn!(target: "int", "syscall with no dispatcher installed");
                regs.eax = u32::MAX;
            }
        }
    }

    /// Common entry from the assembly stubs.
    ///
    /// # Safety
    ///
    /// Called only by the stubs with a frame they just built.
    #[no_mangle]
    unsafe extern "C" fn isr_handler(regs: *mut Regs) {
        DISPATCH_COUNT.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the stub passes a valid, exclusive frame pointer.
        let regs = unsafe { &mut *regs };
        match regs.vector {
            0..=31 => faults::handle_exception(regs),
            32..=47 => handle_irq(regs),
            0x80 => handle_syscall(regs),
            other => log::warn!(target: "int", "stray vector {}", other),
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use dispatch::{dispatch_count, enable_apic_timer, init};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn nop_handler(_irq: u8) {}
    fn other_handler(_irq: u8) {}

    #[test]
    fn irq_registry_enforces_one_handler_per_line() {
        register_irq_handler(5, nop_handler).unwrap();
        assert!(register_irq_handler(5, other_handler).is_err());
        unregister_irq_handler(5).unwrap();
        assert!(unregister_irq_handler(5).is_err());
        register_irq_handler(5, other_handler).unwrap();
        unregister_irq_handler(5).unwrap();
    }

    #[test]
    fn irq_registry_bounds_lines() {
        assert!(register_irq_handler(16, nop_handler).is_err());
        assert!(unregister_irq_handler(200).is_err());
    }

    #[test]
    fn regs_frame_layout_matches_push_order() {
        // The stubs rely on this exact layout; pin the load-bearing
        // offsets.
        assert_eq!(core::mem::offset_of!(Regs, gs), 0);
        assert_eq!(core::mem::offset_of!(Regs, edi), 16);
        assert_eq!(core::mem::offset_of!(Regs, eax), 44);
        assert_eq!(core::mem::offset_of!(Regs, vector), 48);
        assert_eq!(core::mem::offset_of!(Regs, err_code), 52);
        assert_eq!(core::mem::offset_of!(Regs, eip), 56);
        assert_eq!(core::mem::offset_of!(Regs, cs), 60);
        assert_eq!(core::mem::offset_of!(Regs, eflags), 64);
    }
}
