//! The bundled kernel state.
//!
//! Instead of loose ambient globals, the core's mutable state lives in
//! one [`Kernel`] value that every component borrows through
//! [`kernel`]. The bundle is created exactly once by the boot sequencer;
//! collaborators above the core receive sub-borrows of it.

use spin::Once;

use crate::{
    boot::BootInfo,
    mm::{paging::Mmu, phys::PhysicalMemory},
    sched::Scheduler,
    sync::{IrqCell, IrqLock},
};

/// The core's mutable state.
pub struct Kernel {
    /// Immutable boot record (framebuffer geometry, memory-map snapshot).
    pub boot: BootInfo,
    /// Free physical regions and the frame allocator.
    pub phys: IrqLock<PhysicalMemory>,
    /// The kernel address space.
    pub mmu: IrqLock<Mmu<'static>>,
    /// Scheduler state. An [`IrqCell`] rather than a lock: the borrow
    /// must survive a context switch, which a lock guard on the
    /// switched-away stack could not.
    pub sched: IrqCell<Scheduler>,
}

static KERNEL: Once<Kernel> = Once::new();

/// Install the bundle. Later calls return the first value unchanged.
pub fn init(kernel: Kernel) -> &'static Kernel {
    KERNEL.call_once(|| kernel)
}

/// Borrow the kernel state.
///
/// Panics when called before [`init`]; using a subsystem before the boot
/// sequencer wired it is a kernel bug, not a recoverable failure.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel state used before boot")
}

/// Non-panicking variant for paths (like the panic screen) that may run
/// arbitrarily early.
pub fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod address_spaces {
    use super::*;
    use crate::{
        arch::x86::cpu,
        config::{KERNEL_DIR_ENTRIES, PAGE_SIZE},
        error::KernelResult,
        mm::{paging::PageDirectory, PhysAddr},
    };

    impl Kernel {
        /// Physical address of the shared kernel page directory.
        pub fn kernel_page_directory(&self) -> PhysAddr {
            self.mmu.lock().directory_phys()
        }

        /// Load another address space. The kernel half is present in
        /// every directory created by [`Kernel::create_user_address_space`],
        /// so kernel code keeps running across the switch.
        ///
        /// # Safety
        ///
        /// `pd` must be a page directory produced by this kernel (the
        /// kernel directory or a user directory with the shared half).
        pub unsafe fn switch_to_address_space(&self, pd: PhysAddr) {
            // SAFETY: forwarded contract.
            unsafe { cpu::load_cr3(pd.as_u32()) };
        }

        /// Allocate and initialise a user page directory: a fresh frame
        /// whose first 768 entries alias the kernel half and whose user
        /// half starts empty. Returns its physical address (for CR3 and
        /// the TCB).
        pub fn create_user_address_space(&self) -> KernelResult<PhysAddr> {
            let frame = self.phys.lock().alloc_frame()?;
            let mut mmu = self.mmu.lock();
            let virt = match mmu.ensure_physical_accessible(frame, PAGE_SIZE) {
                Ok(v) => v,
                Err(e) => {
                    drop(mmu);
                    self.phys.lock().free_frame(frame);
                    return Err(e);
                }
            };
            // SAFETY: the window mapping makes the fresh frame writable;
            // it is exclusively ours until handed out.
            let dir = unsafe { &mut *(virt.as_usize() as *mut PageDirectory) };
            for entry in dir.entries[KERNEL_DIR_ENTRIES..].iter_mut() {
                *entry = crate::mm::paging::Entry::ABSENT;
            }
            mmu.copy_kernel_mappings(dir);
            Ok(frame)
        }

        /// Release a user page directory previously created here.
        pub fn destroy_user_address_space(&self, pd: PhysAddr) {
            self.phys.lock().free_frame(pd);
        }
    }
}
