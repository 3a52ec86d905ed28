//! Boot sequencer.
//!
//! Validates the Multiboot2 handoff, derives the physical memory map,
//! brings the subsystems up in dependency order, creates the initial
//! task set, and performs the first context switch. Stages owned by
//! out-of-scope collaborators (VFS, disk, filesystems) are logged and
//! skipped; the hooks they attach to live in `interrupt` and `kernel`.

use crate::{framebuffer::FramebufferInfo, mm::phys::Region};

/// Upper bound on memory-map entries kept in the boot record.
const MAX_MMAP_ENTRIES: usize = 32;

/// Immutable snapshot of what the bootloader told us, available to every
/// later consumer through the kernel bundle.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub framebuffer: Option<FramebufferInfo>,
    memory_map: [Region; MAX_MMAP_ENTRIES],
    memory_map_len: usize,
    pub multiboot_start: u32,
    pub multiboot_end: u32,
}

impl BootInfo {
    pub fn new(multiboot_start: u32, multiboot_end: u32) -> Self {
        Self {
            framebuffer: None,
            memory_map: [Region { base: 0, length: 0 }; MAX_MMAP_ENTRIES],
            memory_map_len: 0,
            multiboot_start,
            multiboot_end,
        }
    }

    /// Record one usable region reported by the loader (pre-carving).
    pub fn push_region(&mut self, region: Region) {
        if self.memory_map_len < MAX_MMAP_ENTRIES {
            self.memory_map[self.memory_map_len] = region;
            self.memory_map_len += 1;
        }
    }

    /// The usable RAM regions as the loader reported them.
    pub fn memory_map(&self) -> &[Region] {
        &self.memory_map[..self.memory_map_len]
    }

    pub fn total_usable(&self) -> u64 {
        self.memory_map().iter().map(|r| r.length).sum()
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod sequencer {
    use core::ptr;

    use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

    use super::BootInfo;
    use crate::{
        arch::x86::{apic, context, cpu, gdt, port},
        config::{KERNEL_VIRTUAL_BASE, MULTIBOOT2_BOOT_MAGIC, PAGE_SIZE},
        framebuffer::{self, FramebufferInfo},
        interrupt,
        kernel::{self, Kernel},
        klog,
        mm::{
            align_up, heap,
            paging::{self, PageFlags},
            phys::{PhysicalMemory, Region},
            PhysAddr, VirtAddr,
        },
        println,
        sched::{scheduler, Priority, Scheduler},
        sync::{InterruptGuard, IrqCell, IrqLock},
        time,
    };

    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    fn kernel_image_bounds() -> (usize, usize) {
        // SAFETY: linker-provided symbols bracketing the loaded image.
        unsafe {
            (
                ptr::addr_of!(__kernel_start) as usize,
                ptr::addr_of!(__kernel_end) as usize,
            )
        }
    }

    /// Drain the keyboard controller so it keeps raising interrupts; the
    /// real driver is a collaborator that replaces this registration.
    fn keyboard_stub(_irq: u8) {
        // SAFETY: reading port 0x60 pops the controller's output buffer.
        let scancode = unsafe { port::port_in8(0x60) };
        log::trace!(target: "boot", "keyboard scancode {:#04x} (stub)", scancode);
    }

    /// The main-loop task: a periodic heartbeat reporting subsystem
    /// statistics until the collaborators above the core take over.
    extern "C" fn main_loop(_arg: *mut ()) {
        loop {
            scheduler::task_sleep(5_000);
            let heap_stats = heap::KERNEL_HEAP.stats();
            let defrag_stats = crate::mm::defrag::stats();
            log::info!(
                target: "main",
                "up {} ms: heap {} used / {} free ({} blocks, {}% frag), defrag {} runs / {} merges",
                time::now_ms(),
                heap_stats.used,
                heap_stats.free,
                heap_stats.free_blocks_count,
                heap_stats.fragmentation_percent,
                defrag_stats.total_runs,
                defrag_stats.total_merges,
            );
        }
    }

    /// Kernel entry, called from `_start` with the loader's EAX/EBX.
    pub extern "C" fn kmain(magic: u32, info_addr: u32) -> ! {
        println!();
        println!("EmberOS kernel {} starting", env!("CARGO_PKG_VERSION"));

        if magic != MULTIBOOT2_BOOT_MAGIC {
            println!(
                "[boot] bad Multiboot2 magic {:#010x} (want {:#010x})",
                magic, MULTIBOOT2_BOOT_MAGIC
            );
            cpu::halt_forever();
        }

        // SAFETY: the loader passed this pointer one instruction ago and
        // the tag list is identity-accessible this early.
        let mb = match unsafe { BootInformation::load(info_addr as *const BootInformationHeader) }
        {
            Ok(mb) => mb,
            Err(_) => {
                println!("[boot] malformed Multiboot2 tag list at {:#010x}", info_addr);
                cpu::halt_forever();
            }
        };

        // --- physical memory map -----------------------------------------
        let mut record = BootInfo::new(info_addr, info_addr + mb.total_size() as u32);
        let mut pm = PhysicalMemory::new();
        let Some(mmap) = mb.memory_map_tag() else {
            println!("[boot] loader supplied no memory map");
            cpu::halt_forever();
        };
        for area in mmap.memory_areas() {
            if MemoryAreaType::from(area.typ()) == MemoryAreaType::Available {
                pm.insert(area.start_address(), area.size());
                record.push_region(Region {
                    base: area.start_address(),
                    length: area.size(),
                });
            }
        }

        let (kstart, kend) = kernel_image_bounds();
        // Low memory (IVT, EBDA, VGA, BIOS ROM) stays out of the free
        // list but remains kernel-readable for the ACPI scanner.
        pm.reserve(0, 0x10_0000);
        pm.reserve(kstart as u64, (kend - kstart) as u64);
        pm.reserve(info_addr as u64, mb.total_size() as u64);

        let stats = pm.stats();
        println!(
            "[boot] usable RAM {} MiB in {} regions (largest {} MiB)",
            stats.total_free >> 20,
            stats.region_count,
            stats.largest_region >> 20
        );

        // --- MMU & paging -------------------------------------------------
        // SAFETY: single call, interrupts are still off.
        let mut mmu = unsafe { paging::take_kernel_space() };
        let image_span = align_up(kend, PAGE_SIZE);

        mmu.map_region(
            VirtAddr::new(0),
            PhysAddr::new(0),
            image_span,
            PageFlags::KERNEL_RW,
        )
        .expect("identity mapping of the kernel image cannot fail");
        mmu.map_region(
            VirtAddr::new(KERNEL_VIRTUAL_BASE),
            PhysAddr::new(0),
            image_span,
            PageFlags::KERNEL_RW,
        )
        .expect("higher-half mapping of the kernel image cannot fail");

        let fb_info = parse_framebuffer(&mb, &mut mmu);
        record.framebuffer = fb_info;
        if let Some(fb) = fb_info {
            framebuffer::set(fb);
            println!(
                "[boot] framebuffer {}x{}x{} at {:#010x} -> {:#010x}",
                fb.width, fb.height, fb.bpp, fb.phys, fb.virt
            );
        }

        // SAFETY: the directory identity-maps the executing image, so
        // the instruction stream survives the switch.
        unsafe {
            cpu::load_cr3(mmu.directory_phys().as_u32());
            cpu::enable_paging();
        }
        println!("[boot] paging enabled, kernel half shared at entries 0..768");

        // --- heap ---------------------------------------------------------
        // SAFETY: single call, before the first allocation.
        unsafe { heap::init() };
        let (heap_base, heap_size) = heap::region_bounds();
        println!(
            "[boot] heap {} MiB at {:#010x}",
            heap_size >> 20,
            heap_base
        );

        // Everything mutable now lives in the bundle.
        let k = kernel::init(Kernel {
            boot: record,
            phys: IrqLock::new(pm),
            mmu: IrqLock::new(mmu),
            sched: IrqCell::new(Scheduler::new()),
        });

        // --- descriptor tables and interrupts -----------------------------
        // SAFETY: interrupts are off; boot is single-threaded.
        unsafe { gdt::init() };
        println!("[boot] GDT loaded (flat kernel/user segments)");
        // SAFETY: GDT is live, interrupts still off.
        unsafe { interrupt::init() };

        // --- timer and early devices ---------------------------------------
        time::init_pit();
        let _ = interrupt::register_irq_handler(1, keyboard_stub);
        println!("[boot] keyboard stub wired to IRQ 1");
        println!("[boot] serial console on COM1");
        println!("[boot] VFS registry, disk, filesystems: delegated to collaborators");

        // --- CPU probe and the real timer ----------------------------------
        let cpu_info = cpu::probe();
        println!(
            "[boot] cpu '{}' features edx={:#010x}",
            cpu_info.vendor_str(),
            cpu_info.features_edx
        );
        if cpu_info.has_pse() {
            // SAFETY: no LARGE entries exist yet.
            unsafe { cpu::enable_pse() };
        }
        if cpu_info.has_apic() {
            let lapic_phys = PhysAddr::new(apic::physical_base());
            match k.mmu.lock().ensure_physical_accessible(lapic_phys, PAGE_SIZE) {
                Ok(virt) => {
                    // SAFETY: the MMIO block is mapped and the PIT still
                    // ticks for calibration; interrupts are off.
                    unsafe { interrupt::enable_apic_timer(virt.as_u32()) };
                    println!("[boot] timer switched to local APIC");
                }
                Err(e) => println!("[boot] APIC mapping failed ({}), keeping PIT", e),
            }
        } else {
            println!("[boot] no APIC, PIT retained");
        }

        // --- structured logging --------------------------------------------
        klog::init(log::LevelFilter::Info);
        log::info!(target: "boot", "structured logging online");

        // --- scheduler and the initial task set ----------------------------
        {
            let _guard = InterruptGuard::new();
            // SAFETY: interrupts disabled; borrow scoped to this block.
            let sched = unsafe { k.sched.get_mut() };
            sched
                .create_idle(scheduler::idle_main as usize, scheduler::task_exit as usize)
                .expect("idle task creation cannot fail");
        }
        scheduler::task_create(
            "cleanup",
            scheduler::cleanup_main,
            ptr::null_mut(),
            Priority::High,
        )
        .expect("cleanup task creation cannot fail");
        scheduler::task_create(
            "defrag",
            crate::mm::defrag::defrag_main,
            ptr::null_mut(),
            Priority::Low,
        )
        .expect("defrag task creation cannot fail");
        let main_id = scheduler::task_create("main", main_loop, ptr::null_mut(), Priority::Normal)
            .expect("main task creation cannot fail");
        log::info!(target: "boot", "idle, cleanup, defrag, main tasks ready");

        // --- first context switch ------------------------------------------
        let first_ctx = {
            let _guard = InterruptGuard::new();
            // SAFETY: interrupts disabled; borrow scoped to this block.
            let sched = unsafe { k.sched.get_mut() };
            sched.preemption_enabled = true;
            let task = sched
                .task_mut(main_id)
                .expect("first task exists");
            context::validate_initial(&mut task.context)
                .expect("first task context must validate");
            sched.set_first(main_id).expect("first task exists")
        };

        log::info!(target: "boot", "handing off to the scheduler");
        // SAFETY: the context passed validation and its task is RUNNING.
        unsafe { context::start_first(first_ctx) }
    }

    /// Pull the framebuffer tag, map it uncached/write-through into a
    /// direct-map window, and describe it.
    fn parse_framebuffer(
        mb: &BootInformation,
        mmu: &mut paging::Mmu<'static>,
    ) -> Option<FramebufferInfo> {
        let tag = mb.framebuffer_tag().and_then(|t| t.ok())?;
        if tag.address() > u32::MAX as u64 {
            println!("[boot] framebuffer above 4 GiB, ignoring");
            return None;
        }
        let phys = PhysAddr::new(tag.address() as u32);
        let pitch = tag.pitch();
        let height = tag.height();
        let size = pitch as usize * height as usize;

        let virt = match mmu.ensure_physical_accessible(phys, size) {
            Ok(v) => v,
            Err(e) => {
                println!("[boot] framebuffer mapping failed: {}", e);
                return None;
            }
        };
        // MMIO wants no caching and write-through ordering.
        let flags = PageFlags::KERNEL_RW | PageFlags::CACHE_DISABLE | PageFlags::WRITETHROUGH;
        let pages = size.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let v = VirtAddr::new(virt.align_down().as_u32() + (i * PAGE_SIZE) as u32);
            if let Err(e) = mmu.set_flags(v, flags) {
                println!("[boot] framebuffer flag update failed: {}", e);
                return None;
            }
        }

        Some(FramebufferInfo {
            phys: phys.as_u32(),
            virt: virt.as_u32(),
            width: tag.width(),
            height,
            pitch,
            bpp: tag.bpp(),
        })
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use sequencer::kmain;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn boot_record_accumulates_regions() {
        let mut info = BootInfo::new(0x10000, 0x11000);
        info.push_region(Region {
            base: 0x10_0000,
            length: 0x40_0000,
        });
        info.push_region(Region {
            base: 0x100_0000,
            length: 0x80_0000,
        });
        assert_eq!(info.memory_map().len(), 2);
        assert_eq!(info.total_usable(), 0xC0_0000);
        assert_eq!(info.multiboot_start, 0x10000);
    }

    #[test]
    fn boot_record_bounds_entries() {
        let mut info = BootInfo::new(0, 0);
        for i in 0..40 {
            info.push_region(Region {
                base: i * 0x1000,
                length: 0x1000,
            });
        }
        assert_eq!(info.memory_map().len(), 32);
    }
}
