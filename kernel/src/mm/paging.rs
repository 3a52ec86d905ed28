//! Two-level x86 paging.
//!
//! One kernel page directory plus a flat pool of 1024 page tables, one
//! per directory slot. Table `N` of the pool always backs directory entry
//! `N`, so the walk never has to translate a physical table address back
//! into a pointer. The first [`KERNEL_DIR_ENTRIES`] directory entries are
//! the kernel half and are shared into every user address space.

use bitflags::bitflags;

use crate::{
    config::{ALT_WINDOW_BASE, KERNEL_DIR_ENTRIES, KERNEL_VIRTUAL_BASE, LARGE_PAGE_SIZE, PAGE_SIZE},
    error::{KernelResult, MmError},
    mm::{PhysAddr, VirtAddr},
};

bitflags! {
    /// Page directory / page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const RW            = 1 << 1;
        const USER          = 1 << 2;
        const WRITETHROUGH  = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// 4 MiB entry (directory level only).
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

impl PageFlags {
    /// Flags for ordinary kernel data mappings.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::RW);
}

/// One PDE or PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    pub const ABSENT: Self = Self(0);

    #[inline]
    pub fn new(frame: u32, flags: PageFlags) -> Self {
        Self((frame & !0xFFF) | flags.bits())
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn is_large(self) -> bool {
        self.0 & PageFlags::LARGE.bits() != 0
    }

    /// Physical frame base for a 4 KiB entry (or table base for a PDE).
    #[inline]
    pub fn frame(self) -> u32 {
        self.0 & !0xFFF
    }

    /// Physical base of a 4 MiB entry.
    #[inline]
    pub fn large_frame(self) -> u32 {
        self.0 & !(LARGE_PAGE_SIZE as u32 - 1)
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0xFFF)
    }
}

/// A page table: 1024 entries covering 4 MiB.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Entry; 1024],
}

impl PageTable {
    pub const ZERO: Self = Self {
        entries: [Entry::ABSENT; 1024],
    };

    fn clear(&mut self) {
        self.entries = [Entry::ABSENT; 1024];
    }
}

/// A page directory: 1024 entries covering 4 GiB.
#[repr(C, align(4096))]
pub struct PageDirectory {
    pub entries: [Entry; 1024],
}

impl PageDirectory {
    pub const ZERO: Self = Self {
        entries: [Entry::ABSENT; 1024],
    };
}

/// The flat two-dimensional table array: one page table per directory
/// slot, 4 MiB total.
#[repr(C, align(4096))]
pub struct TablePool {
    pub tables: [PageTable; 1024],
}

impl TablePool {
    pub const ZERO: Self = Self {
        tables: [PageTable::ZERO; 1024],
    };
}

/// The MMU view over a directory and its table pool.
pub struct Mmu<'a> {
    dir: &'a mut PageDirectory,
    pool: &'a mut TablePool,
}

impl<'a> Mmu<'a> {
    pub fn new(dir: &'a mut PageDirectory, pool: &'a mut TablePool) -> Self {
        Self { dir, pool }
    }

    /// Physical address of a pool table. The pool lives in the
    /// identity-mapped kernel image, so virtual and physical coincide.
    fn table_phys(&self, dir_idx: usize) -> u32 {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            &self.pool.tables[dir_idx] as *const PageTable as u32
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            // Host tests never feed this value to hardware; any stable
            // page-aligned number will do.
            0x0100_0000 + (dir_idx as u32) * PAGE_SIZE as u32
        }
    }

    /// Physical address of the directory itself, suitable for CR3.
    pub fn directory_phys(&self) -> PhysAddr {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            PhysAddr::new(&*self.dir as *const PageDirectory as u32)
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            PhysAddr::new(0x00F0_0000)
        }
    }

    /// Map one 4 KiB page. Both addresses are aligned down. Mapping a
    /// page to the frame it already maps is an idempotent success;
    /// mapping it to a different frame fails.
    pub fn map_page(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> KernelResult<()> {
        let virt = virt.align_down();
        let phys = phys.align_down();
        let di = virt.dir_index();
        let ti = virt.table_index();

        let pde = self.dir.entries[di];
        if pde.is_present() && pde.is_large() {
            let mapped = pde.large_frame() + (virt.as_u32() & (LARGE_PAGE_SIZE as u32 - 1));
            if mapped == phys.as_u32() {
                return Ok(());
            }
            return Err(MmError::MappingConflict {
                virt: virt.as_u32(),
                existing: mapped,
            }
            .into());
        }

        if !pde.is_present() {
            self.pool.tables[di].clear();
            let mut dir_flags = PageFlags::PRESENT | PageFlags::RW;
            if flags.contains(PageFlags::USER) {
                dir_flags |= PageFlags::USER;
            }
            self.dir.entries[di] = Entry::new(self.table_phys(di), dir_flags);
        } else if flags.contains(PageFlags::USER) {
            // The directory entry must be user-visible too.
            let e = self.dir.entries[di];
            self.dir.entries[di] = Entry::new(e.frame(), e.flags() | PageFlags::USER);
        }

        let pte = self.pool.tables[di].entries[ti];
        if pte.is_present() {
            if pte.frame() == phys.as_u32() {
                return Ok(());
            }
            return Err(MmError::MappingConflict {
                virt: virt.as_u32(),
                existing: pte.frame(),
            }
            .into());
        }

        self.pool.tables[di].entries[ti] =
            Entry::new(phys.as_u32(), flags | PageFlags::PRESENT);
        flush_tlb(virt);
        Ok(())
    }

    /// Install a 4 MiB directory entry. `virt` and `phys` are aligned
    /// down to 4 MiB. Fails if the slot is occupied by anything else.
    pub fn map_large_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let mask = LARGE_PAGE_SIZE as u32 - 1;
        let vbase = virt.as_u32() & !mask;
        let pbase = phys.as_u32() & !mask;
        let di = (vbase >> 22) as usize;

        let pde = self.dir.entries[di];
        if pde.is_present() {
            if pde.is_large() && pde.large_frame() == pbase {
                return Ok(());
            }
            return Err(MmError::MappingConflict {
                virt: vbase,
                existing: pde.frame(),
            }
            .into());
        }
        self.dir.entries[di] =
            Entry::new(pbase, flags | PageFlags::PRESENT | PageFlags::LARGE);
        flush_tlb(VirtAddr::new(vbase));
        Ok(())
    }

    /// Map a region page by page, all or nothing. The region is
    /// pre-scanned for conflicts so a partial install cannot happen.
    pub fn map_region(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let pages = span_pages(virt, size);
        let vbase = virt.align_down().as_u32();
        let pbase = phys.align_down().as_u32();

        for i in 0..pages {
            let v = VirtAddr::new(vbase.wrapping_add((i * PAGE_SIZE) as u32));
            let p = pbase.wrapping_add((i * PAGE_SIZE) as u32);
            if let Some(existing) = self.translate_page(v) {
                if existing != p {
                    return Err(MmError::MappingConflict {
                        virt: v.as_u32(),
                        existing,
                    }
                    .into());
                }
            }
        }
        for i in 0..pages {
            let v = VirtAddr::new(vbase.wrapping_add((i * PAGE_SIZE) as u32));
            let p = PhysAddr::new(pbase.wrapping_add((i * PAGE_SIZE) as u32));
            self.map_page(v, p, flags)?;
        }
        Ok(())
    }

    /// Remove one 4 KiB mapping. Declines to split 4 MiB entries.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> KernelResult<()> {
        let virt = virt.align_down();
        let di = virt.dir_index();
        let ti = virt.table_index();

        let pde = self.dir.entries[di];
        if !pde.is_present() {
            return Err(MmError::NotMapped { virt: virt.as_u32() }.into());
        }
        if pde.is_large() {
            return Err(MmError::LargePageSplit { virt: virt.as_u32() }.into());
        }
        if !self.pool.tables[di].entries[ti].is_present() {
            return Err(MmError::NotMapped { virt: virt.as_u32() }.into());
        }
        self.pool.tables[di].entries[ti] = Entry::ABSENT;
        flush_tlb(virt);
        Ok(())
    }

    /// Remove a region of 4 KiB mappings. Pages that are already absent
    /// are skipped; 4 MiB entries in the range are declined.
    pub fn unmap_region(&mut self, virt: VirtAddr, size: usize) -> KernelResult<()> {
        let pages = span_pages(virt, size);
        let vbase = virt.align_down().as_u32();
        for i in 0..pages {
            let v = VirtAddr::new(vbase.wrapping_add((i * PAGE_SIZE) as u32));
            match self.unmap_page(v) {
                Ok(()) => {}
                Err(crate::KernelError::Mm(MmError::NotMapped { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Translate a virtual address, honouring 4 MiB entries.
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let di = virt.dir_index();
        let pde = self.dir.entries[di];
        if !pde.is_present() {
            return None;
        }
        if pde.is_large() {
            let off = virt.as_u32() & (LARGE_PAGE_SIZE as u32 - 1);
            return Some(PhysAddr::new(pde.large_frame() + off));
        }
        let pte = self.pool.tables[di].entries[virt.table_index()];
        if !pte.is_present() {
            return None;
        }
        Some(PhysAddr::new(pte.frame() + virt.page_offset()))
    }

    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.virt_to_phys(virt).is_some()
    }

    /// Rewrite the flags of an existing mapping, keeping its frame.
    pub fn set_flags(&mut self, virt: VirtAddr, flags: PageFlags) -> KernelResult<()> {
        let virt = virt.align_down();
        let di = virt.dir_index();
        let pde = self.dir.entries[di];
        if !pde.is_present() {
            return Err(MmError::NotMapped { virt: virt.as_u32() }.into());
        }
        if pde.is_large() {
            self.dir.entries[di] = Entry::new(
                pde.large_frame(),
                flags | PageFlags::PRESENT | PageFlags::LARGE,
            );
            flush_tlb(virt);
            return Ok(());
        }
        let ti = virt.table_index();
        let pte = self.pool.tables[di].entries[ti];
        if !pte.is_present() {
            return Err(MmError::NotMapped { virt: virt.as_u32() }.into());
        }
        self.pool.tables[di].entries[ti] = Entry::new(pte.frame(), flags | PageFlags::PRESENT);
        flush_tlb(virt);
        Ok(())
    }

    /// Return a kernel-half virtual address through which the physical
    /// region can be read and written, installing direct-map window
    /// mappings as needed. Window arithmetic wraps modulo 4 GiB so high
    /// MMIO still lands inside the kernel half; a window occupied by a
    /// conflicting mapping is skipped in favour of the alternate one.
    pub fn ensure_physical_accessible(
        &mut self,
        phys: PhysAddr,
        size: usize,
    ) -> KernelResult<VirtAddr> {
        let pbase = phys.align_down().as_u32();
        let span = span_pages(VirtAddr::new(phys.as_u32()), size);

        'window: for base in [KERNEL_VIRTUAL_BASE, ALT_WINDOW_BASE] {
            let vbase = base.wrapping_add(pbase);
            // The whole span must stay inside the shared kernel half.
            let vend = vbase.wrapping_add((span * PAGE_SIZE) as u32);
            if (vbase >> 22) as usize >= KERNEL_DIR_ENTRIES
                || ((vend.wrapping_sub(1)) >> 22) as usize >= KERNEL_DIR_ENTRIES
                || vend < vbase
            {
                continue;
            }
            for i in 0..span {
                let v = VirtAddr::new(vbase + (i * PAGE_SIZE) as u32);
                let p = pbase + (i * PAGE_SIZE) as u32;
                if let Some(existing) = self.translate_page(v) {
                    if existing != p {
                        continue 'window;
                    }
                }
            }
            for i in 0..span {
                let v = VirtAddr::new(vbase + (i * PAGE_SIZE) as u32);
                let p = PhysAddr::new(pbase + (i * PAGE_SIZE) as u32);
                self.map_page(v, p, PageFlags::KERNEL_RW)?;
            }
            return Ok(VirtAddr::new(vbase + (phys.as_u32() - pbase)));
        }
        Err(MmError::WindowBusy { phys: phys.as_u32() }.into())
    }

    /// Share the kernel half (directory entries 0..768) into another
    /// directory.
    pub fn copy_kernel_mappings(&self, target: &mut PageDirectory) {
        target.entries[..KERNEL_DIR_ENTRIES]
            .copy_from_slice(&self.dir.entries[..KERNEL_DIR_ENTRIES]);
    }

    /// Frame backing the page that contains `virt`, if any.
    fn translate_page(&self, virt: VirtAddr) -> Option<u32> {
        self.virt_to_phys(virt.align_down()).map(|p| p.as_u32())
    }
}

/// Number of pages needed to cover `size` bytes starting at `virt`
/// (accounting for the offset inside the first page).
fn span_pages(virt: VirtAddr, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let off = virt.page_offset() as usize;
    (off + size).div_ceil(PAGE_SIZE)
}

#[inline]
fn flush_tlb(virt: VirtAddr) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: invlpg on any address is harmless; it only drops a TLB entry.
    unsafe {
        crate::arch::x86::cpu::invlpg(virt.as_u32())
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = virt;
}

// ---------------------------------------------------------------------------
// Kernel-space static storage (bare metal)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod storage {
    use core::cell::UnsafeCell;

    use super::{Mmu, PageDirectory, TablePool};

    struct DirCell(UnsafeCell<PageDirectory>);
    struct PoolCell(UnsafeCell<TablePool>);

    // SAFETY: single CPU; both cells are only touched through the Kernel
    // value's interrupt-disabling lock after `take()` hands them out once.
    unsafe impl Sync for DirCell {}
    unsafe impl Sync for PoolCell {}

    static KERNEL_DIR: DirCell = DirCell(UnsafeCell::new(PageDirectory::ZERO));
    static KERNEL_POOL: PoolCell = PoolCell(UnsafeCell::new(TablePool::ZERO));

    /// Hand out the kernel address-space view.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, from the boot sequencer, before
    /// interrupts are enabled.
    pub unsafe fn take() -> Mmu<'static> {
        // SAFETY: per the function contract there is exactly one caller,
        // so these are the only live references to the statics.
        unsafe { Mmu::new(&mut *KERNEL_DIR.0.get(), &mut *KERNEL_POOL.0.get()) }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use storage::take as take_kernel_space;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{alloc::alloc_zeroed, boxed::Box};
    use core::alloc::Layout;

    use super::*;

    fn new_env() -> (Box<PageDirectory>, Box<TablePool>) {
        // SAFETY: both types are plain arrays of integers for which the
        // all-zero bit pattern is a valid (fully absent) value.
        unsafe {
            let dir = Box::from_raw(alloc_zeroed(Layout::new::<PageDirectory>()) as *mut PageDirectory);
            let pool = Box::from_raw(alloc_zeroed(Layout::new::<TablePool>()) as *mut TablePool);
            (dir, pool)
        }
    }

    #[test]
    fn map_then_translate_then_unmap() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);

        let v = VirtAddr::new(0x0040_3000);
        let p = PhysAddr::new(0x0012_3000);
        mmu.map_page(v, p, PageFlags::KERNEL_RW).unwrap();

        assert!(mmu.is_mapped(v));
        assert_eq!(mmu.virt_to_phys(v), Some(p));
        assert_eq!(
            mmu.virt_to_phys(VirtAddr::new(0x0040_3ABC)),
            Some(PhysAddr::new(0x0012_3ABC))
        );

        mmu.unmap_page(v).unwrap();
        assert!(!mmu.is_mapped(v));
        assert_eq!(mmu.virt_to_phys(v), None);
    }

    #[test]
    fn remap_same_frame_is_idempotent() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);

        let v = VirtAddr::new(0x0100_0000);
        let p = PhysAddr::new(0x0020_0000);
        mmu.map_page(v, p, PageFlags::KERNEL_RW).unwrap();
        mmu.map_page(v, p, PageFlags::KERNEL_RW).unwrap();

        let conflict = mmu.map_page(v, PhysAddr::new(0x0030_0000), PageFlags::KERNEL_RW);
        assert!(matches!(
            conflict,
            Err(crate::KernelError::Mm(MmError::MappingConflict { .. }))
        ));
    }

    #[test]
    fn region_map_crosses_directory_boundary() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);

        // 4 pages straddling the 4 MiB line between directory slots 0 and 1.
        let v = VirtAddr::new(0x003F_E000);
        let p = PhysAddr::new(0x0100_0000);
        mmu.map_region(v, p, 4 * PAGE_SIZE, PageFlags::KERNEL_RW).unwrap();

        for i in 0..4u32 {
            let vi = VirtAddr::new(0x003F_E000 + i * PAGE_SIZE as u32);
            assert_eq!(
                mmu.virt_to_phys(vi),
                Some(PhysAddr::new(0x0100_0000 + i * PAGE_SIZE as u32))
            );
        }
        assert!(dir.entries[0].is_present());
        assert!(dir.entries[1].is_present());
    }

    #[test]
    fn region_map_is_all_or_nothing() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);

        // Pre-occupy the middle page with a different frame.
        let clash = VirtAddr::new(0x0200_1000);
        mmu.map_page(clash, PhysAddr::new(0x0BAD_0000), PageFlags::KERNEL_RW)
            .unwrap();

        let res = mmu.map_region(
            VirtAddr::new(0x0200_0000),
            PhysAddr::new(0x0050_0000),
            3 * PAGE_SIZE,
            PageFlags::KERNEL_RW,
        );
        assert!(res.is_err());
        // Nothing from the failed region landed.
        assert!(!mmu.is_mapped(VirtAddr::new(0x0200_0000)));
        assert!(!mmu.is_mapped(VirtAddr::new(0x0200_2000)));
        assert_eq!(
            mmu.virt_to_phys(clash),
            Some(PhysAddr::new(0x0BAD_0000))
        );
    }

    #[test]
    fn large_pages_translate_and_refuse_split() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);

        let v = VirtAddr::new(0x0080_0000);
        let p = PhysAddr::new(0x0400_0000);
        mmu.map_large_page(v, p, PageFlags::KERNEL_RW).unwrap();

        assert_eq!(
            mmu.virt_to_phys(VirtAddr::new(0x0080_0000 + 0x12_3456)),
            Some(PhysAddr::new(0x0400_0000 + 0x12_3456))
        );
        assert!(matches!(
            mmu.unmap_page(VirtAddr::new(0x0080_1000)),
            Err(crate::KernelError::Mm(MmError::LargePageSplit { .. }))
        ));
    }

    #[test]
    fn is_mapped_agrees_with_translate() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);
        let v = VirtAddr::new(0x0333_0000);
        assert_eq!(mmu.is_mapped(v), mmu.virt_to_phys(v).is_some());
        mmu.map_page(v, PhysAddr::new(0x0044_0000), PageFlags::KERNEL_RW)
            .unwrap();
        assert_eq!(mmu.is_mapped(v), mmu.virt_to_phys(v).is_some());
        assert!(mmu.is_mapped(v));
    }

    #[test]
    fn direct_map_window_reuses_and_falls_back() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);

        let phys = PhysAddr::new(0x0070_0000);
        let first = mmu.ensure_physical_accessible(phys, 2 * PAGE_SIZE).unwrap();
        assert_eq!(first.as_u32(), KERNEL_VIRTUAL_BASE + 0x0070_0000);
        // Second call reuses the existing mapping.
        let again = mmu.ensure_physical_accessible(phys, 2 * PAGE_SIZE).unwrap();
        assert_eq!(again, first);

        // Occupy the primary window for another frame; the alternate
        // window must be chosen.
        let other = PhysAddr::new(0x0080_0000);
        mmu.map_page(
            VirtAddr::new(KERNEL_VIRTUAL_BASE + other.as_u32()),
            PhysAddr::new(0x0666_0000),
            PageFlags::KERNEL_RW,
        )
        .unwrap();
        let alt = mmu.ensure_physical_accessible(other, PAGE_SIZE).unwrap();
        assert_eq!(alt.as_u32(), ALT_WINDOW_BASE + other.as_u32());
    }

    #[test]
    fn window_wraps_for_high_mmio() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);

        // A framebuffer-like region near the top of physical space wraps
        // into the kernel half instead of landing in user territory.
        let fb = PhysAddr::new(0xFD00_0000);
        let virt = mmu.ensure_physical_accessible(fb, PAGE_SIZE).unwrap();
        assert_eq!(virt.as_u32(), KERNEL_VIRTUAL_BASE.wrapping_add(0xFD00_0000));
        assert!((virt.as_u32() >> 22) < KERNEL_DIR_ENTRIES as u32);
        assert_eq!(mmu.virt_to_phys(virt), Some(fb));
    }

    #[test]
    fn kernel_half_is_copied() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);
        mmu.map_page(
            VirtAddr::new(0x0010_0000),
            PhysAddr::new(0x0010_0000),
            PageFlags::KERNEL_RW,
        )
        .unwrap();

        let (mut user_dir, _user_pool) = new_env();
        mmu.copy_kernel_mappings(&mut user_dir);
        assert_eq!(user_dir.entries[0], dir.entries[0]);
        assert_eq!(user_dir.entries[KERNEL_DIR_ENTRIES - 1], dir.entries[KERNEL_DIR_ENTRIES - 1]);
        // User half stays absent.
        assert!(!user_dir.entries[KERNEL_DIR_ENTRIES].is_present());
    }

    #[test]
    fn set_flags_keeps_frame() {
        let (mut dir, mut pool) = new_env();
        let mut mmu = Mmu::new(&mut dir, &mut pool);
        let v = VirtAddr::new(0x0500_0000);
        let p = PhysAddr::new(0x0060_0000);
        mmu.map_page(v, p, PageFlags::KERNEL_RW).unwrap();
        mmu.set_flags(v, PageFlags::KERNEL_RW | PageFlags::CACHE_DISABLE | PageFlags::WRITETHROUGH)
            .unwrap();
        assert_eq!(mmu.virt_to_phys(v), Some(p));
    }
}
