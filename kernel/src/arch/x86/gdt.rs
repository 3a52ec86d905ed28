//! Global descriptor table.
//!
//! The selector values live here and nowhere else; the context-switch
//! assembly, the IDT gates, and the fault dispatcher all pull from this
//! table instead of repeating `0x08`/`0x10` literals.

/// Segment selectors, fixed by the GDT layout below.
pub mod selectors {
    /// Ring-0 flat code segment.
    pub const KERNEL_CODE: u16 = 0x08;
    /// Ring-0 flat data segment.
    pub const KERNEL_DATA: u16 = 0x10;
    /// Ring-3 flat code segment (RPL 3).
    pub const USER_CODE: u16 = 0x18 | 3;
    /// Ring-3 flat data segment (RPL 3).
    pub const USER_DATA: u16 = 0x20 | 3;

    /// Requested-privilege-level mask of a selector.
    pub const RPL_MASK: u16 = 0x3;
}

/// Build one 8-byte flat 4 GiB descriptor. `access` is the standard
/// access byte (present, DPL, type); granularity is fixed to 4 KiB with
/// 32-bit operands.
const fn flat_descriptor(access: u8) -> u64 {
    let limit_low = 0xFFFFu64;
    let limit_high_flags = 0xCFu64; // G=1, D=1, limit[19:16]=0xF
    (limit_low) | ((access as u64) << 40) | (limit_high_flags << 48)
}

/// The five-entry flat GDT: null, kernel code/data, user code/data.
pub const GDT: [u64; 5] = [
    0,
    flat_descriptor(0x9A), // kernel code: present, ring 0, execute/read
    flat_descriptor(0x92), // kernel data: present, ring 0, read/write
    flat_descriptor(0xFA), // user code: present, ring 3, execute/read
    flat_descriptor(0xF2), // user data: present, ring 3, read/write
];

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod load {
    use core::arch::asm;

    use super::{selectors, GDT};

    #[repr(C, packed)]
    struct DescriptorPointer {
        limit: u16,
        base: u32,
    }

    /// Install the GDT and reload every segment register.
    ///
    /// # Safety
    ///
    /// Must run with interrupts disabled; replaces the active descriptor
    /// table out from under the CPU.
    pub unsafe fn init() {
        let pointer = DescriptorPointer {
            limit: (core::mem::size_of_val(&GDT) - 1) as u16,
            base: GDT.as_ptr() as u32,
        };
        // SAFETY: the table is 'static; the far return reloads CS with
        // the kernel code selector and the moves reload the data
        // segments, after which execution continues linearly.
        unsafe {
            asm!(
                "lgdt [{ptr}]",
                "push {code}",
                "lea {tmp}, [2f]",
                "push {tmp}",
                "retf",
                "2:",
                "mov ds, {data:x}",
                "mov es, {data:x}",
                "mov fs, {data:x}",
                "mov gs, {data:x}",
                "mov ss, {data:x}",
                ptr = in(reg) &pointer,
                code = const selectors::KERNEL_CODE as u32,
                data = in(reg) selectors::KERNEL_DATA as u32,
                tmp = out(reg) _,
            );
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use load::init;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_table_slots() {
        assert_eq!(selectors::KERNEL_CODE as usize / 8, 1);
        assert_eq!(selectors::KERNEL_DATA as usize / 8, 2);
        assert_eq!((selectors::USER_CODE & !selectors::RPL_MASK) as usize / 8, 3);
        assert_eq!((selectors::USER_DATA & !selectors::RPL_MASK) as usize / 8, 4);
        assert_eq!(selectors::USER_CODE & selectors::RPL_MASK, 3);
    }

    #[test]
    fn descriptors_are_flat_4gib() {
        // Kernel code: base 0, limit 0xFFFFF pages, access 0x9A.
        let code = GDT[1];
        assert_eq!(code & 0xFFFF, 0xFFFF); // limit low
        assert_eq!((code >> 40) & 0xFF, 0x9A); // access byte
        assert_eq!((code >> 48) & 0xFF, 0xCF); // flags + limit high
        assert_eq!((code >> 16) & 0xFF_FFFF, 0); // base low
    }
}
