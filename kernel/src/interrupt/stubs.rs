//! Assembly interrupt stubs.
//!
//! Every vector gets a tiny stub that normalises the stack to one shape
//! (error code present, vector number pushed) and jumps to the common
//! prologue, which saves the register frame, switches to kernel data
//! segments, and calls `isr_handler`. Vectors 8, 10-14, 17 and 30 push a
//! CPU error code; the rest get a zero placeholder.

use crate::arch::x86::gdt::selectors;

// The stub bodies and the address table. `.altmacro`-free: two plain
// macros and explicit instantiation keep the listing greppable.
core::arch::global_asm!(
    r".macro isr_noerr vec",
    r"    .global isr_stub_\vec",
    r"isr_stub_\vec:",
    r"    push 0",
    r"    push \vec",
    r"    jmp isr_common",
    r".endm",
    r".macro isr_err vec",
    r"    .global isr_stub_\vec",
    r"isr_stub_\vec:",
    r"    push \vec",
    r"    jmp isr_common",
    r".endm",
    // CPU exceptions 0..31.
    r"isr_noerr 0",
    r"isr_noerr 1",
    r"isr_noerr 2",
    r"isr_noerr 3",
    r"isr_noerr 4",
    r"isr_noerr 5",
    r"isr_noerr 6",
    r"isr_noerr 7",
    r"isr_err   8",
    r"isr_noerr 9",
    r"isr_err   10",
    r"isr_err   11",
    r"isr_err   12",
    r"isr_err   13",
    r"isr_err   14",
    r"isr_noerr 15",
    r"isr_noerr 16",
    r"isr_err   17",
    r"isr_noerr 18",
    r"isr_noerr 19",
    r"isr_noerr 20",
    r"isr_noerr 21",
    r"isr_noerr 22",
    r"isr_noerr 23",
    r"isr_noerr 24",
    r"isr_noerr 25",
    r"isr_noerr 26",
    r"isr_noerr 27",
    r"isr_noerr 28",
    r"isr_noerr 29",
    r"isr_err   30",
    r"isr_noerr 31",
    // Hardware IRQs 0..15 on vectors 32..47.
    r"isr_noerr 32",
    r"isr_noerr 33",
    r"isr_noerr 34",
    r"isr_noerr 35",
    r"isr_noerr 36",
    r"isr_noerr 37",
    r"isr_noerr 38",
    r"isr_noerr 39",
    r"isr_noerr 40",
    r"isr_noerr 41",
    r"isr_noerr 42",
    r"isr_noerr 43",
    r"isr_noerr 44",
    r"isr_noerr 45",
    r"isr_noerr 46",
    r"isr_noerr 47",
    // The syscall trap.
    r"isr_noerr 128",
    // Common prologue/epilogue around the Rust dispatcher. The pushes
    // build the `Regs` frame bottom-up; kernel data segments are live
    // before any Rust code runs.
    "isr_common:",
    "    pusha",
    "    push ds",
    "    push es",
    "    push fs",
    "    push gs",
    "    mov ax, {kdata}",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    "    push esp",
    "    call isr_handler",
    "    add esp, 4",
    "    pop gs",
    "    pop fs",
    "    pop es",
    "    pop ds",
    "    popa",
    "    add esp, 8",
    "    iretd",
    // The address table the IDT is filled from: 0..47, then 0x80.
    r".section .rodata",
    r".global isr_stub_table",
    r".balign 4",
    r"isr_stub_table:",
    r"    .long isr_stub_0,  isr_stub_1,  isr_stub_2,  isr_stub_3",
    r"    .long isr_stub_4,  isr_stub_5,  isr_stub_6,  isr_stub_7",
    r"    .long isr_stub_8,  isr_stub_9,  isr_stub_10, isr_stub_11",
    r"    .long isr_stub_12, isr_stub_13, isr_stub_14, isr_stub_15",
    r"    .long isr_stub_16, isr_stub_17, isr_stub_18, isr_stub_19",
    r"    .long isr_stub_20, isr_stub_21, isr_stub_22, isr_stub_23",
    r"    .long isr_stub_24, isr_stub_25, isr_stub_26, isr_stub_27",
    r"    .long isr_stub_28, isr_stub_29, isr_stub_30, isr_stub_31",
    r"    .long isr_stub_32, isr_stub_33, isr_stub_34, isr_stub_35",
    r"    .long isr_stub_36, isr_stub_37, isr_stub_38, isr_stub_39",
    r"    .long isr_stub_40, isr_stub_41, isr_stub_42, isr_stub_43",
    r"    .long isr_stub_44, isr_stub_45, isr_stub_46, isr_stub_47",
    r"    .long isr_stub_128",
    r".text",
    kdata = const selectors::KERNEL_DATA,
);

#[allow(non_upper_case_globals)]
extern "C" {
    /// 49 stub addresses: vectors 0..47 in order, then 0x80 at index 48.
    static isr_stub_table: [u32; 49];
}

/// Address of the stub at `index` in the table (0..47 = that vector,
/// 48 = the 0x80 trap).
pub fn stub_address(index: usize) -> u32 {
    // SAFETY: the table is a link-time constant array of code addresses.
    unsafe { isr_stub_table[index] }
}
