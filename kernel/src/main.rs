//! Bare-metal image entry: the Multiboot2 header, the boot stack, and
//! the `_start` shim that forwards the loader's registers to the boot
//! sequencer. On the host this binary is a stub so workspace builds and
//! `cargo test` work unmodified.

#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod image {
    use ember_kernel::boot;

    // The Multiboot2 header: magic, i386 architecture, a framebuffer
    // request (the loader may still hand back text mode; the tag is
    // marked optional), and the terminator.
    core::arch::global_asm!(
        r#".section .multiboot2_header, "a""#,
        ".balign 8",
        "mb2_header_start:",
        "    .long 0xE85250D6",
        "    .long 0",
        "    .long mb2_header_end - mb2_header_start",
        "    .long -(0xE85250D6 + (mb2_header_end - mb2_header_start))",
        ".balign 8",
        "mb2_fb_tag:",
        "    .word 5",
        "    .word 1",
        "    .long 20",
        "    .long 1024",
        "    .long 768",
        "    .long 32",
        ".balign 8",
        "    .word 0",
        "    .word 0",
        "    .long 8",
        "mb2_header_end:",
    );

    // Boot stack and entry shim. EAX carries the Multiboot2 magic, EBX
    // the physical address of the tag list; both become kmain's cdecl
    // arguments.
    core::arch::global_asm!(
        ".section .bss",
        ".balign 16",
        "boot_stack_bottom:",
        "    .skip 65536",
        "boot_stack_top:",
        ".section .text",
        ".global _start",
        "_start:",
        "    cli",
        "    lea esp, [boot_stack_top]",
        "    xor ebp, ebp",
        "    push ebx",
        "    push eax",
        "    call {kmain}",
        "2:",
        "    hlt",
        "    jmp 2b",
        kmain = sym boot::kmain,
    );
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    println!("ember-kernel is a bare-metal image; build with --target targets/i686-ember.json");
}
