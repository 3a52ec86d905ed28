//! The panic screen.
//!
//! Kernel-fatal faults and Rust panics end here: the framebuffer is
//! flooded, the exception name, error code, EIP, and up to five return
//! addresses (walked over saved EBP frames) are rendered, everything is
//! mirrored to the serial console, and the CPU parks in a cli/hlt loop.

/// Maximum stack frames walked via saved EBP.
pub const MAX_BACKTRACE: usize = 5;

/// Walk an EBP chain, reading memory through `read` (which returns
/// `None` for unreadable addresses). Returns the captured return
/// addresses. The chain stops on null, misaligned, non-monotonic, or
/// unreadable frame pointers.
pub fn walk_frame_pointers(
    mut ebp: u32,
    mut read: impl FnMut(u32) -> Option<u32>,
) -> ([u32; MAX_BACKTRACE], usize) {
    let mut frames = [0u32; MAX_BACKTRACE];
    let mut count = 0;

    while count < MAX_BACKTRACE {
        if ebp == 0 || ebp % 4 != 0 || ebp >= u32::MAX - 8 {
            break;
        }
        let Some(ret) = read(ebp.wrapping_add(4)) else {
            break;
        };
        if ret == 0 {
            break;
        }
        frames[count] = ret;
        count += 1;

        let Some(next) = read(ebp) else { break };
        // Stacks grow down, so saved frame pointers must increase.
        if next <= ebp {
            break;
        }
        ebp = next;
    }
    (frames, count)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod screen {
    use noto_sans_mono_bitmap::{get_raster, get_raster_width, FontWeight, RasterHeight};

    use super::{walk_frame_pointers, MAX_BACKTRACE};
    use crate::{
        arch::x86::cpu,
        framebuffer::{self, FramebufferInfo},
        interrupt::{faults::EXCEPTION_NAMES, Regs},
        kernel,
    };

    const RASTER_HEIGHT: RasterHeight = RasterHeight::Size20;
    const FONT_WEIGHT: FontWeight = FontWeight::Regular;

    const BACKGROUND: u32 = 0x00_7A_00_00;
    const FOREGROUND: u32 = 0x00_FF_FF_FF;

    struct ScreenWriter {
        fb: FramebufferInfo,
        col: u32,
        row: u32,
    }

    impl ScreenWriter {
        fn glyph_width() -> u32 {
            get_raster_width(FONT_WEIGHT, RASTER_HEIGHT) as u32
        }

        fn draw_char(&mut self, c: char) {
            if c == '\n' {
                self.col = 0;
                self.row += 1;
                return;
            }
            let raster = match get_raster(c, FONT_WEIGHT, RASTER_HEIGHT) {
                Some(r) => r,
                None => return,
            };
            let x0 = 8 + self.col * Self::glyph_width();
            let y0 = 8 + self.row * RASTER_HEIGHT.val() as u32;
            for (dy, line) in raster.raster().iter().enumerate() {
                for (dx, intensity) in line.iter().enumerate() {
                    if *intensity > 32 {
                        self.fb.put_pixel(x0 + dx as u32, y0 + dy as u32, FOREGROUND);
                    }
                }
            }
            self.col += 1;
        }
    }

    impl core::fmt::Write for ScreenWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for c in s.chars() {
                self.draw_char(c);
            }
            Ok(())
        }
    }

    /// Read a stack dword if the kernel space maps it.
    fn read_mapped(addr: u32) -> Option<u32> {
        let mapped = kernel::try_kernel()
            .map(|k| k.mmu.lock().is_mapped(crate::mm::VirtAddr::new(addr)))
            .unwrap_or(false);
        if !mapped {
            return None;
        }
        // SAFETY: the MMU just confirmed the address is mapped.
        Some(unsafe { core::ptr::read_volatile(addr as *const u32) })
    }

    /// Render the terminal fault report and halt. Never returns.
    pub fn exception_panic(regs: &Regs) -> ! {
        let name = EXCEPTION_NAMES
            .get(regs.vector as usize)
            .copied()
            .unwrap_or("unknown");
        let (frames, depth) = walk_frame_pointers(regs.ebp, read_mapped);

        // Serial first: it survives even a broken framebuffer.
        crate::println!();
        crate::println!("KERNEL PANIC: {} (vector {})", name, regs.vector);
        crate::println!(
            "  err={:#010x} eip={:#010x} cs={:#06x} eflags={:#010x}",
            regs.err_code,
            regs.eip,
            regs.cs,
            regs.eflags
        );
        if regs.vector == 14 {
            crate::println!("  cr2={:#010x}", cpu::read_cr2());
        }
        for frame in frames.iter().take(depth) {
            crate::println!("  <- {:#010x}", frame);
        }

        if let Some(fb) = framebuffer::get() {
            fb.fill(BACKGROUND);
            let mut w = ScreenWriter { fb, col: 0, row: 0 };
            use core::fmt::Write;
            let _ = writeln!(w, "KERNEL PANIC");
            let _ = writeln!(w, "{} (vector {})", name, regs.vector);
            let _ = writeln!(w, "error {:#010x}", regs.err_code);
            let _ = writeln!(w, "eip   {:#010x}", regs.eip);
            let _ = writeln!(w, "stack:");
            for frame in frames.iter().take(depth.min(MAX_BACKTRACE)) {
                let _ = writeln!(w, "  <- {:#010x}", frame);
            }
        }

        cpu::halt_forever();
    }

    /// Rust panic entry: same surface, sourced from `panic!` metadata.
    pub fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        crate::println!();
        crate::println!("KERNEL PANIC: {}", info);

        if let Some(fb) = framebuffer::get() {
            fb.fill(BACKGROUND);
            let mut w = ScreenWriter { fb, col: 0, row: 0 };
            use core::fmt::Write;
            let _ = writeln!(w, "KERNEL PANIC");
            if let Some(location) = info.location() {
                let _ = writeln!(w, "{}:{}", location.file(), location.line());
            }
        }

        cpu::halt_forever();
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use screen::{exception_panic, rust_panic};

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rust_panic(info)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::vec::Vec;

    fn memory(frames: &[(u32, u32, u32)]) -> HashMap<u32, u32> {
        // Each tuple: (ebp, saved_next_ebp, return_address).
        let mut m = HashMap::new();
        for (ebp, next, ret) in frames {
            m.insert(*ebp, *next);
            m.insert(ebp + 4, *ret);
        }
        m
    }

    #[test]
    fn walks_well_formed_chain() {
        let mem = memory(&[
            (0x9000, 0x9100, 0x40_1000),
            (0x9100, 0x9200, 0x40_2000),
            (0x9200, 0, 0x40_3000),
        ]);
        let (frames, n) = walk_frame_pointers(0x9000, |a| mem.get(&a).copied());
        assert_eq!(n, 3);
        assert_eq!(&frames[..3], &[0x40_1000, 0x40_2000, 0x40_3000]);
    }

    #[test]
    fn stops_at_five_frames() {
        let chain: Vec<(u32, u32, u32)> = (0..10)
            .map(|i| (0x9000 + i * 0x100, 0x9000 + (i + 1) * 0x100, 0x40_0000 + i))
            .collect();
        let mem = memory(&chain);
        let (_, n) = walk_frame_pointers(0x9000, |a| mem.get(&a).copied());
        assert_eq!(n, MAX_BACKTRACE);
    }

    #[test]
    fn rejects_bad_frame_pointers() {
        let (_, n) = walk_frame_pointers(0, |_| Some(0));
        assert_eq!(n, 0);

        let (_, n) = walk_frame_pointers(0x9002, |_| Some(0x40_0000)); // misaligned
        assert_eq!(n, 0);

        // A cycle (next <= ebp) terminates after one frame.
        let mem = memory(&[(0x9000, 0x9000, 0x40_1000)]);
        let (_, n) = walk_frame_pointers(0x9000, |a| mem.get(&a).copied());
        assert_eq!(n, 1);

        // Unreadable memory terminates immediately.
        let (_, n) = walk_frame_pointers(0x9000, |_| None);
        assert_eq!(n, 0);
    }
}
