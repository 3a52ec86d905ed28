//! Legacy 8259 programmable interrupt controller.

use super::port::{io_wait, port_in8, port_out8};

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

/// ICW4 will be present.
const ICW1_ICW4: u8 = 0x01;
/// Begin initialization.
const ICW1_INIT: u8 = 0x10;
/// Slave on IRQ line 2 (master side).
const ICW3_SLAVE_AT_2: u8 = 0x04;
/// Cascade identity (slave side).
const ICW3_CASCADE: u8 = 0x02;
/// 8086 mode.
const ICW4_8086: u8 = 0x01;
/// End-of-interrupt command.
const COMMAND_EOI: u8 = 0x20;
/// OCW3: read the in-service register.
const OCW3_READ_ISR: u8 = 0x0B;

/// Vector base for the master PIC after remap (IRQ 0 -> 32).
pub const REMAP_OFFSET: u8 = 0x20;

/// Remap both PICs so hardware IRQs land on vectors 32..47, clear of the
/// CPU exception range. This runs even when the APIC takes over, so the
/// legacy controller can never deliver a vector that collides with an
/// exception.
pub fn remap() {
    // SAFETY: standard 8259 initialization word sequence.
    unsafe {
        port_out8(MASTER_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        port_out8(SLAVE_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        port_out8(MASTER_DATA, REMAP_OFFSET);
        io_wait();
        port_out8(SLAVE_DATA, REMAP_OFFSET + 8);
        io_wait();
        port_out8(MASTER_DATA, ICW3_SLAVE_AT_2);
        io_wait();
        port_out8(SLAVE_DATA, ICW3_CASCADE);
        io_wait();
        port_out8(MASTER_DATA, ICW4_8086);
        io_wait();
        port_out8(SLAVE_DATA, ICW4_8086);
        io_wait();
    }
}

/// Program the interrupt masks directly. A set bit masks the line.
pub fn set_masks(master: u8, slave: u8) {
    // SAFETY: OCW1 writes to the data ports only change the mask.
    unsafe {
        port_out8(MASTER_DATA, master);
        port_out8(SLAVE_DATA, slave);
    }
}

/// Mask every line on both controllers (used when the APIC takes over).
pub fn mask_all() {
    set_masks(0xFF, 0xFF);
}

/// Unmask one IRQ line.
pub fn enable_irq(irq: u8) {
    let (port, bit) = if irq < 8 {
        (MASTER_DATA, irq)
    } else {
        (SLAVE_DATA, irq - 8)
    };
    // SAFETY: read-modify-write of the mask register.
    unsafe {
        let mask = port_in8(port) & !(1 << bit);
        port_out8(port, mask);
    }
}

/// Mask one IRQ line.
pub fn disable_irq(irq: u8) {
    let (port, bit) = if irq < 8 {
        (MASTER_DATA, irq)
    } else {
        (SLAVE_DATA, irq - 8)
    };
    // SAFETY: read-modify-write of the mask register.
    unsafe {
        let mask = port_in8(port) | (1 << bit);
        port_out8(port, mask);
    }
}

/// Whether an IRQ 7 / IRQ 15 delivery is spurious (not latched in the
/// in-service register).
pub fn is_spurious(irq: u8) -> bool {
    match irq {
        7 => {
            // SAFETY: OCW3 followed by a command-port read returns ISR.
            unsafe {
                port_out8(MASTER_COMMAND, OCW3_READ_ISR);
                port_in8(MASTER_COMMAND) & 0x80 == 0
            }
        }
        15 => {
            // SAFETY: as above, on the slave.
            unsafe {
                port_out8(SLAVE_COMMAND, OCW3_READ_ISR);
                port_in8(SLAVE_COMMAND) & 0x80 == 0
            }
        }
        _ => false,
    }
}

/// Signal end-of-interrupt for `irq`. A spurious IRQ 15 still needs the
/// master EOI for the cascade line.
pub fn end_of_interrupt(irq: u8) {
    // SAFETY: EOI writes to the command ports.
    unsafe {
        if irq >= 8 {
            port_out8(SLAVE_COMMAND, COMMAND_EOI);
        }
        port_out8(MASTER_COMMAND, COMMAND_EOI);
    }
}
