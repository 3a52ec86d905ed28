//! Polled 16550 transmit path on COM1.
//!
//! This is not a serial driver; it is the log sink. There is no receive
//! side and no public device surface beyond `_print`.

use core::fmt::{self, Write};

use lazy_static::lazy_static;

use super::port::{port_in8, port_out8};
use crate::sync::IrqLock;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// Program 115200 baud, 8N1, FIFOs on.
    fn init(base: u16) -> Self {
        // SAFETY: standard 16550 bring-up sequence on the COM1 block.
        unsafe {
            port_out8(base + 1, 0x00); // mask UART interrupts
            port_out8(base + 3, 0x80); // DLAB on
            port_out8(base, 0x01); // divisor 1 -> 115200
            port_out8(base + 1, 0x00);
            port_out8(base + 3, 0x03); // 8N1, DLAB off
            port_out8(base + 2, 0xC7); // FIFO on, clear, 14-byte threshold
            port_out8(base + 4, 0x0B); // DTR | RTS | OUT2
        }
        Self { base }
    }

    fn write_byte(&mut self, byte: u8) {
        // SAFETY: polls LSR then writes THR on our own port block.
        unsafe {
            while port_in8(self.base + 5) & 0x20 == 0 {
                core::hint::spin_loop();
            }
            port_out8(self.base, byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

lazy_static! {
    static ref CONSOLE: IrqLock<SerialPort> = IrqLock::new(SerialPort::init(COM1));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // The IrqLock keeps an ISR from deadlocking against a half-written
    // line.
    let _ = CONSOLE.lock().write_fmt(args);
}
