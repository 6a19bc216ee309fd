//! 16550 UART driver for the COM1 serial port.
//!
//! Serial is the kernel's most reliable output channel: it works from the
//! first instruction of `_start`, needs no framebuffer, and QEMU can tee it
//! to a file. All logging goes through here.

use core::fmt;

use x86_64::instructions::port::Port;

use crate::sync::spinlock::SpinLock;

/// I/O port base for COM1.
const COM1_BASE: u16 = 0x3F8;

/// The global COM1 port, shared by the logger.
pub static SERIAL: SpinLock<SerialPort> = SpinLock::new(SerialPort::new(COM1_BASE));

/// A 16550-compatible UART addressed through x86 I/O ports.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Programs the UART: 115200 baud, 8 data bits, no parity, one stop
    /// bit, FIFOs enabled.
    pub fn init(&mut self) {
        unsafe {
            Port::<u8>::new(self.base + 1).write(0x00); // disable UART interrupts
            Port::<u8>::new(self.base + 3).write(0x80); // DLAB on
            Port::<u8>::new(self.base).write(0x01); // divisor low: 115200 baud
            Port::<u8>::new(self.base + 1).write(0x00); // divisor high
            Port::<u8>::new(self.base + 3).write(0x03); // 8n1, DLAB off
            Port::<u8>::new(self.base + 2).write(0xC7); // FIFO on, 14-byte threshold
            Port::<u8>::new(self.base + 4).write(0x0B); // DTR | RTS | OUT2
        }
    }

    fn transmit_ready(&mut self) -> bool {
        // Line status register, bit 5: transmitter holding register empty.
        unsafe { Port::<u8>::new(self.base + 5).read() & 0x20 != 0 }
    }

    /// Writes one byte, busy-waiting for the transmitter to drain.
    pub fn write_byte(&mut self, byte: u8) {
        while !self.transmit_ready() {
            core::hint::spin_loop();
        }
        unsafe { Port::<u8>::new(self.base).write(byte) };
    }
}

impl fmt::Write for SerialPort {
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
