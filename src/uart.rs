//! PL011 UART console and `log` backend
//!
//! Base address: `platform::UART_BASE` (QEMU virt). On anything other than
//! bare-metal aarch64 the register accesses compile to nothing, so the
//! writer and logger are inert in host builds.

use core::fmt;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::platform::UART_BASE;

/// PL011 registers
const UART_DR: usize = 0x00; // Data Register
const UART_FR: usize = 0x18; // Flag Register

/// Flag Register bits
const UART_FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

/// UART device structure
pub struct Uart {
    base: usize,
}

impl Uart {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Write a byte to the UART
    pub fn putc(&self, c: u8) {
        // Wait until TX FIFO is not full
        while self.read_reg(UART_FR) & UART_FR_TXFF != 0 {}
        self.write_reg(UART_DR, c as u32);
    }

    /// Write a string, expanding `\n` to `\r\n`
    pub fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    #[inline]
    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    #[inline]
    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    fn read_reg(&self, _offset: usize) -> u32 {
        let _ = self.base;
        0
    }

    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    fn write_reg(&self, _offset: usize, _value: u32) {}
}

/// Global UART instance
static UART: Uart = Uart::new(UART_BASE);

/// Print macro (without newline)
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::uart::writer(), $($arg)*);
    }};
}

/// Println macro (with newline)
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::uart::writer(), $($arg)*);
    }};
}

/// Get a writer for the UART
pub fn writer() -> UartWriter {
    UartWriter
}

/// Writer wrapper for formatting
pub struct UartWriter;

impl fmt::Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        UART.puts(s);
        Ok(())
    }
}

/// `log` backend writing `[LEVEL target] message` lines to the UART.
pub struct UartLogger;

static LOGGER: UartLogger = UartLogger;

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        use core::fmt::Write;
        let _ = writeln!(writer(), "[{:<5} {}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the UART logger.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
