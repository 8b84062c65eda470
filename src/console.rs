//! Console output for the SegOS kernel
//!
//! Provides the text sink behind `print!`/`println!` and the standard
//! stream file descriptors. Kernel builds write to the VGA text buffer;
//! test builds capture into a buffer so output can be asserted on.

use core::fmt::{self, Write};
use spin::Mutex;

/// VGA text buffer geometry
const VGA_BUFFER: usize = 0xB8000;
const VGA_COLS: usize = 80;
const VGA_ROWS: usize = 25;

/// White on black
const VGA_ATTR: u8 = 0x07;

/// Console writer interface
pub struct Console {
    col: usize,
    row: usize,
    #[cfg(test)]
    buffer: heapless::String<4096>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            col: 0,
            row: 0,
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(not(test))]
        {
            if byte == b'\n' {
                self.newline();
                return;
            }
            let offset = (self.row * VGA_COLS + self.col) * 2;
            unsafe {
                let cell = (VGA_BUFFER + offset) as *mut u8;
                cell.write_volatile(byte);
                cell.add(1).write_volatile(VGA_ATTR);
            }
            self.col += 1;
            if self.col >= VGA_COLS {
                self.newline();
            }
        }
    }

    #[cfg(not(test))]
    fn newline(&mut self) {
        self.col = 0;
        self.row += 1;
        if self.row >= VGA_ROWS {
            // Scroll one line up and clear the last row
            unsafe {
                let base = VGA_BUFFER as *mut u8;
                core::ptr::copy(base.add(VGA_COLS * 2), base, (VGA_ROWS - 1) * VGA_COLS * 2);
                for col in 0..VGA_COLS {
                    let cell = base.add(((VGA_ROWS - 1) * VGA_COLS + col) * 2);
                    cell.write_volatile(b' ');
                    cell.add(1).write_volatile(VGA_ATTR);
                }
            }
            self.row = VGA_ROWS - 1;
        }
    }

    /// Write raw bytes, used by the write(2) path for the standard streams
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        for &b in bytes {
            self.write_byte(b);
        }
        bytes.len()
    }

    /// Drain the captured output (test builds only)
    #[cfg(test)]
    pub fn take_output(&mut self) -> heapless::String<4096> {
        core::mem::take(&mut self.buffer)
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Serializes tests that assert on the shared capture buffer
#[cfg(test)]
pub static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// Initialize the console (clears position state)
pub fn init() {
    let mut con = CONSOLE.lock();
    con.col = 0;
    con.row = 0;
}

/// Access the global console
pub fn with_console<R>(f: impl FnOnce(&mut Console) -> R) -> R {
    f(&mut CONSOLE.lock())
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_bytes_in_order() {
        let mut con = Console::new();
        con.write_bytes(b"boot ok");
        assert_eq!(con.take_output().as_str(), "boot ok");
    }

    #[test]
    fn write_str_appends() {
        let mut con = Console::new();
        let _ = con.write_str("a");
        let _ = con.write_str("b\n");
        assert_eq!(con.take_output().as_str(), "ab\n");
    }
}
