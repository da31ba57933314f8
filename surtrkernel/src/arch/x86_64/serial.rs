// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! COM1 diagnostics sink. Every byte leaves through [`send`], so the
//! newline fold happens in exactly one place whether the caller is a
//! format macro, a job printing its result, or the panic path.

use core::fmt::{self, Write};
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts::without_interrupts;
use x86_64::instructions::port::Port;

const COM1_BASE: u16 = 0x3F8;

static COM1: Mutex<Option<SerialPort>> = Mutex::new(None);

pub fn init() {
    let mut port = unsafe { SerialPort::new(COM1_BASE) };
    port.init();
    // 38400 8-N-1. The UART's own interrupts stay masked: there is no IDT
    // yet, and nothing ever services them later either.
    unsafe { Port::<u8>::new(COM1_BASE + 1).write(0u8) };
    *COM1.lock() = Some(port);
}

// Bare '\n' becomes CRLF on the wire.
fn send(port: &mut SerialPort, byte: u8) {
    if byte == b'\n' {
        port.send(b'\r');
    }
    port.send(byte);
}

/// The byte-oriented sink handed to collaborators for raw diagnostics.
pub fn write_byte(byte: u8) {
    without_interrupts(|| {
        if let Some(port) = &mut *COM1.lock() {
            send(port, byte);
        }
    });
}

/// Format-macro backend. Interrupts are held off for the whole write so a
/// timer or keyboard handler cannot re-enter the port lock mid-line.
pub fn _print(args: fmt::Arguments) {
    struct Sink<'a>(&'a mut SerialPort);

    impl fmt::Write for Sink<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                send(self.0, byte);
            }
            Ok(())
        }
    }

    without_interrupts(|| {
        if let Some(port) = &mut *COM1.lock() {
            let _ = Sink(port).write_fmt(args);
        }
    });
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::arch::x86_64::serial::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::println!("") };
    ($($arg:tt)*) => {
        // One sink call per line: the newline rides along with the payload.
        $crate::arch::x86_64::serial::_print(
            core::format_args!("{}\n", core::format_args!($($arg)*)),
        )
    };
}
