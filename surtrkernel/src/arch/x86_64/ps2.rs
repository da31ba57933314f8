// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! Minimal PS/2 keyboard bring-up: flush the controller, enable scanning.
//! Hardware is assumed correct, so there are no timeouts here.

use x86_64::instructions::port::Port;

const PORT_DATA: u16 = 0x60;
const PORT_STATUS: u16 = 0x64;
const STATUS_OUTPUT_FULL: u8 = 1 << 0;
const STATUS_INPUT_FULL: u8 = 1 << 1;
const CMD_ENABLE_SCANNING: u8 = 0xF4;
const ACK: u8 = 0xFA;

pub fn init() {
    let mut data = Port::<u8>::new(PORT_DATA);
    let mut status = Port::<u8>::new(PORT_STATUS);
    unsafe {
        // Drop whatever the controller buffered during boot.
        while status.read() & STATUS_OUTPUT_FULL != 0 {
            let _: u8 = data.read();
        }
        while status.read() & STATUS_INPUT_FULL != 0 {
            core::hint::spin_loop();
        }
        data.write(CMD_ENABLE_SCANNING);
        loop {
            if status.read() & STATUS_OUTPUT_FULL != 0 && data.read() == ACK {
                break;
            }
        }
    }
}

pub fn read_scancode() -> u8 {
    unsafe { Port::<u8>::new(PORT_DATA).read() }
}
