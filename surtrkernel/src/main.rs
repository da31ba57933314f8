// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
#![no_std]
#![no_main]

mod arch;
mod boot;
mod kernel;
mod panic;

use log::info;
use uefi::prelude::*;

use crate::arch::x86_64::{logger, serial};

#[entry]
fn main() -> Status {
    serial::init();
    logger::init();
    info!("surtr: efi_main");

    let framebuffer = match boot::locate_framebuffer() {
        Ok(fb) => fb,
        Err(status) => return status,
    };
    let madt = match boot::discover_platform() {
        Ok(m) => m,
        Err(status) => return status,
    };

    // Point of no return: firmware services end here.
    let firmware_map = boot::exit_boot_services();
    kernel::start(framebuffer, firmware_map, madt)
}
