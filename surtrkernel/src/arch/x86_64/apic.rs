// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! Local APIC access: spurious-vector enable, EOI, the interrupt command
//! register for INIT/SIPI, and the one-shot/periodic timer. The window must
//! be identity-mapped cache-disabled before anything here runs.

use core::sync::atomic::{AtomicU64, Ordering};
use surtrcore::acpi::DEFAULT_LAPIC_BASE;
use x86_64::instructions::port::Port;

const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_SVR: u32 = 0x0F0;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_INIT_COUNT: u32 = 0x380;
const REG_CURRENT_COUNT: u32 = 0x390;
const REG_DIVIDE: u32 = 0x3E0;

const SVR_APIC_ENABLE: u32 = 1 << 8;
const SPURIOUS_VECTOR: u32 = 0xFF;
const LVT_MASKED: u32 = 1 << 16;
const LVT_PERIODIC: u32 = 1 << 17;
const DIVIDE_BY_1: u32 = 0xB;

const ICR_INIT: u32 = 0x0000_4500;
const ICR_STARTUP: u32 = 0x0000_4600;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(DEFAULT_LAPIC_BASE);

fn read(reg: u32) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::read_volatile((base + reg as u64) as *const u32) }
}

fn write(reg: u32, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::write_volatile((base + reg as u64) as *mut u32, value) }
}

/// Mask the legacy PIC and software-enable the local APIC.
pub fn init(base: u64) {
    LAPIC_BASE.store(base, Ordering::Relaxed);
    unsafe {
        Port::<u8>::new(0x21).write(0xFFu8);
        Port::<u8>::new(0xA1).write(0xFFu8);
    }
    write(REG_SVR, SVR_APIC_ENABLE | SPURIOUS_VECTOR);
}

pub fn lapic_id() -> u32 {
    (read(REG_ID) >> 24) & 0xFF
}

pub fn eoi() {
    write(REG_EOI, 0);
}

fn wait_delivery() {
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

pub fn send_init(apic_id: u32) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, ICR_INIT);
    wait_delivery();
}

pub fn send_startup(apic_id: u32, vector: u8) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, ICR_STARTUP | vector as u32);
    wait_delivery();
}

/// Arm the timer at its maximum count, masked, so the PIT can measure how
/// fast it drains.
pub fn begin_timer_calibration() {
    write(REG_DIVIDE, DIVIDE_BY_1);
    write(REG_LVT_TIMER, LVT_MASKED);
    write(REG_INIT_COUNT, u32::MAX);
}

/// Ticks consumed since `begin_timer_calibration`.
pub fn timer_elapsed() -> u32 {
    u32::MAX - read(REG_CURRENT_COUNT)
}

pub fn start_timer_periodic(vector: u8, initial: u32) {
    write(REG_DIVIDE, DIVIDE_BY_1);
    write(REG_LVT_TIMER, LVT_PERIODIC | vector as u32);
    write(REG_INIT_COUNT, initial.max(1));
}
