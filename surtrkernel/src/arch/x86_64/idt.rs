// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! IDT setup. The bootstrap core populates exactly two gates, timer and
//! keyboard; everything else stays missing. Application processors load an
//! IDT with a zero limit so any stray interrupt triple-faults the machine
//! instead of being swallowed.
//!
//! The table is hand-rolled because the entry stubs carry their own
//! register/FXSAVE discipline and do not fit the crate's typed handler
//! signatures.

use core::mem::size_of;
use core::ptr::addr_of_mut;

use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::gdt;
use super::isr;

pub const TIMER_VECTOR: u8 = 32;
pub const KEYBOARD_VECTOR: u8 = 33;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,  // bits 0..15 of handler
    selector: u16,    // code segment selector
    ist: u8,          // bits 0..2 = IST index
    options: u8,      // type=0xE (interrupt gate), DPL, P
    offset_mid: u16,  // bits 16..31
    offset_high: u32, // bits 32..63
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }
}

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

fn make_gate(handler: unsafe extern "C" fn(), selector: u16) -> IdtEntry {
    let addr = handler as usize as u64;
    IdtEntry {
        offset_low: (addr & 0xFFFF) as u16,
        selector,
        ist: 0,
        options: 0x8E, // P=1, DPL=0, 64-bit interrupt gate
        offset_mid: ((addr >> 16) & 0xFFFF) as u16,
        offset_high: ((addr >> 32) & 0xFFFF_FFFF) as u32,
        reserved: 0,
    }
}

pub fn init_bsp() {
    let selector = gdt::selectors().code.0;
    unsafe {
        let base = addr_of_mut!(IDT) as *mut IdtEntry;
        base.add(TIMER_VECTOR as usize)
            .write(make_gate(isr::isr_timer_stub, selector));
        base.add(KEYBOARD_VECTOR as usize)
            .write(make_gate(isr::isr_keyboard_stub, selector));
        let pointer = DescriptorTablePointer {
            limit: (size_of::<IdtEntry>() * 256 - 1) as u16,
            base: VirtAddr::new(base as u64),
        };
        lidt(&pointer);
    }
}

/// Zero-limit IDT for application processors: every vector exceeds the
/// limit, so any interrupt there resets the machine.
pub fn load_empty() {
    let pointer = DescriptorTablePointer {
        limit: 0,
        base: VirtAddr::new(0),
    };
    unsafe { lidt(&pointer) };
}
