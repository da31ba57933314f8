// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! The kernel GDT: null, 64-bit ring-0 code, ring-0 data. Built once on the
//! bootstrap core; application processors reload the same table to leave
//! the trampoline's local descriptors behind.

use spin::Once;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

#[derive(Clone, Copy)]
pub struct Selectors {
    pub code: SegmentSelector,
    pub data: SegmentSelector,
}

static GDT: Once<(GlobalDescriptorTable, Selectors)> = Once::new();

pub fn init() {
    GDT.call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());
        (gdt, Selectors { code, data })
    });
    load();
}

/// Load the table and reload every segment register. `CS` goes through the
/// far-return idiom inside `set_reg`.
pub fn load() {
    let (gdt, selectors) = GDT.get().expect("GDT not built");
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code);
        DS::set_reg(selectors.data);
        ES::set_reg(selectors.data);
        SS::set_reg(selectors.data);
    }
}

pub fn selectors() -> Selectors {
    GDT.get().expect("GDT not built").1
}
