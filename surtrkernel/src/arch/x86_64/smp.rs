// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! SMP launcher and the application-processor side of dispatch.
//!
//! One trampoline instance at a fixed low address is reused for every AP:
//! rewrite its embedded config, INIT-SIPI-SIPI, then wait for the AP to
//! raise the started flag before moving on to the next one.

use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};

use surtrcore::mem::bump::Heap;
use surtrcore::mem::PAGE_SIZE;

use super::trampoline::{self, TrampolineConfig};
use super::{apic, gdt, idt, tsc};
use crate::kernel;
use crate::println;

const AP_STACK_PAGES: u64 = 4;

// Entry bits for the transition tables (present, writable, page size).
const TT_PRESENT_RW: u64 = 0b11;
const TT_LEAF: u64 = TT_PRESENT_RW | (1 << 7);

/// Raised (release) by each AP the moment it reaches its long-mode entry;
/// the launcher polls it (acquire) and clears it between processors.
static AP_STARTED: AtomicU8 = AtomicU8::new(0);

/// Fill the two fixed transition-table pages: one PS leaf identity-mapping
/// low memory, reached from entry 0 of the root. Both pages were verified
/// to sit in conventional memory during bring-up.
fn build_transition_tables() {
    unsafe {
        ptr::write_bytes(trampoline::TRANSITION_ROOT as *mut u8, 0, PAGE_SIZE as usize);
        ptr::write_bytes(trampoline::TRANSITION_NEXT as *mut u8, 0, PAGE_SIZE as usize);
        *(trampoline::TRANSITION_ROOT as *mut u64) = trampoline::TRANSITION_NEXT | TT_PRESENT_RW;
        *(trampoline::TRANSITION_NEXT as *mut u64) = TT_LEAF;
    }
}

/// Bring every non-bootstrap core out of halt, one at a time.
pub fn boot_aps(heap: &mut Heap) {
    let k = kernel::kernel();

    let blob = trampoline::blob();
    // The blob must stay clear of the transition tables right above it.
    assert!((blob.len() as u64) <= trampoline::TRANSITION_ROOT - trampoline::DEST);
    unsafe {
        ptr::copy_nonoverlapping(blob.as_ptr(), trampoline::DEST as *mut u8, blob.len());
    }
    build_transition_tables();

    let config = (trampoline::DEST as usize + trampoline::config_offset()) as *mut TrampolineConfig;

    for core in k.madt.cores.iter().filter(|c| c.apic_id != k.bsp_apic_id) {
        let stack = heap.allocate_pages(AP_STACK_PAGES);
        let stack_top = stack + AP_STACK_PAGES * PAGE_SIZE;

        unsafe {
            config.write_volatile(TrampolineConfig {
                transition_root: trampoline::TRANSITION_ROOT,
                stack_top,
                task_entry: ap_entry as usize as u64,
                pml4: kernel::pml4_phys(),
            });
        }

        AP_STARTED.store(0, Ordering::Relaxed);
        apic::send_init(core.apic_id);
        tsc::delay_us(10_000);
        apic::send_startup(core.apic_id, trampoline::SIPI_VECTOR);
        tsc::delay_us(200);
        apic::send_startup(core.apic_id, trampoline::SIPI_VECTOR);

        while AP_STARTED.load(Ordering::Acquire) == 0 {
            core::hint::spin_loop();
        }
        println!("[smp] core {} online", core.apic_id);
    }
}

/// First Rust code on an AP. Interrupts never run here: the IDT is empty
/// by design, so a stray vector resets the machine.
extern "C" fn ap_entry() -> ! {
    AP_STARTED.store(1, Ordering::Release);
    gdt::load();
    idt::load_empty();

    let index = kernel::core_index().unwrap_or(usize::MAX);
    println!("[smp] consumer loop on core {} (apic {})", index, apic::lapic_id());

    let jobs = kernel::jobs();
    loop {
        if !jobs.run_next() {
            core::hint::spin_loop();
        }
    }
}
