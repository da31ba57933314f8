// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! Post-firmware bring-up and steady state.
//!
//! Order matters: heap, then paging (PAT before CR3), then the interrupt
//! plane, then the job ring, then the application processors. The `Kernel`
//! handle lives at a stable static address so interrupt handlers and APs
//! can reach it.

use spin::{Mutex, Once};
use surtrcore::acpi::{self, MadtInfo};
use surtrcore::fb::FrameBuffer;
use surtrcore::jobs::{Job, Jobs, Producer};
use surtrcore::mem::bump::Heap;
use surtrcore::mem::mmap::{kind, MemoryMap};
use surtrcore::mem::paging::{IdentityMapper, MapFlags, TablePages, PAT_MSR, PAT_MSR_VALUE};
use surtrcore::mem::PAGE_SIZE;
use uefi::mem::memory_map::{MemoryMap as FirmwareMap, MemoryMapOwned};
use x86_64::instructions::{hlt, interrupts};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::registers::model_specific::Msr;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::arch::x86_64::{apic, gdt, idt, ioapic, pit, ps2, serial, smp, trampoline, tsc};
use crate::panic::{fatal, set_framebuffer, FatalCode};
use crate::println;

pub const TIMER_HZ: u32 = 2;
const QUEUE_DEPTH: usize = 256;

pub struct Timing {
    pub apic_hz: u64,
    pub tsc_hz: u64,
}

pub struct Kernel {
    pub framebuffer: FrameBuffer,
    pub madt: MadtInfo,
    pub bsp_apic_id: u32,
    pub timing: Timing,
}

static KERNEL: Once<Kernel> = Once::new();
static JOBS: Jobs<QUEUE_DEPTH> = Jobs::new();
static PRODUCER: Mutex<Option<Producer<'static, QUEUE_DEPTH>>> = Mutex::new(None);

#[repr(C, align(4096))]
struct TableBlock([u64; 512]);

// Top-level page table: a statically aligned page inside the kernel image.
static mut KERNEL_PML4: TableBlock = TableBlock([0; 512]);

pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel handle not built")
}

pub fn jobs() -> &'static Jobs<QUEUE_DEPTH> {
    &JOBS
}

pub fn pml4_phys() -> u64 {
    unsafe { core::ptr::addr_of!(KERNEL_PML4) as u64 }
}

/// Index of the running core in the MADT core table, by LAPIC id.
pub fn core_index() -> Option<usize> {
    let id = apic::lapic_id();
    kernel().madt.cores.iter().position(|c| c.apic_id == id)
}

pub fn start(framebuffer: FrameBuffer, firmware_map: MemoryMapOwned, madt: MadtInfo) -> ! {
    // The firmware's IDT is stale from here on; nothing may interrupt until
    // ours is loaded.
    interrupts::disable();
    set_framebuffer(framebuffer);

    let meta = firmware_map.meta();
    let map = unsafe {
        MemoryMap::from_raw(
            firmware_map.buffer().as_ptr(),
            meta.map_size,
            meta.desc_size,
            meta.desc_version,
        )
    };

    // The fixed low pages the SMP launcher owns must be plain RAM. If the
    // firmware reserved them, the design cannot proceed.
    for page in [
        trampoline::DEST,
        trampoline::TRANSITION_ROOT,
        trampoline::TRANSITION_NEXT,
    ] {
        if map.kind_at(page) != Some(kind::CONVENTIONAL) {
            println!("[mem] low page {:#x} is not conventional memory", page);
            fatal(FatalCode::TrampolineReserved);
        }
    }

    let mut heap = match Heap::from_memory_map(&map) {
        Some(h) => h,
        None => fatal(FatalCode::NoConventionalMemory),
    };
    println!("[mem] heap {:#x}..{:#x}", heap.start(), heap.end());

    init_paging(&map, &framebuffer, &madt, &mut heap);

    gdt::init();
    idt::init_bsp();
    apic::init(madt.lapic_base);
    let bsp_apic_id = apic::lapic_id();

    let cal = pit::calibrate();
    tsc::set_hz(cal.tsc_hz);
    println!("[time] lapic {} Hz, tsc {} Hz", cal.apic_hz, cal.tsc_hz);
    apic::start_timer_periodic(idt::TIMER_VECTOR, (cal.apic_hz / TIMER_HZ as u64) as u32);

    let (ioapic_base, gsi_base) = madt
        .keyboard_ioapic()
        .map(|io| (io.address, io.gsi_base))
        .unwrap_or((acpi::DEFAULT_IOAPIC_BASE, 0));
    ioapic::route(
        ioapic_base,
        madt.keyboard.gsi - gsi_base,
        idt::KEYBOARD_VECTOR,
        madt.keyboard.flags,
        bsp_apic_id,
    );
    ps2::init();

    // The ring must be initialized before any consumer core exists.
    JOBS.init();
    *PRODUCER.lock() = Some(JOBS.producer());

    KERNEL.call_once(|| Kernel {
        framebuffer,
        madt,
        bsp_apic_id,
        timing: Timing {
            apic_hz: cal.apic_hz,
            tsc_hz: cal.tsc_hz,
        },
    });

    smp::boot_aps(&mut heap);

    let k = kernel();
    println!(
        "[kernel] up: {} cores, {}x{} framebuffer, lapic {} Hz, timer {} Hz",
        k.madt.core_count(),
        k.framebuffer.width,
        k.framebuffer.height,
        k.timing.apic_hz,
        TIMER_HZ,
    );
    interrupts::enable();
    loop {
        hlt();
    }
}

fn map_or_die<A: TablePages>(
    mapper: &mut IdentityMapper<'_, A>,
    phys: u64,
    bytes: u64,
    flags: MapFlags,
) {
    if let Err(err) = mapper.map_range(phys, bytes, flags) {
        println!("[mem] mapping {:#x}+{:#x} failed: {:?}", phys, bytes, err);
        fatal(FatalCode::PagingConflict);
    }
}

/// Build the identity map, configure the PAT, switch CR3.
fn init_paging(map: &MemoryMap, fb: &FrameBuffer, madt: &MadtInfo, heap: &mut Heap) {
    let pml4 = unsafe { core::ptr::addr_of_mut!(KERNEL_PML4) as *mut u64 };
    let mut mapper = IdentityMapper::new(pml4, heap);

    // The framebuffer goes first and gets write-combining; a firmware
    // descriptor overlapping it is superseded by that mapping.
    let fb_start = fb.pixels as u64;
    let fb_len = fb.byte_len();
    map_or_die(
        &mut mapper,
        fb_start,
        fb_len,
        MapFlags::WRITABLE | MapFlags::WRITE_COMBINING,
    );

    for desc in map.iter() {
        let flags = match desc.kind {
            kind::CONVENTIONAL
            | kind::ACPI_RECLAIM
            | kind::ACPI_NON_VOLATILE
            | kind::LOADER_CODE
            | kind::LOADER_DATA
            | kind::BOOT_SERVICES_CODE
            | kind::BOOT_SERVICES_DATA => MapFlags::WRITABLE,
            kind::MMIO | kind::MMIO_PORT_SPACE => MapFlags::WRITABLE | MapFlags::CACHE_DISABLE,
            _ => continue,
        };
        if desc.phys_start < fb_start + fb_len && fb_start < desc.phys_start + desc.byte_len() {
            continue;
        }
        map_or_die(&mut mapper, desc.phys_start, desc.byte_len(), flags);
    }

    // APIC windows are uncached MMIO whether or not the firmware lists them.
    let uncached = MapFlags::WRITABLE | MapFlags::CACHE_DISABLE;
    map_or_die(&mut mapper, madt.lapic_base, PAGE_SIZE, uncached);
    let ioapic_base = madt
        .keyboard_ioapic()
        .map(|io| io.address)
        .unwrap_or(acpi::DEFAULT_IOAPIC_BASE);
    map_or_die(&mut mapper, ioapic_base, PAGE_SIZE, uncached);

    unsafe {
        // PAT first: no flush is needed as long as the new tables only take
        // effect with the CR3 load below.
        Msr::new(PAT_MSR).write(PAT_MSR_VALUE);
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(pml4 as u64)),
            Cr3Flags::empty(),
        );
    }
}

struct Heartbeat;

impl Job for Heartbeat {
    fn run(self) {
        serial::write_byte(b'.');
    }
}

struct ScancodeReport(u8);

impl Job for ScancodeReport {
    fn run(self) {
        println!("[kbd] scancode {:#04x}", self.0);
    }
}

/// Timer tick, bootstrap core only. A full ring just drops the heartbeat.
pub fn on_timer() {
    if let Some(producer) = PRODUCER.lock().as_mut() {
        let _ = producer.try_add(Heartbeat);
    }
}

/// Keyboard interrupt, bootstrap core only.
pub fn on_keyboard(scancode: u8) {
    if let Some(producer) = PRODUCER.lock().as_mut() {
        let _ = producer.try_add(ScancodeReport(scancode));
    }
}
