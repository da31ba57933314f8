// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! Cross-module bring-up scenarios: firmware memory map in, heap and page
//! tables out, with the MADT topology steering the interrupt plumbing.

use surtrcore::acpi::{self, parse_madt};
use surtrcore::mem::bump::Heap;
use surtrcore::mem::mmap::{kind, MemoryMap, MemoryDescriptor};
use surtrcore::mem::paging::{IdentityMapper, MapFlags, TablePages, SIZE_2M};
use surtrcore::mem::PAGE_SIZE;

const TRAMPOLINE_PAGES: [u64; 3] = [0x8000, 0x10000, 0x11000];

fn firmware_map(stride: usize, entries: &[(u32, u64, u64)]) -> Vec<u8> {
    let mut buf = vec![0u8; stride * entries.len()];
    for (i, &(kind, start, pages)) in entries.iter().enumerate() {
        let at = i * stride;
        buf[at..at + 4].copy_from_slice(&kind.to_le_bytes());
        buf[at + 8..at + 16].copy_from_slice(&start.to_le_bytes());
        buf[at + 24..at + 32].copy_from_slice(&pages.to_le_bytes());
    }
    buf
}

fn madt(entries: &[&[u8]]) -> Vec<u8> {
    let mut bytes = vec![0u8; 44];
    bytes[0..4].copy_from_slice(b"APIC");
    bytes[36..40].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
    for e in entries {
        bytes.extend_from_slice(e);
    }
    let len = bytes.len() as u32;
    bytes[4..8].copy_from_slice(&len.to_le_bytes());
    let sum: u8 = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b));
    bytes[9] = sum.wrapping_neg();
    bytes
}

fn lapic(apic_id: u8, flags: u32) -> Vec<u8> {
    let mut e = vec![0u8, 8, apic_id, apic_id];
    e.extend_from_slice(&flags.to_le_bytes());
    e
}

fn ioapic(id: u8, address: u32, gsi_base: u32) -> Vec<u8> {
    let mut e = vec![1u8, 12, id, 0];
    e.extend_from_slice(&address.to_le_bytes());
    e.extend_from_slice(&gsi_base.to_le_bytes());
    e
}

#[repr(C, align(4096))]
struct Table([u64; 512]);

struct Arena {
    tables: Vec<Box<Table>>,
}

impl TablePages for Arena {
    fn alloc_table(&mut self) -> *mut u64 {
        self.tables.push(Box::new(Table([0; 512])));
        self.tables.last_mut().unwrap().0.as_mut_ptr()
    }
}

#[test]
fn single_core_handoff() {
    // 512 MiB of conventional memory at 1 MiB, low RAM for the trampoline,
    // one enabled local APIC, one I/O APIC at the default base.
    let buf = firmware_map(
        48,
        &[
            (kind::CONVENTIONAL, 0x1000, 0x9F),
            (kind::LOADER_CODE, 0x20_0000, 0x40),
            (kind::CONVENTIONAL, 0x10_0000, 512 * 256),
        ],
    );
    let map = unsafe { MemoryMap::from_raw(buf.as_ptr(), buf.len(), 48, 1) };

    for page in TRAMPOLINE_PAGES {
        assert_eq!(map.kind_at(page), Some(kind::CONVENTIONAL));
    }

    let table = madt(&[&lapic(0, 1), &ioapic(0, 0xFEC0_0000, 0)]);
    let info = parse_madt(&table).unwrap();
    assert_eq!(info.core_count(), 1);
    assert_eq!(info.cores[0].apic_id, 0);
    assert_eq!(info.keyboard.gsi, acpi::DEFAULT_KEYBOARD_GSI);
    assert_eq!(info.keyboard_ioapic().unwrap().address, 0xFEC0_0000);

    // The heap lands on the big region; no AP would be launched.
    let heap = Heap::from_memory_map(&map).unwrap();
    assert_eq!(heap.start(), 0x10_0000);
    assert_eq!(heap.size(), 512 * 1024 * 1024);
    let aps: Vec<_> = info.cores.iter().filter(|c| c.apic_id != 0).collect();
    assert!(aps.is_empty());
}

#[test]
fn four_core_topology_launches_three_aps() {
    let table = madt(&[
        &lapic(0, 1),
        &lapic(1, 1),
        &lapic(2, 1),
        &lapic(3, 1),
        &ioapic(0, 0xFEC0_0000, 0),
    ]);
    let info = parse_madt(&table).unwrap();
    assert_eq!(info.core_count(), 4);
    let bsp_apic_id = 0u32;
    let targets: Vec<u32> = info
        .cores
        .iter()
        .filter(|c| c.apic_id != bsp_apic_id)
        .map(|c| c.apic_id)
        .collect();
    assert_eq!(targets, vec![1, 2, 3]);
}

#[test]
fn firmware_mmio_region_maps_cache_disabled() {
    // 16 MiB of firmware MMIO at 0xF000_0000 ends up present, writable and
    // PCD-set; the conventional region stays cacheable.
    let buf = firmware_map(
        48,
        &[
            (kind::CONVENTIONAL, 0x10_0000, 0x4000),
            (kind::MMIO, 0xF000_0000, 0x1000),
        ],
    );
    let map = unsafe { MemoryMap::from_raw(buf.as_ptr(), buf.len(), 48, 1) };

    let mut arena = Arena { tables: Vec::new() };
    let pml4 = arena.alloc_table();
    let mut mapper = IdentityMapper::new(pml4, &mut arena);

    for desc in map.iter() {
        let flags = match desc.kind {
            kind::CONVENTIONAL => MapFlags::WRITABLE,
            kind::MMIO => MapFlags::WRITABLE | MapFlags::CACHE_DISABLE,
            _ => continue,
        };
        mapper.map_range(desc.phys_start, desc.byte_len(), flags).unwrap();
    }

    let mut addr = 0xF000_0000u64;
    while addr < 0xF100_0000 {
        let m = mapper.lookup(addr).expect("unmapped MMIO page");
        assert!(m.writable());
        assert!(m.cache_disabled());
        addr += SIZE_2M;
    }
    let ram = mapper.lookup(0x10_0000 + PAGE_SIZE).unwrap();
    assert!(ram.writable());
    assert!(!ram.cache_disabled());
}

#[test]
fn descriptor_partition_survives_odd_strides() {
    let entries = [
        (kind::BOOT_SERVICES_DATA, 0x0, 16),
        (kind::CONVENTIONAL, 0x10_0000, 256),
    ];
    for stride in [40usize, 48, 56, 64] {
        let buf = firmware_map(stride, &entries);
        let map = unsafe { MemoryMap::from_raw(buf.as_ptr(), buf.len(), stride, 1) };
        let got: Vec<MemoryDescriptor> = map.iter().collect();
        assert_eq!(got.len(), 2, "stride {}", stride);
        assert_eq!(got[1].phys_start, 0x10_0000);
        assert_eq!(got[1].byte_len(), 256 * PAGE_SIZE);
    }
}
