// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! Firmware handoff: everything that still needs boot services. Failures in
//! this phase report to the log and bounce the firmware's aborted status
//! back out of `efi_main`.

use core::slice;
use log::{error, info};
use surtrcore::acpi::{self, AcpiError, MadtInfo};
use surtrcore::fb::FrameBuffer;
use uefi::boot;
use uefi::mem::memory_map::MemoryMapOwned;
use uefi::proto::console::gop::GraphicsOutput;
use uefi::table::cfg::ConfigTableEntry;
use uefi::Status;

/// Locate the graphics output protocol and capture the linear framebuffer.
pub fn locate_framebuffer() -> Result<FrameBuffer, Status> {
    let handle = boot::get_handle_for_protocol::<GraphicsOutput>().map_err(|e| {
        error!("abort: no graphics output protocol: {:?}", e);
        Status::ABORTED
    })?;
    let mut gop = boot::open_protocol_exclusive::<GraphicsOutput>(handle).map_err(|e| {
        error!("abort: graphics output protocol unusable: {:?}", e);
        Status::ABORTED
    })?;

    let mode = gop.current_mode_info();
    let (width, height) = mode.resolution();
    let fb = FrameBuffer {
        pixels: gop.frame_buffer().as_mut_ptr().cast(),
        width: width as u32,
        height: height as u32,
        stride: mode.stride() as u32,
    };
    info!(
        "framebuffer {}x{} stride {} at {:p}",
        fb.width, fb.height, fb.stride, fb.pixels
    );
    Ok(fb)
}

/// The ACPI 2.0+ root pointer from the firmware configuration table.
fn acpi2_rsdp() -> Option<u64> {
    uefi::system::with_config_table(|tables| {
        tables
            .iter()
            .find(|t| t.guid == ConfigTableEntry::ACPI2_GUID)
            .map(|t| t.address as u64)
    })
}

/// Materialize an SDT: read the header for the declared length, then hand
/// back the whole table.
///
/// # Safety
///
/// `phys` must point at an SDT in firmware-owned memory, identity-mapped
/// for at least the declared table length.
unsafe fn table_bytes(phys: u64) -> Result<&'static [u8], AcpiError> {
    let header = slice::from_raw_parts(phys as *const u8, acpi::SDT_HEADER_LEN);
    let len = acpi::sdt_length(header)?;
    Ok(slice::from_raw_parts(phys as *const u8, len))
}

fn abort(what: &str, err: AcpiError) -> Status {
    error!("abort: {}: {:?}", what, err);
    Status::ABORTED
}

/// Walk RSDP → XSDT → MADT and extract the interrupt-controller topology.
pub fn discover_platform() -> Result<MadtInfo, Status> {
    let rsdp_addr = acpi2_rsdp().ok_or_else(|| {
        error!("abort: no ACPI 2.0 RSDP in the configuration table");
        Status::ABORTED
    })?;

    let rsdp = unsafe {
        let head = slice::from_raw_parts(rsdp_addr as *const u8, acpi::SDT_HEADER_LEN);
        let declared = if head[15] >= 2 {
            u32::from_le_bytes(head[20..24].try_into().unwrap()) as usize
        } else {
            0
        };
        slice::from_raw_parts(
            rsdp_addr as *const u8,
            declared.max(acpi::SDT_HEADER_LEN),
        )
    };
    let xsdt_addr = acpi::parse_rsdp(rsdp).map_err(|e| abort("RSDP", e))?;

    let xsdt = unsafe { table_bytes(xsdt_addr) }.map_err(|e| abort("XSDT", e))?;
    for table_addr in acpi::xsdt_entries(xsdt).map_err(|e| abort("XSDT", e))? {
        let table = unsafe { table_bytes(table_addr) }.map_err(|e| abort("SDT", e))?;
        if !acpi::checksum_ok(table) {
            return Err(abort("SDT", AcpiError::BadChecksum));
        }
        if acpi::sdt_signature(table) == *b"APIC" {
            let madt = acpi::parse_madt(table).map_err(|e| abort("MADT", e))?;
            info!(
                "MADT: {} cores, {} I/O APICs, lapic at {:#x}, keyboard gsi {} flags {:#x}",
                madt.core_count(),
                madt.ioapics.len(),
                madt.lapic_base,
                madt.keyboard.gsi,
                madt.keyboard.flags,
            );
            return Ok(madt);
        }
    }

    error!("abort: no MADT among the XSDT tables");
    Err(Status::ABORTED)
}

/// Capture the final memory map and leave firmware control. The returned
/// map's retry protocol (re-fetch on stale key, headroom allocation) lives
/// inside the uefi crate.
pub fn exit_boot_services() -> MemoryMapOwned {
    info!("exiting boot services");
    unsafe { boot::exit_boot_services(None) }
}
