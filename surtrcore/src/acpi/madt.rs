// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! MADT ("APIC") parse: CPU topology, I/O APICs, the keyboard interrupt
//! source override and the local-APIC address override.

use super::{
    checksum_ok, sdt_length, sdt_signature, AcpiError, CpuEntry, IoApic, KeyboardConfig, MadtInfo,
    DEFAULT_KEYBOARD_GSI, DEFAULT_LAPIC_BASE, POLARITY_ACTIVE_LOW, SDT_HEADER_LEN, TRIGGER_LEVEL,
};

const ENTRY_LAPIC: u8 = 0;
const ENTRY_IOAPIC: u8 = 1;
const ENTRY_ISO: u8 = 2;
const ENTRY_LAPIC_OVERRIDE: u8 = 5;

// Local-APIC flags: bit 0 "enabled", bit 1 "online capable".
const LAPIC_USABLE: u32 = 0b11;

const ISA_IRQ_KEYBOARD: u8 = 1;

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

/// Translate the 2+2 ACPI polarity/trigger field of an interrupt source
/// override into redirection-entry bits 13 and 15.
fn iso_flags(acpi: u16) -> u32 {
    let mut f = 0;
    if acpi & 0x3 == 0x3 {
        f |= POLARITY_ACTIVE_LOW;
    }
    if (acpi >> 2) & 0x3 == 0x3 {
        f |= TRIGGER_LEVEL;
    }
    f
}

/// Parse a whole MADT. The slice must cover the declared table length.
pub fn parse_madt(table: &[u8]) -> Result<MadtInfo, AcpiError> {
    if sdt_signature(table) != *b"APIC" {
        return Err(AcpiError::BadSignature);
    }
    let len = sdt_length(table)?;
    if len > table.len() || len < SDT_HEADER_LEN + 8 {
        return Err(AcpiError::BadLength);
    }
    if !checksum_ok(&table[..len]) {
        return Err(AcpiError::BadChecksum);
    }

    let mut info = MadtInfo {
        lapic_base: read_u32(table, SDT_HEADER_LEN) as u64,
        cores: heapless::Vec::new(),
        ioapics: heapless::Vec::new(),
        keyboard: KeyboardConfig {
            gsi: DEFAULT_KEYBOARD_GSI,
            flags: 0,
        },
    };
    if info.lapic_base == 0 {
        info.lapic_base = DEFAULT_LAPIC_BASE;
    }

    let mut p = SDT_HEADER_LEN + 8;
    while p < len {
        if p + 2 > len {
            return Err(AcpiError::MalformedEntry);
        }
        let typ = table[p];
        let elen = table[p + 1] as usize;
        if elen < 2 || p + elen > len {
            return Err(AcpiError::MalformedEntry);
        }
        let entry = &table[p..p + elen];

        match typ {
            ENTRY_LAPIC => {
                if elen < 8 {
                    return Err(AcpiError::MalformedEntry);
                }
                let apic_id = entry[3] as u32;
                let flags = read_u32(entry, 4);
                if flags & LAPIC_USABLE != 0 {
                    if info.cores.is_full() {
                        return Err(AcpiError::TooManyCpus);
                    }
                    if info.cores.iter().any(|c| c.apic_id == apic_id) {
                        return Err(AcpiError::DuplicateApicId);
                    }
                    info.cores.push(CpuEntry { apic_id }).ok();
                }
            }
            ENTRY_IOAPIC => {
                if elen < 12 {
                    return Err(AcpiError::MalformedEntry);
                }
                info.ioapics
                    .push(IoApic {
                        id: entry[2],
                        address: read_u32(entry, 4) as u64,
                        gsi_base: read_u32(entry, 8),
                    })
                    .map_err(|_| AcpiError::TooManyIoApics)?;
            }
            ENTRY_ISO => {
                if elen < 10 {
                    return Err(AcpiError::MalformedEntry);
                }
                if entry[3] == ISA_IRQ_KEYBOARD {
                    info.keyboard = KeyboardConfig {
                        gsi: read_u32(entry, 4),
                        flags: iso_flags(read_u16(entry, 8)),
                    };
                }
            }
            ENTRY_LAPIC_OVERRIDE => {
                if elen < 12 {
                    return Err(AcpiError::MalformedEntry);
                }
                info.lapic_base = read_u64(entry, 4);
            }
            _ => {}
        }

        p += elen;
    }

    Ok(info)
}
