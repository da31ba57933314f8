// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! 4-level identity-map builder.
//!
//! The top-level table is supplied by the caller (a statically aligned page
//! in the kernel image); lower-level tables are pulled from a [`TablePages`]
//! source on demand. 2 MiB leaves are used whenever the address and the
//! remaining length allow it.
//!
//! Callers ask for cache semantics with [`MapFlags`]; the PAT bit lands at
//! bit 7 for a 4 KiB entry and bit 12 for a 2 MiB entry, so the bit is never
//! part of the caller interface.

use super::bump::Heap;
use super::{align_down, align_up, PAGE_SIZE};
use bitflags::bitflags;

pub const SIZE_2M: u64 = 2 * 1024 * 1024;

/// IA32_PAT, and the value that puts write-combining at PAT index 4 while
/// keeping indices 0..=3 at their architectural defaults. Must be written
/// before CR3 is loaded with tables built here.
pub const PAT_MSR: u32 = 0x277;
pub const PAT_MSR_VALUE: u64 = 0x0007_0401_0007_0406;

const PTE_P: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_PCD: u64 = 1 << 4;
const PTE_PS: u64 = 1 << 7;
const PTE_PAT_4K: u64 = 1 << 7;
const PTE_PAT_2M: u64 = 1 << 12;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// What the caller means; the entry encoding is chosen per page size.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const WRITABLE = 1 << 0;
        const CACHE_DISABLE = 1 << 1;
        const WRITE_COMBINING = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// An existing mapping covers this address with different flags.
    FlagConflict { addr: u64 },
}

/// Source of zeroed, 4 KiB-aligned, identity-addressable table pages.
pub trait TablePages {
    fn alloc_table(&mut self) -> *mut u64;
}

impl TablePages for Heap {
    fn alloc_table(&mut self) -> *mut u64 {
        self.allocate_pages(1) as *mut u64
    }
}

#[inline]
fn pml4_index(addr: u64) -> usize {
    ((addr >> 39) & 0x1ff) as usize
}
#[inline]
fn pdpt_index(addr: u64) -> usize {
    ((addr >> 30) & 0x1ff) as usize
}
#[inline]
fn pd_index(addr: u64) -> usize {
    ((addr >> 21) & 0x1ff) as usize
}
#[inline]
fn pt_index(addr: u64) -> usize {
    ((addr >> 12) & 0x1ff) as usize
}

fn leaf_bits(flags: MapFlags, huge: bool) -> u64 {
    let mut e = PTE_P;
    if flags.contains(MapFlags::WRITABLE) {
        e |= PTE_RW;
    }
    if flags.contains(MapFlags::CACHE_DISABLE) {
        e |= PTE_PCD;
    }
    if flags.contains(MapFlags::WRITE_COMBINING) {
        // PAT=1 PCD=0 PWT=0 selects PAT index 4.
        e |= if huge { PTE_PAT_2M } else { PTE_PAT_4K };
    }
    e
}

/// A mapping as found by [`IdentityMapper::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub entry: u64,
    pub huge: bool,
}

impl Mapping {
    pub fn writable(&self) -> bool {
        self.entry & PTE_RW != 0
    }
    pub fn cache_disabled(&self) -> bool {
        self.entry & PTE_PCD != 0
    }
    pub fn write_combining(&self) -> bool {
        let bit = if self.huge { PTE_PAT_2M } else { PTE_PAT_4K };
        self.entry & bit != 0
    }
    pub fn phys(&self) -> u64 {
        if self.huge {
            self.entry & ADDR_MASK & !(SIZE_2M - 1)
        } else {
            self.entry & ADDR_MASK
        }
    }
}

pub struct IdentityMapper<'a, A: TablePages> {
    pml4: *mut u64,
    frames: &'a mut A,
}

impl<'a, A: TablePages> IdentityMapper<'a, A> {
    /// `pml4` must be a zeroed, 4 KiB-aligned table whose address is also
    /// its physical address.
    pub fn new(pml4: *mut u64, frames: &'a mut A) -> Self {
        Self { pml4, frames }
    }

    pub fn pml4(&self) -> *mut u64 {
        self.pml4
    }

    /// Identity-map `[phys, phys + bytes)`, rounded out to page boundaries.
    /// Re-mapping with identical flags is a no-op; a flag mismatch against
    /// any existing entry is an error.
    pub fn map_range(&mut self, phys: u64, bytes: u64, flags: MapFlags) -> Result<(), MapError> {
        if bytes == 0 {
            return Ok(());
        }
        let mut addr = align_down(phys, PAGE_SIZE);
        let end = align_up(phys + bytes, PAGE_SIZE);
        while addr < end {
            if addr % SIZE_2M == 0 && end - addr >= SIZE_2M && self.try_map_2m(addr, flags)? {
                addr += SIZE_2M;
            } else {
                self.map_4k(addr, flags)?;
                addr += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Returns false when a page table already sits under this slot, in
    /// which case the range keeps its 4 KiB granularity.
    fn try_map_2m(&mut self, addr: u64, flags: MapFlags) -> Result<bool, MapError> {
        let pd = self.ensure_pd(addr)?;
        let slot = unsafe { pd.add(pd_index(addr)) };
        let found = unsafe { *slot };
        let want = addr | leaf_bits(flags, true) | PTE_PS;
        if found & PTE_P == 0 {
            unsafe { *slot = want };
            Ok(true)
        } else if found & PTE_PS != 0 {
            if found == want {
                Ok(true)
            } else {
                Err(MapError::FlagConflict { addr })
            }
        } else {
            Ok(false)
        }
    }

    fn map_4k(&mut self, addr: u64, flags: MapFlags) -> Result<(), MapError> {
        let pd = self.ensure_pd(addr)?;
        let pd_slot = unsafe { pd.add(pd_index(addr)) };
        let pd_entry = unsafe { *pd_slot };
        if pd_entry & PTE_P != 0 && pd_entry & PTE_PS != 0 {
            // Already covered by a huge page; fine if the flags agree.
            let want = align_down(addr, SIZE_2M) | leaf_bits(flags, true) | PTE_PS;
            return if pd_entry == want {
                Ok(())
            } else {
                Err(MapError::FlagConflict { addr })
            };
        }
        let pt = self.ensure_table(pd_slot, addr)?;
        let slot = unsafe { pt.add(pt_index(addr)) };
        let found = unsafe { *slot };
        let want = addr | leaf_bits(flags, false);
        if found & PTE_P == 0 {
            unsafe { *slot = want };
            Ok(())
        } else if found == want {
            Ok(())
        } else {
            Err(MapError::FlagConflict { addr })
        }
    }

    fn ensure_pd(&mut self, addr: u64) -> Result<*mut u64, MapError> {
        let pml4_slot = unsafe { self.pml4.add(pml4_index(addr)) };
        let pdpt = self.ensure_table(pml4_slot, addr)?;
        let pdpt_slot = unsafe { pdpt.add(pdpt_index(addr)) };
        self.ensure_table(pdpt_slot, addr)
    }

    fn ensure_table(&mut self, slot: *mut u64, addr: u64) -> Result<*mut u64, MapError> {
        let e = unsafe { *slot };
        if e & PTE_P == 0 {
            let table = self.frames.alloc_table();
            unsafe { *slot = (table as u64) | PTE_P | PTE_RW };
            Ok(table)
        } else if e & PTE_PS != 0 {
            Err(MapError::FlagConflict { addr })
        } else {
            Ok((e & ADDR_MASK) as *mut u64)
        }
    }

    /// Walk the tables for `addr`; used by bring-up assertions and tests.
    pub fn lookup(&self, addr: u64) -> Option<Mapping> {
        unsafe {
            let e4 = *self.pml4.add(pml4_index(addr));
            if e4 & PTE_P == 0 {
                return None;
            }
            let pdpt = (e4 & ADDR_MASK) as *const u64;
            let e3 = *pdpt.add(pdpt_index(addr));
            if e3 & PTE_P == 0 {
                return None;
            }
            let pd = (e3 & ADDR_MASK) as *const u64;
            let e2 = *pd.add(pd_index(addr));
            if e2 & PTE_P == 0 {
                return None;
            }
            if e2 & PTE_PS != 0 {
                return Some(Mapping {
                    entry: e2,
                    huge: true,
                });
            }
            let pt = (e2 & ADDR_MASK) as *const u64;
            let e1 = *pt.add(pt_index(addr));
            if e1 & PTE_P == 0 {
                return None;
            }
            Some(Mapping {
                entry: e1,
                huge: false,
            })
        }
    }
}
