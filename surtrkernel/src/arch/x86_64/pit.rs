// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! LAPIC-timer and TSC calibration against one ~10 ms terminal count of the
//! legacy 8254, the only clock with a known rate at this point.

use x86_64::instructions::port::Port;

use super::{apic, tsc};

const PIT_HZ: u64 = 1_193_182;
// One full calibration window per 1/100 s, so elapsed counts scale by 100.
const CALIBRATION_HZ: u64 = 100;

const PORT_CH0: u16 = 0x40;
const PORT_CMD: u16 = 0x43;
// Channel 0, lobyte/hibyte access, mode 0 (terminal count), binary.
const CMD_CH0_MODE0: u8 = 0x30;
// Read-back: latch the status byte of channel 0.
const CMD_LATCH_STATUS_CH0: u8 = 0xE2;
// Status bit 7 mirrors the OUT pin, which rises at terminal count.
const STATUS_OUT_HIGH: u8 = 0x80;

pub struct Calibration {
    pub apic_hz: u64,
    pub tsc_hz: u64,
}

pub fn calibrate() -> Calibration {
    let reload = (PIT_HZ / CALIBRATION_HZ) as u16;

    apic::begin_timer_calibration();
    let tsc_start = tsc::rdtsc();

    let mut cmd = Port::<u8>::new(PORT_CMD);
    let mut ch0 = Port::<u8>::new(PORT_CH0);
    unsafe {
        cmd.write(CMD_CH0_MODE0);
        ch0.write((reload & 0xFF) as u8);
        ch0.write((reload >> 8) as u8);
        loop {
            cmd.write(CMD_LATCH_STATUS_CH0);
            if ch0.read() & STATUS_OUT_HIGH != 0 {
                break;
            }
            core::hint::spin_loop();
        }
    }

    let apic_elapsed = apic::timer_elapsed() as u64;
    let tsc_elapsed = tsc::rdtsc().wrapping_sub(tsc_start);
    Calibration {
        apic_hz: apic_elapsed * CALIBRATION_HZ,
        tsc_hz: tsc_elapsed * CALIBRATION_HZ,
    }
}
