// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project

use core::sync::atomic::{AtomicU64, Ordering};

static TSC_HZ: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Record the rate measured during PIT calibration.
pub fn set_hz(hz: u64) {
    TSC_HZ.store(hz, Ordering::Relaxed);
}

/// Busy-wait against the calibrated TSC. Only meaningful after `set_hz`.
pub fn delay_us(us: u64) {
    let hz = TSC_HZ.load(Ordering::Relaxed);
    debug_assert!(hz != 0, "delay_us before calibration");
    let ticks = us * hz / 1_000_000;
    let start = rdtsc();
    while rdtsc().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}
