// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! Interrupt entry stubs and their Rust-level targets.
//!
//! Each stub saves the 15 general-purpose registers plus a 512-byte FXSAVE
//! area before calling into Rust, so handlers (and the jobs they enqueue)
//! may freely clobber FPU/SSE state. The hardware frame's five qwords plus
//! the 15 pushes leave RSP 16-byte aligned; the `call` then re-establishes
//! the SysV entry alignment on its own.

use core::arch::global_asm;

use super::{apic, ps2};
use crate::kernel;

extern "C" {
    pub fn isr_timer_stub();
    pub fn isr_keyboard_stub();
}

macro_rules! isr_stub {
    ($stub:literal, $target:literal) => {
        global_asm!(
            ".section .text",
            ".code64",
            concat!(".global ", $stub),
            concat!($stub, ":"),
            "push rax",
            "push rbx",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push rbp",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "sub rsp, 512",
            "fxsave64 [rsp]",
            "cld",
            concat!("call ", $target),
            "fxrstor64 [rsp]",
            "add rsp, 512",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rbp",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "iretq",
        );
    };
}

isr_stub!("isr_timer_stub", "isr_timer_rust");
isr_stub!("isr_keyboard_stub", "isr_keyboard_rust");

#[no_mangle]
extern "C" fn isr_timer_rust() {
    kernel::on_timer();
    apic::eoi();
}

#[no_mangle]
extern "C" fn isr_keyboard_rust() {
    // The controller blocks further bytes until the output buffer is read.
    let scancode = ps2::read_scancode();
    kernel::on_keyboard(scancode);
    apic::eoi();
}
