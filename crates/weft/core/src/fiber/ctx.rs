// Weft
// Copyright (C) 2026 Weft Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Machine context save/restore for stackful fibers.
//!
//! The saved context is a single stack pointer: `ctx_switch` pushes the
//! callee-saved registers of the current continuation onto its own stack,
//! stores the stack pointer into `save`, then restores `load` the same way.
//! A freshly initialized context "restores" into the fiber trampoline.

use std::ptr;

/// A suspended continuation. Holds the stack pointer of a frame produced by
/// `ctx_switch` (or by `ctx_init` for a fiber that has not yet run).
#[repr(C)]
#[derive(Debug)]
pub(crate) struct Context {
    sp: *mut u8,
}

// SAFETY: a Context is only dereferenced by ctx_switch, and the scheduling
// protocol guarantees at most one worker resumes a given continuation.
unsafe impl Send for Context {}

impl Context {
    pub const fn empty() -> Self {
        Self { sp: ptr::null_mut() }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Save the current continuation into `save` and resume `load`.
        ///
        /// System V x86_64: rbp, rbx, r12-r15 are callee-saved; everything
        /// else is dead across the call by ABI contract.
        #[unsafe(naked)]
        pub(crate) unsafe extern "C" fn ctx_switch(_save: *mut Context, _load: *const Context) {
            core::arch::naked_asm!(
                "push rbp",
                "push rbx",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov [rdi], rsp",
                "mov rsp, [rsi]",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbx",
                "pop rbp",
                "ret",
            )
        }

        /// Prepare `ctx` so that the first `ctx_switch` into it enters
        /// `entry` at the top of the fiber's stack.
        ///
        /// `stack_top` must be 16-byte aligned. The frame holds six zeroed
        /// callee-saved slots, the entry address consumed by `ret`, and one
        /// unused slot that keeps the ABI's stack alignment at entry.
        pub(crate) unsafe fn ctx_init(ctx: &mut Context, stack_top: *mut u8, entry: extern "C" fn() -> !) {
            debug_assert_eq!(stack_top as usize % 16, 0);
            unsafe {
                let sp = (stack_top as *mut u64).sub(8);
                for slot in 0..6 {
                    sp.add(slot).write(0);
                }
                sp.add(6).write(entry as usize as u64);
                sp.add(7).write(0);
                ctx.sp = sp as *mut u8;
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Save the current continuation into `save` and resume `load`.
        ///
        /// AAPCS64: x19-x28, fp (x29), lr (x30) and d8-d15 are callee-saved.
        #[unsafe(naked)]
        pub(crate) unsafe extern "C" fn ctx_switch(_save: *mut Context, _load: *const Context) {
            core::arch::naked_asm!(
                "sub sp, sp, #160",
                "stp x19, x20, [sp]",
                "stp x21, x22, [sp, #16]",
                "stp x23, x24, [sp, #32]",
                "stp x25, x26, [sp, #48]",
                "stp x27, x28, [sp, #64]",
                "stp x29, x30, [sp, #80]",
                "stp d8,  d9,  [sp, #96]",
                "stp d10, d11, [sp, #112]",
                "stp d12, d13, [sp, #128]",
                "stp d14, d15, [sp, #144]",
                "mov x9, sp",
                "str x9, [x0]",
                "ldr x9, [x1]",
                "mov sp, x9",
                "ldp x19, x20, [sp]",
                "ldp x21, x22, [sp, #16]",
                "ldp x23, x24, [sp, #32]",
                "ldp x25, x26, [sp, #48]",
                "ldp x27, x28, [sp, #64]",
                "ldp x29, x30, [sp, #80]",
                "ldp d8,  d9,  [sp, #96]",
                "ldp d10, d11, [sp, #112]",
                "ldp d12, d13, [sp, #128]",
                "ldp d14, d15, [sp, #144]",
                "add sp, sp, #160",
                "ret",
            )
        }

        /// Prepare `ctx` so that the first `ctx_switch` into it enters
        /// `entry` at the top of the fiber's stack.
        ///
        /// The frame mirrors the save area of `ctx_switch`: all registers
        /// zero except lr, which carries the entry point; a zero fp
        /// terminates the frame chain.
        pub(crate) unsafe fn ctx_init(ctx: &mut Context, stack_top: *mut u8, entry: extern "C" fn() -> !) {
            debug_assert_eq!(stack_top as usize % 16, 0);
            unsafe {
                let sp = (stack_top as *mut u64).sub(20);
                for slot in 0..20 {
                    sp.add(slot).write(0);
                }
                // lr lives at byte offset 88 in the save area.
                sp.add(11).write(entry as usize as u64);
                ctx.sp = sp as *mut u8;
            }
        }
    } else {
        compile_error!("weft-core fibers support x86_64 and aarch64 only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberStack;
    use std::cell::Cell;

    thread_local! {
        static HOST_CTX: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static FIBER_CTX: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static TRACE: Cell<u32> = const { Cell::new(0) };
    }

    extern "C" fn bouncing_entry() -> ! {
        TRACE.with(|t| t.set(t.get() + 1));
        let (fiber, host) = (FIBER_CTX.with(Cell::get), HOST_CTX.with(Cell::get));
        unsafe { ctx_switch(fiber, host) };
        // Resumed a second time.
        TRACE.with(|t| t.set(t.get() + 10));
        let (fiber, host) = (FIBER_CTX.with(Cell::get), HOST_CTX.with(Cell::get));
        unsafe { ctx_switch(fiber, host) };
        unreachable!("fiber resumed after final switch out");
    }

    #[test]
    fn test_switch_round_trips() {
        let stack = FiberStack::new(64 * 1024).expect("Failed to allocate fiber stack");
        let mut host = Box::new(Context::empty());
        let mut fiber = Box::new(Context::empty());

        unsafe { ctx_init(&mut fiber, stack.top(), bouncing_entry) };
        HOST_CTX.with(|c| c.set(&mut *host));
        FIBER_CTX.with(|c| c.set(&mut *fiber));
        TRACE.with(|t| t.set(0));

        unsafe { ctx_switch(&mut *host, &*fiber) };
        assert_eq!(TRACE.with(Cell::get), 1);

        unsafe { ctx_switch(&mut *host, &*fiber) };
        assert_eq!(TRACE.with(Cell::get), 11);
    }
}
