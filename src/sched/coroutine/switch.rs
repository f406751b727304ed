//! Hand-rolled stack-switching backend.
//!
//! A context is a saved stack pointer; every other piece of machine state
//! lives on the context's own stack. Switching pushes the callee-saved
//! registers of the running side, stores the resulting stack pointer,
//! reloads the other side's stack pointer and pops its registers back.
//!
//! This file is the only place in the crate where raw machine state is
//! manipulated; everything above it is portable safe Rust.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use super::stack::Stack;
use super::{ResumeOutcome, StartFn, Yielder, MIN_STACK_SIZE};

/// The two saved stack pointers a context pair switches between, plus the
/// completion flag and the bounds used by the stack-exhaustion heuristic.
/// Boxed so both sides hold a stable address.
pub(super) struct Slots {
    /// Saved state of the host while the coroutine runs.
    host_sp: Cell<usize>,
    /// Saved state of the coroutine while it is suspended.
    coro_sp: Cell<usize>,
    finished: Cell<bool>,
    stack_lo: usize,
}

pub(super) struct Coro {
    slots: Box<Slots>,
    stack: Stack,
}

pub(super) struct YielderImpl {
    slots: *const Slots,
}

/// Everything the entry trampoline needs, moved onto the heap so a single
/// pointer can carry it across the first switch.
struct StartArg {
    f: StartFn,
    slots: *const Slots,
}

impl Coro {
    pub(super) fn new(stack_size: usize, f: StartFn) -> Self {
        let stack = Stack::new(stack_size);
        let slots = Box::new(Slots {
            host_sp: Cell::new(0),
            coro_sp: Cell::new(0),
            finished: Cell::new(false),
            stack_lo: stack.base() as usize,
        });
        let arg = Box::into_raw(Box::new(StartArg {
            f,
            slots: &*slots,
        }));
        // SAFETY: the stack is freshly allocated and exclusively ours;
        // coro_entry consumes `arg` exactly once, on first resume.
        let sp = unsafe { arch::prepare_stack(stack.top(), coro_entry, arg.cast()) };
        slots.coro_sp.set(sp);
        Self { slots, stack }
    }

    pub(super) fn resume(&mut self) -> ResumeOutcome {
        debug_assert!(
            !self.slots.finished.get(),
            "resumed a finished coroutine context"
        );
        // SAFETY: coro_sp holds a suspended context prepared by
        // `prepare_stack` or a previous switch out of the coroutine; the
        // coroutine saves back into host_sp before control returns here.
        unsafe { arch::switch(self.slots.host_sp.as_ptr(), self.slots.coro_sp.as_ptr()) };
        if self.slots.finished.get() {
            ResumeOutcome::Finished
        } else {
            ResumeOutcome::Suspended
        }
    }

    #[inline]
    pub(super) fn is_finished(&self) -> bool {
        self.slots.finished.get()
    }

    #[inline]
    pub(super) fn stack_size(&self) -> usize {
        self.stack.size()
    }
}

// Dropping a context that never ran to completion frees its stack without
// unwinding it, leaking whatever the start closure still owned. The
// scheduler drives every job to completion before disposal, so this only
// happens when an embedder drops a scheduler with live jobs.

impl YielderImpl {
    pub(super) fn suspend(&self) {
        // SAFETY: called from the coroutine side only; host_sp was filled
        // by the resume that got us here.
        let slots = unsafe { &*self.slots };
        unsafe { arch::switch(slots.coro_sp.as_ptr(), slots.host_sp.as_ptr()) };
    }

    pub(super) fn stack_space_almost_gone(&self) -> bool {
        let slots = unsafe { &*self.slots };
        let marker = 0u8;
        let sp = &marker as *const u8 as usize;
        sp.saturating_sub(slots.stack_lo) < MIN_STACK_SIZE
    }
}

/// First and only frame at the bottom of every coroutine stack. Runs the
/// start closure, records completion, and parks forever: a coroutine entry
/// never returns, there is nothing to return to.
unsafe extern "C" fn coro_entry(raw: *mut u8) -> ! {
    let slots;
    {
        let arg = unsafe { Box::from_raw(raw.cast::<StartArg>()) };
        slots = arg.slots;
        let yielder = Yielder::new(YielderImpl { slots });
        // A panic escaping the closure counts as completion; the scheduler
        // stays exception-neutral.
        let _ = panic::catch_unwind(AssertUnwindSafe(move || (arg.f)(&yielder)));
    }
    unsafe {
        (*slots).finished.set(true);
        loop {
            arch::switch((*slots).coro_sp.as_ptr(), (*slots).host_sp.as_ptr());
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use core::arch::naked_asm;

    /// Save the running context's callee-saved registers on its stack,
    /// store the stack pointer through `save`, reload the stack pointer
    /// from `restore` and return on that stack. System V: rdi = save,
    /// rsi = restore.
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch(save: *mut usize, restore: *const usize) {
        naked_asm!(
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

    /// Landing pad for the first switch into a fresh context.
    /// `prepare_stack` parks the entry function in r13 and its argument in
    /// r12; the entry function never returns, ud2 traps if it does.
    #[unsafe(naked)]
    unsafe extern "C" fn trampoline() {
        naked_asm!("mov rdi, r12", "call r13", "ud2",)
    }

    /// Lay out the initial frame so the first `switch` into the context
    /// pops zeroed registers (r13/r12 excepted) and "returns" into the
    /// trampoline with call-site stack alignment intact.
    pub(super) unsafe fn prepare_stack(
        top: *mut u8,
        entry: unsafe extern "C" fn(*mut u8) -> !,
        arg: *mut u8,
    ) -> usize {
        let top = (top as usize) & !15;
        // Return slot sits 8 below a 16-byte boundary: after the six pops
        // and the ret, the trampoline's `call` leaves rsp correctly
        // aligned for the entry function.
        let sp = top - 8 - 6 * 8;
        let frame = sp as *mut usize;
        unsafe {
            frame.add(0).write(0); // r15
            frame.add(1).write(0); // r14
            frame.add(2).write(entry as usize); // r13
            frame.add(3).write(arg as usize); // r12
            frame.add(4).write(0); // rbx
            frame.add(5).write(0); // rbp
            frame.add(6).write(trampoline as usize); // return address
        }
        sp
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use core::arch::naked_asm;

    /// AAPCS64 callee-saved set: x19-x28, fp, lr, d8-d15. 160 bytes,
    /// keeping sp 16-aligned throughout. x0 = save, x1 = restore.
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch(save: *mut usize, restore: *const usize) {
        naked_asm!(
            "stp x29, x30, [sp, #-160]!",
            "stp x19, x20, [sp, #16]",
            "stp x21, x22, [sp, #32]",
            "stp x23, x24, [sp, #48]",
            "stp x25, x26, [sp, #64]",
            "stp x27, x28, [sp, #80]",
            "stp d8, d9, [sp, #96]",
            "stp d10, d11, [sp, #112]",
            "stp d12, d13, [sp, #128]",
            "stp d14, d15, [sp, #144]",
            "mov x9, sp",
            "str x9, [x0]",
            "ldr x9, [x1]",
            "mov sp, x9",
            "ldp x19, x20, [sp, #16]",
            "ldp x21, x22, [sp, #32]",
            "ldp x23, x24, [sp, #48]",
            "ldp x25, x26, [sp, #64]",
            "ldp x27, x28, [sp, #80]",
            "ldp d8, d9, [sp, #96]",
            "ldp d10, d11, [sp, #112]",
            "ldp d12, d13, [sp, #128]",
            "ldp d14, d15, [sp, #144]",
            "ldp x29, x30, [sp], #160",
            "ret",
        )
    }

    /// Landing pad for the first switch into a fresh context. Entry
    /// function in x20, argument in x19; brk traps if entry ever returns.
    #[unsafe(naked)]
    unsafe extern "C" fn trampoline() {
        naked_asm!("mov x0, x19", "blr x20", "brk #1",)
    }

    pub(super) unsafe fn prepare_stack(
        top: *mut u8,
        entry: unsafe extern "C" fn(*mut u8) -> !,
        arg: *mut u8,
    ) -> usize {
        let top = (top as usize) & !15;
        let sp = top - 160;
        let frame = sp as *mut usize;
        unsafe {
            for i in 0..20 {
                frame.add(i).write(0);
            }
            frame.add(1).write(trampoline as usize); // x30: first ret target
            frame.add(2).write(arg as usize); // x19
            frame.add(3).write(entry as usize); // x20
        }
        sp
    }
}
