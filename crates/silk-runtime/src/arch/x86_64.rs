//! x86_64 context switching
//!
//! Inline assembly over the System V callee-saved set. A context holds rsp,
//! a resume address, and rbx/rbp/r12-r15; everything else is caller-saved and
//! dead at a voluntary switch point.

use std::arch::naked_asm;

/// Saved execution context for one coroutine
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedContext {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prime a fresh context so the first switch into it enters the trampoline.
///
/// The entry function and its argument ride in r12/r13 (callee-saved, so the
/// switch restores them) and the trampoline moves them into place.
///
/// # Safety
///
/// `ctx` must point to valid `SavedContext` memory and `stack_top` must be
/// the high end of a live stack mapping.
pub unsafe fn init_context(
    ctx: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned per the System V AMD64 ABI; the trampoline's `call`
    // then produces the expected entry alignment.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First instructions a new coroutine executes
///
/// Calls `entry_fn(entry_arg)`. The entry function terminates by switching
/// away permanently; if control ever comes back here the coroutine contract
/// is broken and the process aborts.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {overrun}",
        "ud2",
        overrun = sym trampoline_overrun,
    );
}

extern "C" fn trampoline_overrun() {
    silk_core::fatal!("control returned past a coroutine's terminal switch");
}

/// Save the current execution context into `old` and resume `new`.
///
/// Returns when some later switch restores `old`.
///
/// # Safety
///
/// Both pointers must reference valid contexts; `new` must have been primed
/// by `init_context` or filled by a previous switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedContext, _new: *const SavedContext) {
    naked_asm!(
        // Save callee-saved registers into old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the resume point
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
