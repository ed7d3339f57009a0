//! x86_64 context switching implementation
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved registers per the System V AMD64 ABI.
///
/// Layout (offsets are load-bearing for the assembly below):
/// ```text
/// 0x00: rsp
/// 0x08: rip
/// 0x10: rbx
/// 0x18: rbp
/// 0x20: r12
/// 0x28: r13
/// 0x30: r14
/// 0x38: r15
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    pub const fn new() -> Self {
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

/// Initialize a fresh fiber context
///
/// Sets up the register state so that the first `swap_context` into `ctx`
/// begins execution in the entry trampoline, which calls
/// `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` to the top
/// of a mapped stack (grows down).
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned before the trampoline's `call`, so the entry
    // function sees the ABI-mandated rsp % 16 == 8
    let sp = stack_top as usize;
    let aligned_sp = sp & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// The entry function never returns (the fiber loop re-enters the
/// scheduler on termination); `ud2` traps if it somehow does.
#[unsafe(naked)]
pub unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save callee-saved registers into `from`, restore `to`, continue there
///
/// Returns when some later switch restores `from`.
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save callee-saved registers to from (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from to (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the restored RIP
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
