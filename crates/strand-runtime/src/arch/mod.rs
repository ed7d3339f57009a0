//! Architecture-specific context switching
//!
//! Each backend exposes the same surface:
//!
//! - `Context` - callee-saved register save area, `repr(C)` with stable
//!   offsets for the assembly
//! - `init_context` - prepare a fresh stack so the first switch lands in
//!   the entry trampoline
//! - `swap_context` - save the current callee-saved state into `from`,
//!   restore `to`, and continue there

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
