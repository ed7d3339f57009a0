//! # strand-runtime
//!
//! The fiber engine: cooperative user-space fibers scheduled inside
//! single-threaded event loops ("cords").
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Guard-paged fiber stacks (mmap)
//! - Per-fiber scratch regions with leak detection
//! - Fiber lifecycle, recycle cache, join and cancellation
//! - Per-cord scheduler: FIFO ready queue, timer heap, event loop
//! - Condition variables and cross-cord cojoin

pub mod arch;
pub mod stack;
pub mod region;
pub mod timer;
pub mod tls;
pub mod config;
pub mod cond;
pub mod fiber;
pub mod cord;

// Re-exports
pub use config::CordConfig;
pub use cond::FiberCond;
pub use fiber::{Fiber, FiberAttr, FiberRef, FIBER_NAME_MAX};
pub use cord::{Cord, LoopHook};
pub use region::Region;

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

#[cfg(not(unix))]
compile_error!("strand-runtime requires a Unix platform (mmap fiber stacks)");

pub use current_arch::Context;
