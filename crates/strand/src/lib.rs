//! # strand - cooperative fibers on single-threaded event loops
//!
//! A *fiber* is a lightweight unit of execution with its own stack,
//! scheduled cooperatively inside one OS thread (a *cord*). Fibers
//! surrender control at well-defined suspension points; there is no
//! preemption inside a cord. Cords are independent schedulers that
//! coordinate only through explicit handshakes (start, join, cojoin,
//! cooperative cancellation).
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::cord::Cord;
//! use strand::fiber;
//!
//! fn main() {
//!     let status = Cord::run("main", || {
//!         let f = fiber::new("worker", || {
//!             fiber::sleep(0.01)?;
//!             Ok(7)
//!         })?;
//!         f.set_joinable(true);
//!         f.wakeup();
//!         f.join()
//!     })
//!     .unwrap();
//!     assert_eq!(status, 7);
//! }
//! ```
//!
//! ## Crates
//!
//! - `strand-core` - errors, fiber state, logging
//! - `strand-runtime` - stacks, context switch, scheduler, cords
//! - `strand-http` - fiber-cooperative streaming HTTP client

// Re-export core types
pub use strand_core::error::{Error, FiberResult};
pub use strand_core::say;
pub use strand_core::say::{LogFormat, LogLevel};
pub use strand_core::state::FiberState;
pub use strand_core::{say_debug, say_error, say_info, say_trace, say_warn};
pub use strand_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use strand_runtime::cond::FiberCond;
pub use strand_runtime::cord;
pub use strand_runtime::cord::Cord;
pub use strand_runtime::fiber;
pub use strand_runtime::fiber::{Fiber, FiberAttr, FiberRef, FIBER_NAME_MAX};
pub use strand_runtime::region::Region;
pub use strand_runtime::CordConfig;

// Re-export the HTTP client
pub use strand_http as httpc;
pub use strand_http::{HttpEnv, HttpRequest, HttpStats};
