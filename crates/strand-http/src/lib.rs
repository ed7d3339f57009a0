//! # strand-http
//!
//! Fiber-cooperative HTTP client built on libcurl's multi interface.
//!
//! The transport's read/write/header callbacks run on the cord's event
//! loop and hand data to fibers through condition variables; a fiber
//! doing `io_read`/`io_write` suspends until the transport catches up,
//! never blocking the cord.

pub mod buf;
pub mod env;
pub mod request;

pub use buf::IBuf;
pub use env::{HttpEnv, HttpStats};
pub use request::HttpRequest;

/// Largest header line accepted by `set_header`
pub const MAX_HEADER_LEN: usize = 8192;
