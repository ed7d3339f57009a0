//! Thread-local storage for the current cord
//!
//! A cord binds to exactly one OS thread for its whole lifetime; the
//! runtime stores a raw pointer to it here so fiber primitives can find
//! their scheduler without threading a handle through every call.

use std::cell::Cell;
use std::ptr;

use crate::cord::CordRuntime;

thread_local! {
    static CORD: Cell<*const CordRuntime> = const { Cell::new(ptr::null()) };
}

/// Bind the given runtime to this thread
///
/// # Safety
///
/// The pointer must stay valid until `clear_cord` runs on this thread.
pub(crate) unsafe fn set_cord(rt: *const CordRuntime) {
    CORD.with(|cell| {
        assert!(cell.get().is_null(), "thread already hosts a cord");
        cell.set(rt);
    });
}

/// Unbind the runtime from this thread
pub(crate) fn clear_cord() {
    CORD.with(|cell| cell.set(ptr::null()));
}

/// Current cord, panicking outside one
///
/// The returned reference is valid for the duration of the cord's run on
/// this thread; fiber code never outlives its cord.
#[inline]
pub(crate) fn cord() -> &'static CordRuntime {
    let ptr = CORD.with(|cell| cell.get());
    assert!(!ptr.is_null(), "not running inside a cord");
    unsafe { &*ptr }
}

/// Check whether this thread hosts a cord
#[inline]
pub fn is_in_cord() -> bool {
    CORD.with(|cell| !cell.get().is_null())
}
