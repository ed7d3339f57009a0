//! Fiber state machine and flag constants

use core::fmt;

/// State of a fiber
///
/// A fiber is in at most one state at a time. `Fresh` fibers have never
/// been woken; `Dead` fibers either wait for `join` (joinable) or sit in
/// the recycle cache until re-acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created (or re-acquired from the cache), not yet woken
    Fresh = 0,

    /// Eligible to run, queued on the cord's ready queue
    Ready = 1,

    /// Currently executing on its cord
    Running = 2,

    /// Suspended at a yield point, waiting for a wakeup or timer
    Suspended = 3,

    /// Entry function returned; terminal until join or re-acquire
    Dead = 4,
}

impl FiberState {
    /// Check if the fiber may be dispatched by the scheduler
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has terminated
    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, FiberState::Dead)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Fresh => write!(f, "fresh"),
            FiberState::Ready => write!(f, "ready"),
            FiberState::Running => write!(f, "running"),
            FiberState::Suspended => write!(f, "suspended"),
            FiberState::Dead => write!(f, "dead"),
        }
    }
}

/// Fiber flag bits
///
/// Attributes may only carry `JOINABLE`; the rest is runtime state.
/// Fibers taken from the recycle cache have their flags reset from the
/// supplied attributes, so cache residue never leaks into a new fiber.
pub mod flags {
    /// Storage persists after death until exactly one successful `join`
    pub const JOINABLE: u32 = 1 << 0;

    /// Cancellation is deliverable at checkpoints (default on)
    pub const CANCELLABLE: u32 = 1 << 1;

    /// Cancellation was requested
    pub const CANCELLED: u32 = 1 << 2;

    /// Flags an attribute is allowed to carry
    pub const ATTR_MASK: u32 = JOINABLE;

    /// Flags every new or re-acquired fiber starts with
    pub const DEFAULT: u32 = CANCELLABLE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Running.is_runnable());
        assert!(!FiberState::Suspended.is_runnable());

        assert!(FiberState::Dead.is_dead());
        assert!(!FiberState::Fresh.is_dead());
    }

    #[test]
    fn test_attr_mask_excludes_runtime_flags() {
        assert_eq!(flags::ATTR_MASK & flags::CANCELLED, 0);
        assert_eq!(flags::ATTR_MASK & flags::CANCELLABLE, 0);
        assert_eq!(flags::ATTR_MASK, flags::JOINABLE);
    }
}
