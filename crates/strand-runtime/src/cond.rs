//! Fiber condition variables
//!
//! A wait list of suspended fibers. `signal` wakes the head (FIFO),
//! `broadcast` wakes everyone; wakeups are coalesced through the cord's
//! ready queue. Waits are cancellation checkpoints and may return
//! spuriously on an unrelated `wakeup` of the waiter, so callers re-check
//! their predicate in a loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use strand_core::error::{Error, FiberResult};

use crate::fiber::{self, Fiber};
use crate::tls;

/// Condition variable for fibers of one cord
pub struct FiberCond {
    waiters: RefCell<VecDeque<Weak<Fiber>>>,
}

impl FiberCond {
    pub fn new() -> FiberCond {
        FiberCond {
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    /// Wake the first waiter, if any
    pub fn signal(&self) {
        let next = {
            let mut ws = self.waiters.borrow_mut();
            loop {
                match ws.pop_front() {
                    Some(w) => {
                        if let Some(f) = w.upgrade() {
                            break Some(f);
                        }
                    }
                    None => break None,
                }
            }
        };
        if let Some(f) = next {
            f.wakeup();
        }
    }

    /// Wake every waiter
    pub fn broadcast(&self) {
        let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for w in drained {
            if let Some(f) = w.upgrade() {
                f.wakeup();
            }
        }
    }

    /// Wait until signalled
    ///
    /// Cancellation checkpoint; may also return on a spurious wakeup.
    pub fn wait(&self) -> FiberResult<()> {
        self.wait_deadline(f64::INFINITY)
    }

    /// Wait until signalled or `timeout` seconds elapse
    pub fn wait_timeout(&self, timeout: f64) -> FiberResult<()> {
        self.wait_deadline(tls::cord().now() + timeout)
    }

    /// Wait until signalled or the absolute deadline passes
    ///
    /// Fails with `TimedOut` when the deadline is hit; a deadline at or
    /// before the current time fails immediately without yielding.
    pub fn wait_deadline(&self, deadline: f64) -> FiberResult<()> {
        fiber::testcancel()?;

        let c = tls::cord();
        let cur = c.current_fiber();
        if c.now() >= deadline {
            cur.set_diag(Error::TimedOut);
            return Err(Error::TimedOut);
        }

        self.waiters.borrow_mut().push_back(Rc::downgrade(&cur));
        fiber::sleep_until(deadline);

        // Signalled waiters were removed from the list by signal/broadcast
        let signalled = {
            let mut ws = self.waiters.borrow_mut();
            let before = ws.len();
            ws.retain(|w| w.as_ptr() != Rc::as_ptr(&cur));
            ws.len() == before
        };

        fiber::testcancel()?;

        if signalled {
            return Ok(());
        }
        if c.now() >= deadline {
            cur.set_diag(Error::TimedOut);
            return Err(Error::TimedOut);
        }
        // Spurious wakeup: surfaced to the caller, which re-checks its
        // predicate
        Ok(())
    }

    /// Number of fibers currently waiting
    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}

impl Default for FiberCond {
    fn default() -> Self {
        Self::new()
    }
}
