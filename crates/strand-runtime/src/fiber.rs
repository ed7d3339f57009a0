//! Fiber objects and the primitives that operate on the current fiber
//!
//! A fiber is a cooperatively scheduled execution context with its own
//! stack, owned by exactly one cord. Non-joinable fibers are recycled
//! into the cord's cache on termination (stack and context retained, all
//! other residue reset on re-acquire); joinable fibers persist until
//! exactly one `join`.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use strand_core::error::{Error, FiberResult};
use strand_core::say_error;
use strand_core::state::{flags, FiberState};

use crate::current_arch::Context;
use crate::region::Region;
use crate::stack::Stack;
use crate::tls;

/// Maximum fiber name length; longer names are silently truncated to
/// `FIBER_NAME_MAX - 1` bytes.
pub const FIBER_NAME_MAX: usize = 64;

/// Shared handle to a fiber. Cord-local (not `Send`); a handle kept after
/// a non-joinable fiber dies may observe the recycled object.
pub type FiberRef = Rc<Fiber>;

/// Entry function of a fiber
pub type FiberEntry = Box<dyn FnOnce() -> FiberResult<i32> + 'static>;

static LEAK_BACKTRACE: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
static ABORT_ON_GC_LEAK: AtomicBool = AtomicBool::new(false);

/// Toggle capturing a backtrace at the first gc allocation of each fiber
pub fn leak_backtrace_enable(enable: bool) {
    LEAK_BACKTRACE.store(enable, Ordering::Relaxed);
}

/// Check whether leak backtraces are being captured
pub fn leak_backtrace_enabled() -> bool {
    LEAK_BACKTRACE.load(Ordering::Relaxed)
}

/// Toggle aborting the process when a fiber dies with gc allocations
pub fn abort_on_gc_leak(enable: bool) {
    ABORT_ON_GC_LEAK.store(enable, Ordering::Relaxed);
}

/// Check the abort-on-leak policy
pub fn abort_on_gc_leak_enabled() -> bool {
    ABORT_ON_GC_LEAK.load(Ordering::Relaxed)
}

/// Fiber creation attributes
///
/// Copied into the fiber at creation; later edits do not affect existing
/// fibers. Only `JOINABLE` may be carried in the flags.
#[derive(Debug, Clone)]
pub struct FiberAttr {
    /// Usable stack size in bytes (rounded up to whole pages)
    pub stack_size: usize,
    flags: u32,
}

impl FiberAttr {
    /// Attributes with the current cord's defaults
    pub fn new() -> Self {
        let stack_size = if tls::is_in_cord() {
            tls::cord().config().stack_size
        } else {
            crate::stack::DEFAULT_STACK_SIZE
        };
        Self {
            stack_size,
            flags: 0,
        }
    }

    /// Set the usable stack size
    pub fn set_stack_size(&mut self, size: usize) -> &mut Self {
        self.stack_size = size;
        self
    }

    /// Request a joinable fiber
    pub fn set_joinable(&mut self, joinable: bool) -> &mut Self {
        if joinable {
            self.flags |= flags::JOINABLE;
        } else {
            self.flags &= !flags::JOINABLE;
        }
        self
    }

    #[inline]
    pub(crate) fn flags(&self) -> u32 {
        self.flags & flags::ATTR_MASK
    }
}

impl Default for FiberAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// A cooperatively scheduled execution context
pub struct Fiber {
    /// Back-reference to the owning `Rc`, so `&self` methods can enqueue
    /// strong handles
    myself: Weak<Fiber>,
    fid: Cell<u64>,
    name: RefCell<String>,
    flags: Cell<u32>,
    state: Cell<FiberState>,
    entry: RefCell<Option<FiberEntry>>,
    result: Cell<i32>,
    diag: RefCell<Option<Error>>,
    /// Fibers suspended until this one dies (joiner and deadline waiters)
    waiters: RefCell<Vec<Weak<Fiber>>>,
    stack: RefCell<Option<Stack>>,
    ctx: UnsafeCell<Context>,
    /// Per-fiber scratch region, reset on recycle
    gc: Region,
}

impl Fiber {
    pub(crate) fn new_with_stack(
        fid: u64,
        name: &str,
        attr: &FiberAttr,
        stack: Stack,
    ) -> FiberRef {
        let f = Rc::new_cyclic(|myself| Fiber {
            myself: myself.clone(),
            fid: Cell::new(fid),
            name: RefCell::new(String::new()),
            flags: Cell::new(flags::DEFAULT | attr.flags()),
            state: Cell::new(FiberState::Fresh),
            entry: RefCell::new(None),
            result: Cell::new(0),
            diag: RefCell::new(None),
            waiters: RefCell::new(Vec::new()),
            stack: RefCell::new(Some(stack)),
            ctx: UnsafeCell::new(Context::new()),
            gc: Region::with_leak_capture(),
        });
        f.set_name(name);
        f
    }

    /// The scheduler sentinel: no stack of its own, runs on the cord's
    /// thread stack.
    pub(crate) fn sched_sentinel(name: &str) -> FiberRef {
        let f = Rc::new_cyclic(|myself| Fiber {
            myself: myself.clone(),
            fid: Cell::new(0),
            name: RefCell::new(String::new()),
            flags: Cell::new(0),
            state: Cell::new(FiberState::Running),
            entry: RefCell::new(None),
            result: Cell::new(0),
            diag: RefCell::new(None),
            waiters: RefCell::new(Vec::new()),
            stack: RefCell::new(None),
            ctx: UnsafeCell::new(Context::new()),
            gc: Region::new(),
        });
        f.set_name(name);
        f
    }

    /// Strong handle to this fiber
    fn strong(&self) -> FiberRef {
        self.myself.upgrade().expect("fiber object detached")
    }

    /// Reset a cached fiber for re-use
    ///
    /// Flags come from the supplied attributes; every other piece of cache
    /// residue (name, diagnostics, waiters, result, state) is cleared. The
    /// saved context and stack are intentionally untouched: the fiber loop
    /// is parked there and resumes with the new entry.
    pub(crate) fn reacquire(&self, fid: u64, name: &str, attr: &FiberAttr, entry: FiberEntry) {
        self.fid.set(fid);
        self.set_name(name);
        self.flags.set(flags::DEFAULT | attr.flags());
        self.state.set(FiberState::Fresh);
        *self.entry.borrow_mut() = Some(entry);
        self.result.set(0);
        *self.diag.borrow_mut() = None;
        self.waiters.borrow_mut().clear();
        debug_assert_eq!(self.gc.used(), 0);
    }

    // Accessors

    /// Fiber identifier, monotone per cord
    #[inline]
    pub fn id(&self) -> u64 {
        self.fid.get()
    }

    /// Current name (possibly truncated at assignment)
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// Rename the fiber; silently truncated to `FIBER_NAME_MAX - 1` bytes
    pub fn set_name(&self, name: &str) {
        let limit = FIBER_NAME_MAX - 1;
        let mut end = limit.min(name.len());
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        *self.name.borrow_mut() = name[..end].to_string();
    }

    #[inline]
    pub(crate) fn state(&self) -> FiberState {
        self.state.get()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.set(state);
    }

    #[inline]
    fn has_flag(&self, flag: u32) -> bool {
        self.flags.get() & flag != 0
    }

    #[inline]
    fn set_flag(&self, flag: u32) {
        self.flags.set(self.flags.get() | flag);
    }

    #[inline]
    fn clear_flag(&self, flag: u32) {
        self.flags.set(self.flags.get() & !flag);
    }

    /// Check if the fiber has terminated
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state.get().is_dead()
    }

    /// Check if cancellation was requested
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.has_flag(flags::CANCELLED)
    }

    /// Check if the fiber persists after death until `join`
    #[inline]
    pub fn is_joinable(&self) -> bool {
        self.has_flag(flags::JOINABLE)
    }

    /// Mark the fiber joinable (or not); only meaningful before it dies
    pub fn set_joinable(&self, joinable: bool) {
        if joinable {
            self.set_flag(flags::JOINABLE);
        } else {
            self.clear_flag(flags::JOINABLE);
        }
    }

    /// Opt out of (or back into) cancellation delivery
    pub fn set_cancellable(&self, cancellable: bool) {
        if cancellable {
            self.set_flag(flags::CANCELLABLE);
        } else {
            self.clear_flag(flags::CANCELLABLE);
        }
    }

    /// The fiber's scratch region
    #[inline]
    pub fn gc(&self) -> &Region {
        &self.gc
    }

    /// Last error recorded in this fiber's diagnostic slot
    pub fn last_error(&self) -> Option<Error> {
        self.diag.borrow().clone()
    }

    /// Record an error in the diagnostic slot
    pub fn set_diag(&self, e: Error) {
        *self.diag.borrow_mut() = Some(e);
    }

    #[inline]
    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    pub(crate) fn entry_slot(&self) -> std::cell::RefMut<'_, Option<FiberEntry>> {
        self.entry.borrow_mut()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack.borrow().as_ref().map_or(0, |s| s.size())
    }

    pub(crate) fn take_stack(&self) -> Option<Stack> {
        self.stack.borrow_mut().take()
    }

    pub(crate) fn take_diag(&self) -> Option<Error> {
        self.diag.borrow_mut().take()
    }

    #[inline]
    pub(crate) fn exit_code(&self) -> i32 {
        self.result.get()
    }

    pub(crate) fn record_exit(&self, code: i32, diag: Option<Error>) {
        self.result.set(code);
        *self.diag.borrow_mut() = diag;
    }

    // Scheduling operations

    /// Make the fiber runnable
    ///
    /// Appends to the cord's ready queue if the fiber is fresh or
    /// suspended. A no-op on the running fiber (self-wakeup never
    /// collapses a later sleep), on an already-queued fiber, and on a dead
    /// fiber.
    pub fn wakeup(&self) {
        match self.state.get() {
            FiberState::Fresh | FiberState::Suspended => {
                self.state.set(FiberState::Ready);
                tls::cord().push_ready(self.strong());
            }
            FiberState::Ready | FiberState::Running | FiberState::Dead => {}
        }
    }

    /// Wake the fiber and switch to it immediately
    ///
    /// Equivalent to `wakeup` followed by yielding to it: the caller goes
    /// to the ready-queue tail and resumes in FIFO order.
    pub fn start(&self) {
        let c = tls::cord();
        assert!(!self.is_dead(), "starting a dead fiber");
        let cur = c.current_fiber();
        assert!(
            !std::ptr::eq(self, Rc::as_ptr(&cur)),
            "a fiber cannot start itself"
        );

        if self.state.get() == FiberState::Ready {
            c.remove_ready(self);
        }
        cur.set_state(FiberState::Ready);
        c.push_ready(cur.clone());
        drop(cur);
        c.switch_to(self.strong());
    }

    /// Request cooperative cancellation and wake the fiber
    ///
    /// The target observes cancellation at its next checkpoint. A no-op on
    /// a dead fiber (it is never re-scheduled).
    pub fn cancel(&self) {
        self.set_flag(flags::CANCELLED);
        if !self.is_dead() {
            self.wakeup();
        }
    }

    /// Suspend the caller until this fiber dies, then harvest it
    ///
    /// Returns the fiber's exit code, or its terminal diagnostic as `Err`
    /// (also copied into the caller's diagnostic slot). Exactly one join
    /// succeeds; the fiber is recycled afterwards.
    ///
    /// # Panics
    ///
    /// Joining a non-joinable fiber is a programming error.
    pub fn join(&self) -> FiberResult<i32> {
        assert!(self.is_joinable(), "joining a non-joinable fiber");
        let exceeded = self.wait_on_deadline(f64::INFINITY);
        debug_assert!(!exceeded);

        self.clear_flag(flags::JOINABLE);
        let diag = self.take_diag();
        let code = self.exit_code();
        let c = tls::cord();
        c.recycle(self.strong());
        match diag {
            Some(e) => {
                c.current_fiber().set_diag(e.clone());
                Err(e)
            }
            None => Ok(code),
        }
    }

    /// Suspend the caller until this fiber dies or the deadline passes
    ///
    /// Returns whether the deadline was exceeded. Does not cancel the
    /// fiber. A deadline at or before the current time returns `true`
    /// without yielding.
    pub fn wait_on_deadline(&self, deadline: f64) -> bool {
        let c = tls::cord();
        let cur = c.current_fiber();
        assert!(
            !std::ptr::eq(self, Rc::as_ptr(&cur)),
            "a fiber cannot wait on itself"
        );

        loop {
            if self.is_dead() {
                return false;
            }
            if c.now() >= deadline {
                return true;
            }
            self.add_waiter(&cur);
            sleep_until(deadline);
            self.remove_waiter(&cur);
        }
    }

    fn add_waiter(&self, w: &FiberRef) {
        let mut ws = self.waiters.borrow_mut();
        if !ws.iter().any(|x| x.as_ptr() == Rc::as_ptr(w)) {
            ws.push(Rc::downgrade(w));
        }
    }

    fn remove_waiter(&self, w: &FiberRef) {
        self.waiters
            .borrow_mut()
            .retain(|x| x.as_ptr() != Rc::as_ptr(w));
    }

    /// Wake everything suspended on this fiber's termination
    pub(crate) fn wake_waiters(&self) {
        let ws: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for w in ws {
            if let Some(f) = w.upgrade() {
                f.wakeup();
            }
        }
    }

    /// Report (and discard) leftover gc allocations at termination
    pub(crate) fn report_gc_leak(&self) {
        if self.gc.used() > 0 {
            #[cfg(feature = "leak-backtrace")]
            {
                match self.gc.take_leak_origin() {
                    Some(bt) => say_error!(
                        "Fiber gc leak is found. \
                         First leaked fiber gc allocation backtrace:\n{}",
                        bt
                    ),
                    None => say_error!(
                        "Fiber gc leak is found. Leak backtrace is not available. \
                         Make sure fiber::leak_backtrace_enable() is called before \
                         starting this fiber to obtain the backtrace."
                    ),
                }
            }
            #[cfg(not(feature = "leak-backtrace"))]
            say_error!("Fiber gc leak is found. Leak backtrace is not available on your platform.");

            if abort_on_gc_leak_enabled() {
                std::process::abort();
            }
        }
        self.gc.reset();
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.fid.get())
            .field("name", &*self.name.borrow())
            .field("state", &self.state.get())
            .finish()
    }
}

// Free functions operating on the current fiber

/// Create a fiber with the cord's default attributes
pub fn new<F>(name: &str, f: F) -> FiberResult<FiberRef>
where
    F: FnOnce() -> FiberResult<i32> + 'static,
{
    new_ex(name, &FiberAttr::new(), f)
}

/// Create a fiber with explicit attributes
///
/// The fiber may come from the cord's recycle cache; its flags are reset
/// from `attr` either way.
pub fn new_ex<F>(name: &str, attr: &FiberAttr, f: F) -> FiberResult<FiberRef>
where
    F: FnOnce() -> FiberResult<i32> + 'static,
{
    tls::cord().new_fiber(name, attr, Box::new(f))
}

/// Handle to the fiber this call runs in (the sched sentinel from hooks)
pub fn current() -> FiberRef {
    tls::cord().current_fiber()
}

/// Move the current fiber to the ready-queue tail and run the scheduler
pub fn yield_now() {
    let c = tls::cord();
    let cur = c.current_fiber();
    if Rc::ptr_eq(&cur, c.sched_fiber()) {
        return;
    }
    cur.set_state(FiberState::Ready);
    c.push_ready(cur.clone());
    drop(cur);
    c.switch_to_sched();
}

/// Suspend the current fiber without queueing it
///
/// The caller must have arranged a future wakeup (or accepts staying
/// suspended indefinitely).
pub fn reschedule() {
    let c = tls::cord();
    let cur = c.current_fiber();
    if Rc::ptr_eq(&cur, c.sched_fiber()) {
        return;
    }
    cur.set_state(FiberState::Suspended);
    drop(cur);
    c.switch_to_sched();
}

/// Sleep for `delay` seconds of cord-monotonic time
///
/// Zero or negative delay is equivalent to a yield. The sleep always
/// consults the timer, never the ready flag, so a preceding self-wakeup
/// does not collapse it. An explicit `wakeup` from elsewhere may end the
/// sleep early. Cancellation checkpoint.
pub fn sleep(delay: f64) -> FiberResult<()> {
    testcancel()?;
    if delay <= 0.0 {
        yield_now();
        return testcancel();
    }
    let deadline = tls::cord().now() + delay;
    sleep_until(deadline);
    testcancel()
}

/// Suspend until `deadline` (cord-monotonic seconds) or an explicit wakeup
pub(crate) fn sleep_until(deadline: f64) {
    let c = tls::cord();
    let handle = if deadline.is_finite() {
        let cur = c.current_fiber();
        Some(c.timers().insert(deadline, Rc::downgrade(&cur)))
    } else {
        None
    };
    reschedule();
    if let Some(h) = handle {
        c.timers().cancel(h);
    }
}

/// Observe pending cancellation
///
/// Fails with `FiberIsCancelled` (recorded in the diagnostic slot) if the
/// current fiber is cancellable and was cancelled.
pub fn testcancel() -> FiberResult<()> {
    let cur = tls::cord().current_fiber();
    if cur.has_flag(flags::CANCELLED) && cur.has_flag(flags::CANCELLABLE) {
        cur.set_diag(Error::FiberIsCancelled);
        return Err(Error::FiberIsCancelled);
    }
    Ok(())
}

/// Cord-monotonic time in seconds, cached per event-loop iteration
pub fn clock() -> f64 {
    tls::cord().now()
}

/// Cord-monotonic time in nanoseconds
pub fn clock64() -> u64 {
    (tls::cord().now() * 1e9) as u64
}

/// The loop every fiber stack runs: take the entry, run it, report the
/// outcome, park in the scheduler. A recycled fiber resumes here with a
/// fresh entry installed.
pub(crate) extern "C" fn fiber_loop(arg: usize) {
    let fiber_ptr = arg as *const Fiber;
    loop {
        let entry = unsafe { &*fiber_ptr }
            .entry
            .borrow_mut()
            .take()
            .expect("fiber dispatched without an entry");
        let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
        let c = tls::cord();
        c.finish_current(outcome);
        c.switch_to_sched();
    }
}
