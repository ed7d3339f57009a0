//! Cords: OS threads hosting one fiber scheduler and event loop each
//!
//! A cord owns a FIFO ready queue, a timer heap, a recycled-fiber cache,
//! and the sched sentinel whose context is the thread's own stack. All of
//! that state is cord-local and mutated only by the cord's fibers; the
//! only cross-thread surface is the inbox (remote wakeups, cooperative
//! cancellation) and the exit handshake.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use strand_core::error::{Error, FiberResult};
use strand_core::state::FiberState;
use strand_core::{say_debug, say_error};

use crate::config::CordConfig;
use crate::current_arch::{init_context, swap_context};
use crate::fiber::{self, fiber_loop, Fiber, FiberAttr, FiberEntry, FiberRef};
use crate::stack::{align_stack_size, StackAllocator};
use crate::timer::TimerHeap;
use crate::tls;

/// Longest single park while work may still arrive
const MAX_PARK: f64 = 3600.0;

/// Cross-thread messages delivered through a cord's inbox
pub(crate) enum Msg {
    /// Wake the registered remote waiter with this fiber id
    Wakeup(u64),
    /// Deliver cooperative cancellation to the main fiber
    CancelMain,
}

/// State a cord shares with other threads
pub(crate) struct CordShared {
    name: String,
    inbox: SegQueue<Msg>,
    /// Parking for the idle event loop; the bool absorbs posts that race
    /// with the park
    park: Mutex<bool>,
    cv: Condvar,
    exited: AtomicBool,
    /// Terminal (exit code, diagnostic) of the main fiber
    result: Mutex<Option<(i32, Option<Error>)>>,
    /// Cords to notify (inbox + fiber id) when this cord exits
    exit_waiters: Mutex<Vec<(Arc<CordShared>, u64)>>,
}

impl CordShared {
    fn new(name: &str) -> CordShared {
        CordShared {
            name: name.to_string(),
            inbox: SegQueue::new(),
            park: Mutex::new(false),
            cv: Condvar::new(),
            exited: AtomicBool::new(false),
            result: Mutex::new(None),
            exit_waiters: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn post(&self, msg: Msg) {
        self.inbox.push(msg);
        let mut notified = self.park.lock().unwrap();
        *notified = true;
        self.cv.notify_one();
    }

    fn park(&self, timeout: Option<Duration>) {
        let mut notified = self.park.lock().unwrap();
        if !*notified {
            match timeout {
                Some(d) => {
                    let (guard, _) = self.cv.wait_timeout(notified, d).unwrap();
                    notified = guard;
                }
                None => {
                    notified = self.cv.wait(notified).unwrap();
                }
            }
        }
        *notified = false;
    }

    fn exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Register for an exit notification; posts immediately if the cord is
    /// already gone
    fn add_exit_waiter(&self, cord: Arc<CordShared>, fid: u64) {
        let mut ws = self.exit_waiters.lock().unwrap();
        if self.exited() {
            drop(ws);
            cord.post(Msg::Wakeup(fid));
            return;
        }
        ws.push((cord, fid));
    }

    fn announce_exit(&self) {
        let waiters = {
            let mut ws = self.exit_waiters.lock().unwrap();
            self.exited.store(true, Ordering::Release);
            std::mem::take(&mut *ws)
        };
        for (cord, fid) in waiters {
            cord.post(Msg::Wakeup(fid));
        }
    }
}

/// Something the event loop services once per idle iteration
///
/// The HTTP transport driver implements this to pump its multi handle.
pub trait LoopHook {
    /// Do pending work; return the absolute cord-time deadline at which
    /// the hook next wants service, if any.
    fn service(&self, now: f64) -> Option<f64>;
}

/// Per-thread scheduler state; reachable through `tls::cord()`
pub(crate) struct CordRuntime {
    name: String,
    shared: Arc<CordShared>,
    config: CordConfig,
    sched: FiberRef,
    current: RefCell<FiberRef>,
    main: RefCell<Option<FiberRef>>,
    ready: RefCell<VecDeque<FiberRef>>,
    timers: TimerHeap,
    /// Recycled fibers keyed by usable stack size
    cache: RefCell<HashMap<usize, Vec<FiberRef>>>,
    stacks: StackAllocator,
    /// Live fiber objects, cached ones included
    fiber_count: Cell<usize>,
    next_fid: Cell<u64>,
    epoch: Instant,
    now: Cell<f64>,
    break_requested: Cell<bool>,
    /// Fibers expecting a cross-cord wakeup, by fiber id
    remote_waiters: RefCell<HashMap<u64, Weak<Fiber>>>,
    hooks: RefCell<Vec<Weak<dyn LoopHook>>>,
}

impl CordRuntime {
    fn new(name: String, shared: Arc<CordShared>, config: CordConfig) -> CordRuntime {
        let sched = Fiber::sched_sentinel("sched");
        CordRuntime {
            name,
            shared,
            config,
            current: RefCell::new(sched.clone()),
            sched,
            main: RefCell::new(None),
            ready: RefCell::new(VecDeque::new()),
            timers: TimerHeap::new(),
            cache: RefCell::new(HashMap::new()),
            stacks: StackAllocator::new(),
            fiber_count: Cell::new(0),
            next_fid: Cell::new(1),
            epoch: Instant::now(),
            now: Cell::new(0.0),
            break_requested: Cell::new(false),
            remote_waiters: RefCell::new(HashMap::new()),
            hooks: RefCell::new(Vec::new()),
        }
    }

    /// Host a cord on the calling thread until its main fiber dies
    fn host<F>(
        shared: Arc<CordShared>,
        config: CordConfig,
        name: String,
        entry: F,
        started_tx: Option<std::sync::mpsc::Sender<()>>,
    ) where
        F: FnOnce() -> FiberResult<i32> + 'static,
    {
        config.validate().expect("invalid cord configuration");
        let rt = Box::new(CordRuntime::new(name, shared.clone(), config));
        unsafe { tls::set_cord(&*rt) };
        say_debug!("cord '{}' started", rt.name);

        let main = rt
            .new_fiber("main", &FiberAttr::new(), Box::new(entry))
            .expect("failed to allocate the main fiber");
        *rt.main.borrow_mut() = Some(main.clone());
        main.wakeup();
        drop(main);

        if let Some(tx) = started_tx {
            let _ = tx.send(());
        }

        rt.scheduler_loop();

        let (code, diag) = {
            let main = rt.main.borrow();
            let main = main.as_ref().unwrap();
            (main.exit_code(), main.last_error())
        };
        *shared.result.lock().unwrap() = Some((code, diag));
        say_debug!("cord '{}' exiting with status {}", rt.name, code);
        shared.announce_exit();

        tls::clear_cord();
        drop(rt);
    }

    // Accessors used by fiber primitives

    #[inline]
    pub(crate) fn config(&self) -> &CordConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn now(&self) -> f64 {
        self.now.get()
    }

    #[inline]
    pub(crate) fn timers(&self) -> &TimerHeap {
        &self.timers
    }

    pub(crate) fn current_fiber(&self) -> FiberRef {
        self.current.borrow().clone()
    }

    pub(crate) fn sched_fiber(&self) -> &FiberRef {
        &self.sched
    }

    pub(crate) fn shared(&self) -> Arc<CordShared> {
        self.shared.clone()
    }

    pub(crate) fn fiber_count(&self) -> usize {
        self.fiber_count.get()
    }

    pub(crate) fn stacks(&self) -> &StackAllocator {
        &self.stacks
    }

    fn update_now(&self) {
        self.now.set(self.epoch.elapsed().as_secs_f64());
    }

    // Ready queue

    pub(crate) fn push_ready(&self, f: FiberRef) {
        debug_assert!(f.state().is_runnable());
        self.ready.borrow_mut().push_back(f);
    }

    pub(crate) fn remove_ready(&self, f: &Fiber) {
        let ptr = f as *const Fiber;
        self.ready.borrow_mut().retain(|x| Rc::as_ptr(x) != ptr);
    }

    // Fiber allocation and recycling

    pub(crate) fn new_fiber(
        &self,
        name: &str,
        attr: &FiberAttr,
        entry: FiberEntry,
    ) -> FiberResult<FiberRef> {
        let size = align_stack_size(attr.stack_size);
        let fid = self.next_fid.get();
        self.next_fid.set(fid + 1);

        let cached = self
            .cache
            .borrow_mut()
            .get_mut(&size)
            .and_then(|list| list.pop());
        if let Some(f) = cached {
            f.reacquire(fid, name, attr, entry);
            return Ok(f);
        }

        let stack = self.stacks.allocate(size)?;
        let top = stack.top();
        let f = Fiber::new_with_stack(fid, name, attr, stack);
        *f.entry_slot() = Some(entry);
        unsafe {
            init_context(
                f.ctx_ptr(),
                top,
                fiber_loop as usize,
                Rc::as_ptr(&f) as usize,
            );
        }
        self.fiber_count.set(self.fiber_count.get() + 1);
        Ok(f)
    }

    /// Return a dead fiber to the cache; never releases the fiber object
    /// or its stack
    pub(crate) fn recycle(&self, f: FiberRef) {
        debug_assert!(f.is_dead());
        let size = f.stack_size();
        self.cache.borrow_mut().entry(size).or_default().push(f);
    }

    /// Drain the recycle cache, releasing fiber objects and their stacks
    pub(crate) fn collect_garbage_impl(&self) {
        let drained: Vec<FiberRef> = {
            let mut cache = self.cache.borrow_mut();
            cache.drain().flat_map(|(_, list)| list).collect()
        };
        for f in drained {
            if let Some(stack) = f.take_stack() {
                self.stacks.release(stack);
            }
            self.fiber_count.set(self.fiber_count.get() - 1);
        }
    }

    /// Terminal bookkeeping for the fiber that just returned
    pub(crate) fn finish_current(
        &self,
        outcome: Result<FiberResult<i32>, Box<dyn std::any::Any + Send>>,
    ) {
        let f = self.current_fiber();
        match outcome {
            Ok(Ok(code)) => f.record_exit(code, None),
            Ok(Err(e)) => f.record_exit(-1, Some(e)),
            Err(payload) => {
                let msg = panic_message(payload);
                f.record_exit(-1, Some(Error::Exception(msg)));
            }
        }

        f.report_gc_leak();
        f.set_state(FiberState::Dead);
        f.wake_waiters();

        let is_main = self
            .main
            .borrow()
            .as_ref()
            .map_or(false, |m| Rc::ptr_eq(m, &f));
        if is_main {
            self.break_requested.set(true);
        } else if !f.is_joinable() {
            if let Some(e) = f.last_error() {
                say_error!("fiber '{}' raised an uncaught failure: {}", f.name(), e);
            }
            self.recycle(f);
        }
        // Joinable fibers stay dead until join
    }

    // Context switching

    /// Switch from the current fiber to `next`; returns when the current
    /// fiber is resumed
    pub(crate) fn switch_to(&self, next: FiberRef) {
        next.set_state(FiberState::Running);
        let prev = self.current.replace(next.clone());
        let from = prev.ctx_ptr();
        let to = next.ctx_ptr();
        unsafe { swap_context(from, to) };
        // Back on `prev`'s stack
        *self.current.borrow_mut() = prev;
    }

    /// Switch from the current fiber back to the scheduler
    ///
    /// Takes no strong references: a dying fiber's frame must not pin its
    /// own object.
    pub(crate) fn switch_to_sched(&self) {
        let from = { self.current.borrow().ctx_ptr() };
        let to = self.sched.ctx_ptr();
        unsafe { swap_context(from, to) };
    }

    // Scheduler and event loop

    fn scheduler_loop(&self) {
        loop {
            if self.break_requested.get() {
                break;
            }
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some(f) => {
                    if !f.state().is_runnable() {
                        continue;
                    }
                    self.update_now();
                    self.switch_to(f);
                }
                None => self.run_once(),
            }
        }
    }

    /// One event-loop iteration: inbox, hooks, timers, then park if still
    /// idle
    fn run_once(&self) {
        self.update_now();
        self.drain_inbox();
        let hook_deadline = self.service_hooks();
        self.fire_timers();

        if !self.ready.borrow().is_empty() || self.break_requested.get() {
            return;
        }

        let mut deadline = self.timers.next_deadline();
        if let Some(h) = hook_deadline {
            deadline = Some(deadline.map_or(h, |d| d.min(h)));
        }
        let timeout = deadline.map(|d| {
            let dt = (d - self.now.get()).clamp(0.0, MAX_PARK);
            Duration::from_secs_f64(dt)
        });
        self.shared.park(timeout);
    }

    fn drain_inbox(&self) {
        while let Some(msg) = self.shared.inbox.pop() {
            match msg {
                Msg::Wakeup(fid) => {
                    let waiter = self
                        .remote_waiters
                        .borrow()
                        .get(&fid)
                        .and_then(|w| w.upgrade());
                    if let Some(f) = waiter {
                        f.wakeup();
                    }
                }
                Msg::CancelMain => {
                    let main = self.main.borrow().clone();
                    if let Some(m) = main {
                        m.cancel();
                    }
                }
            }
        }
    }

    fn fire_timers(&self) {
        for w in self.timers.fire_expired(self.now.get()) {
            if let Some(f) = w.upgrade() {
                f.wakeup();
            }
        }
    }

    fn service_hooks(&self) -> Option<f64> {
        let hooks: Vec<Rc<dyn LoopHook>> = {
            let mut slot = self.hooks.borrow_mut();
            slot.retain(|w| w.strong_count() > 0);
            slot.iter().filter_map(|w| w.upgrade()).collect()
        };
        let mut deadline: Option<f64> = None;
        for hook in hooks {
            if let Some(d) = hook.service(self.now.get()) {
                deadline = Some(deadline.map_or(d, |cur| cur.min(d)));
            }
        }
        deadline
    }

    pub(crate) fn register_hook(&self, hook: Rc<dyn LoopHook>) {
        self.hooks.borrow_mut().push(Rc::downgrade(&hook));
    }

    pub(crate) fn add_remote_waiter(&self, fid: u64, fiber: Weak<Fiber>) {
        self.remote_waiters.borrow_mut().insert(fid, fiber);
    }

    pub(crate) fn remove_remote_waiter(&self, fid: u64) {
        self.remote_waiters.borrow_mut().remove(&fid);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked".to_string()
    }
}

/// Handle to a cord, held by whoever started it
pub struct Cord {
    shared: Arc<CordShared>,
    thread: Option<JoinHandle<()>>,
}

impl Cord {
    /// Spawn a cord and wait until its scheduler is live
    ///
    /// The new thread's main fiber runs `entry`.
    pub fn start<F>(name: &str, entry: F) -> FiberResult<Cord>
    where
        F: FnOnce() -> FiberResult<i32> + Send + 'static,
    {
        Self::spawn(name, entry, true)
    }

    /// Spawn a cord and return immediately
    pub fn costart<F>(name: &str, entry: F) -> FiberResult<Cord>
    where
        F: FnOnce() -> FiberResult<i32> + Send + 'static,
    {
        Self::spawn(name, entry, false)
    }

    fn spawn<F>(name: &str, entry: F, wait_started: bool) -> FiberResult<Cord>
    where
        F: FnOnce() -> FiberResult<i32> + Send + 'static,
    {
        let shared = Arc::new(CordShared::new(name));
        let thread_shared = shared.clone();
        let thread_name = name.to_string();
        let (tx, rx) = std::sync::mpsc::channel();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                CordRuntime::host(
                    thread_shared,
                    CordConfig::from_env(),
                    thread_name,
                    entry,
                    Some(tx),
                );
            })
            .map_err(Error::from)?;

        if wait_started {
            let _ = rx.recv();
        }
        Ok(Cord {
            shared,
            thread: Some(thread),
        })
    }

    /// Host a cord on the calling thread; returns the main fiber's result
    ///
    /// This is how a program's initial thread becomes a cord.
    pub fn run<F>(name: &str, entry: F) -> FiberResult<i32>
    where
        F: FnOnce() -> FiberResult<i32> + 'static,
    {
        let shared = Arc::new(CordShared::new(name));
        CordRuntime::host(
            shared.clone(),
            CordConfig::from_env(),
            name.to_string(),
            entry,
            None,
        );
        let result = shared.result.lock().unwrap().take();
        match result {
            Some((code, None)) => Ok(code),
            Some((_, Some(e))) => Err(e),
            None => Err(Error::SystemError {
                errno: 0,
                msg: "cord terminated without a result".to_string(),
            }),
        }
    }

    /// Cord name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Check whether the cord's main fiber has finished
    pub fn has_exited(&self) -> bool {
        self.shared.exited()
    }

    /// Block the calling thread until the cord exits
    ///
    /// Surfaces the cord's terminal diagnostic: on `Err` it is also copied
    /// into the calling fiber's slot when called from a fiber.
    pub fn join(&mut self) -> FiberResult<i32> {
        let thread = self.thread.take().expect("cord already joined");
        if thread.join().is_err() {
            let mut result = self.shared.result.lock().unwrap();
            if result.is_none() {
                *result = Some((-1, Some(Error::Exception("cord thread panicked".to_string()))));
            }
        }
        self.take_result()
    }

    /// Wait for the cord from a fiber without blocking the event loop
    ///
    /// Registers for the cord's exit notification, then suspends; spurious
    /// wakeups of the waiting fiber re-suspend until the cord is really
    /// gone.
    pub fn cojoin(&mut self) -> FiberResult<i32> {
        let c = tls::cord();
        let cur = c.current_fiber();
        let fid = cur.id();

        c.add_remote_waiter(fid, Rc::downgrade(&cur));
        self.shared.add_exit_waiter(c.shared(), fid);
        while !self.shared.exited() {
            fiber::reschedule();
        }
        c.remove_remote_waiter(fid);

        self.join()
    }

    /// Cooperatively cancel the cord's main fiber and join
    ///
    /// Joins normally if the cord has already exited.
    pub fn cancel_and_join(&mut self) -> FiberResult<i32> {
        self.shared.post(Msg::CancelMain);
        self.join()
    }

    fn take_result(&self) -> FiberResult<i32> {
        let result = self.shared.result.lock().unwrap().take();
        match result {
            Some((code, None)) => Ok(code),
            Some((_, Some(e))) => {
                if tls::is_in_cord() {
                    fiber::current().set_diag(e.clone());
                }
                Err(e)
            }
            None => Err(Error::SystemError {
                errno: 0,
                msg: "cord terminated without a result".to_string(),
            }),
        }
    }
}

// Cord-local bookkeeping exposed to users and tests

/// Total fiber objects allocated on this cord, cached ones included
pub fn fiber_count_total() -> usize {
    tls::cord().fiber_count()
}

/// Bytes currently mapped for fiber stacks on this cord
pub fn stack_bytes_used() -> usize {
    tls::cord().stacks().bytes_used()
}

/// Drain this cord's recycled-fiber pool, releasing the stacks
pub fn collect_garbage() {
    tls::cord().collect_garbage_impl()
}

/// Register an event-loop hook on this cord
///
/// The loop keeps only a weak reference; the hook dies with its owner.
pub fn register_loop_hook(hook: Rc<dyn LoopHook>) {
    tls::cord().register_hook(hook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::FiberCond;
    use crate::config::CordConfig;
    use std::hint::black_box;

    fn run<F>(entry: F) -> FiberResult<i32>
    where
        F: FnOnce() -> FiberResult<i32> + 'static,
    {
        Cord::run("test", entry)
    }

    #[test]
    fn test_noop_join() {
        run(|| {
            let f = fiber::new("join", || Ok(0))?;
            let count = fiber_count_total();
            f.set_joinable(true);
            f.wakeup();
            assert_eq!(f.join()?, 0);
            assert_eq!(fiber_count_total(), count);
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cancel_loop() {
        run(|| {
            let f = fiber::new("cancel", || loop {
                fiber::sleep(0.001)?;
                fiber::testcancel()?;
            })?;
            f.set_joinable(true);
            f.wakeup();
            fiber::sleep(0.0)?;
            f.cancel();
            match f.join() {
                Err(Error::FiberIsCancelled) => {}
                other => panic!("expected cancellation, got {:?}", other),
            }
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_join_propagates_failure() {
        run(|| {
            let f = fiber::new("exception", || {
                Err(Error::OutOfMemory {
                    requested: 42,
                    object: "allocator",
                })
            })?;
            f.set_joinable(true);
            f.wakeup();
            match f.join() {
                Err(Error::OutOfMemory { requested: 42, .. }) => {}
                other => panic!("expected OutOfMemory, got {:?}", other),
            }
            // The diagnostic is copied into the joiner's slot
            assert!(matches!(
                fiber::current().last_error(),
                Some(Error::OutOfMemory { .. })
            ));
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_uncaught_failure_is_contained() {
        run(|| {
            // Not joinable: the failure is logged, not propagated
            let f = fiber::new("exception", || {
                Err(Error::Exception("unhandled".to_string()))
            })?;
            f.wakeup();
            fiber::sleep(0.0)?;
            assert!(f.is_dead());
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_panic_becomes_exception() {
        run(|| {
            let f = fiber::new("panicker", || panic!("boom"))?;
            f.set_joinable(true);
            f.wakeup();
            match f.join() {
                Err(Error::Exception(msg)) => assert!(msg.contains("boom")),
                other => panic!("expected Exception, got {:?}", other),
            }
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cancel_dead_joinable() {
        run(|| {
            let f = fiber::new("cancel_dead", || {
                Err(Error::OutOfMemory {
                    requested: 42,
                    object: "allocator",
                })
            })?;
            f.set_joinable(true);
            f.wakeup();
            fiber::yield_now();
            // By now the fiber is dead already; cancel must not try to
            // schedule it
            assert!(f.is_dead());
            f.cancel();
            let _ = f.join();
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_wakeup_self_does_not_collapse_sleep() {
        run(|| {
            let me = fiber::current();
            me.wakeup();
            let t1 = fiber::clock64();
            fiber::sleep(0.001)?;
            let t2 = fiber::clock64();
            assert!(t2 - t1 >= 1_000_000, "sleep collapsed: {}ns", t2 - t1);

            // Wakeup followed by starting a different fiber
            me.wakeup();
            let newf = fiber::new("nop", || Ok(0))?;
            newf.start();
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_wakeup_dead() {
        run(|| {
            let f = fiber::new("wakeup_dead", || Ok(0))?;
            f.set_joinable(true);
            f.start();
            f.wakeup();
            f.wakeup();
            f.join()?;
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_dead_while_in_cache() {
        run(|| {
            let f = fiber::new("nop", || Ok(0))?;
            let count = fiber_count_total();
            f.start();
            // The fiber remains in the cache of recycled fibers
            assert_eq!(count, fiber_count_total());
            assert!(f.is_dead());
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cached_fibers_respect_flags() {
        run(|| {
            // Make sure the cache has at least one fiber
            let f = fiber::new("nop", || Ok(0))?;
            f.start();

            // Fibers taken from the cache must honor the passed attributes
            let mut attr = FiberAttr::new();
            attr.set_joinable(true);
            let f = fiber::new_ex("wait_cancel", &attr, || {
                while !fiber::current().is_cancelled() {
                    fiber::yield_now();
                }
                Ok(0)
            })?;
            assert!(f.is_joinable());
            assert!(!f.is_cancelled());
            f.wakeup();
            f.cancel();
            f.join()?;
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_wait_on_deadline() {
        run(|| {
            let f = fiber::new("noop", || Ok(0))?;
            f.set_joinable(true);
            f.wakeup();
            let exceeded = f.wait_on_deadline(fiber::clock() + 100.0);
            assert!(!exceeded);
            assert!(f.is_dead());
            f.join()?;

            let f = fiber::new("cancel", || loop {
                fiber::sleep(0.001)?;
                fiber::testcancel()?;
            })?;
            f.set_joinable(true);
            f.wakeup();
            let exceeded = f.wait_on_deadline(fiber::clock() + 0.001);
            assert!(exceeded);
            assert!(!f.is_dead());
            f.cancel();
            let _ = f.join();
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_wait_on_deadline_in_the_past() {
        run(|| {
            let f = fiber::new("forever", || loop {
                fiber::sleep(0.01)?;
            })?;
            f.wakeup();
            // Deadline already passed: returns without yielding
            assert!(f.wait_on_deadline(0.0));
            Ok(0)
        })
        .unwrap();
    }

    fn stack_expand(depth: usize) -> u64 {
        let mut fill = [0u8; 4096];
        unsafe {
            std::ptr::write_volatile(fill.as_mut_ptr(), depth as u8);
            std::ptr::write_volatile(fill.as_mut_ptr().add(2048), depth as u8);
        }
        let sample = unsafe { std::ptr::read_volatile(fill.as_ptr().add(2048)) } as u64;
        if depth == 0 {
            sample
        } else {
            sample + stack_expand(depth - 1)
        }
    }

    #[test]
    fn test_stack_dirtying() {
        run(|| {
            let default_size = CordConfig::from_env().stack_size;

            // Default-stack fiber dirtying 3/4 of its stack
            let limit = default_size * 3 / 4;
            let f = fiber::new("test_stack", move || {
                black_box(stack_expand(limit / 4096));
                Ok(0)
            })?;
            f.wakeup();
            fiber::sleep(0.0)?;

            collect_garbage();
            let baseline_bytes = stack_bytes_used();
            let baseline_count = fiber_count_total();

            // Double-stack fiber dirtying 1.5x the default size
            let mut attr = FiberAttr::new();
            attr.set_stack_size(default_size * 2);
            let limit = default_size * 3 / 2;
            let f = fiber::new_ex("test_stack", &attr, move || {
                black_box(stack_expand(limit / 4096));
                Ok(0)
            })?;
            assert_eq!(fiber_count_total(), baseline_count + 1);
            f.wakeup();
            fiber::sleep(0.0)?;

            collect_garbage();
            assert_eq!(fiber_count_total(), baseline_count);
            assert_eq!(stack_bytes_used(), baseline_bytes);
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cojoin_not_interrupted_by_wakeup() {
        run(|| {
            let mut ok_cord = Cord::costart("cord1", || {
                fiber::sleep(0.1)?;
                Ok(0)
            })?;
            let mut err_cord = Cord::costart("cord2", || {
                Err(Error::SystemError {
                    errno: 0,
                    msg: "some error".to_string(),
                })
            })?;

            // Spurious wakeup scheduled before the cojoin
            let me = fiber::current();
            let waker = fiber::new("waker", move || {
                me.wakeup();
                Ok(0)
            })?;
            waker.wakeup();

            let t0 = fiber::clock();
            assert_eq!(ok_cord.cojoin()?, 0);
            assert!(
                fiber::clock() - t0 >= 0.05,
                "cojoin returned before the cord exited"
            );
            assert!(err_cord.cojoin().is_err());
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cancel_and_join() {
        run(|| {
            // Join an exited but not yet joined cord
            let mut c = Cord::costart("gone", || Ok(0))?;
            fiber::sleep(0.01)?;
            c.cancel_and_join()?;

            // Cancel and join a cord stuck in a checkpoint loop
            let mut c = Cord::costart("spinner", || loop {
                fiber::sleep(0.001)?;
                fiber::testcancel()?;
            })?;
            fiber::sleep(0.01)?;
            match c.cancel_and_join() {
                Err(Error::FiberIsCancelled) => {}
                other => panic!("expected cancellation, got {:?}", other),
            }
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cord_join_propagates_diag() {
        let mut c = Cord::start("failing", || {
            Err(Error::IllegalParams("bad cord".to_string()))
        })
        .unwrap();
        match c.join() {
            Err(Error::IllegalParams(msg)) => assert_eq!(msg, "bad cord"),
            other => panic!("expected IllegalParams, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_wakeup_order() {
        run(|| {
            let order = Rc::new(RefCell::new(Vec::new()));
            let mut fibers = Vec::new();
            for i in 0..3 {
                let order = order.clone();
                let f = fiber::new(&format!("w{}", i), move || {
                    order.borrow_mut().push(i);
                    Ok(0)
                })?;
                f.set_joinable(true);
                fibers.push(f);
            }
            // Wake in order 2, 0, 1; they must run in that order
            fibers[2].wakeup();
            fibers[0].wakeup();
            fibers[1].wakeup();
            for f in &fibers {
                f.join()?;
            }
            assert_eq!(*order.borrow(), vec![2, 0, 1]);
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cond_signal_fifo_and_broadcast() {
        run(|| {
            let cond = Rc::new(FiberCond::new());
            let order = Rc::new(RefCell::new(Vec::new()));
            let mut fibers = Vec::new();
            for i in 0..3 {
                let cond = cond.clone();
                let order = order.clone();
                let f = fiber::new(&format!("c{}", i), move || {
                    cond.wait()?;
                    order.borrow_mut().push(i);
                    Ok(0)
                })?;
                f.set_joinable(true);
                f.wakeup();
                fibers.push(f);
            }
            fiber::sleep(0.0)?; // let them reach the wait
            assert_eq!(cond.waiter_count(), 3);

            cond.signal();
            fiber::sleep(0.0)?;
            assert_eq!(*order.borrow(), vec![0]);

            cond.broadcast();
            for f in &fibers {
                f.join()?;
            }
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cond_wait_deadline() {
        run(|| {
            let cond = FiberCond::new();
            let t0 = fiber::clock();
            match cond.wait_timeout(0.01) {
                Err(Error::TimedOut) => {}
                other => panic!("expected TimedOut, got {:?}", other),
            }
            assert!(fiber::clock() - t0 >= 0.01);

            // Zero timeout fails without yielding
            match cond.wait_timeout(0.0) {
                Err(Error::TimedOut) => {}
                other => panic!("expected TimedOut, got {:?}", other),
            }
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_cancellable_toggle() {
        run(|| {
            let f = fiber::new("shielded", || {
                // Critical region: opt out of cancellation
                fiber::current().set_cancellable(false);
                fiber::sleep(0.005)?;
                fiber::testcancel()?; // not delivered while shielded
                fiber::current().set_cancellable(true);
                fiber::testcancel()?;
                Ok(0)
            })?;
            f.set_joinable(true);
            f.wakeup();
            fiber::sleep(0.0)?;
            f.cancel();
            match f.join() {
                Err(Error::FiberIsCancelled) => {}
                other => panic!("expected cancellation after unshield, got {:?}", other),
            }
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_gc_leak_report() {
        use strand_core::say::{self, LogFormat, LogLevel};

        let path = std::env::temp_dir().join(format!("strand-leak-{}.log", std::process::id()));
        let path = path.to_str().unwrap().to_string();
        say::init(Some(&path), LogLevel::Error, false, LogFormat::Plain).unwrap();

        fiber::abort_on_gc_leak(false);

        fiber::leak_backtrace_enable(true);
        Cord::run("leak", || {
            let f = fiber::new("leaker", || {
                fiber::current().gc().alloc(1);
                Ok(0)
            })?;
            f.set_joinable(true);
            f.wakeup();
            f.join()?;
            Ok(0)
        })
        .unwrap();

        fiber::leak_backtrace_enable(false);
        Cord::run("leak", || {
            let f = fiber::new("leaker", || {
                fiber::current().gc().alloc(1);
                Ok(0)
            })?;
            f.set_joinable(true);
            f.wakeup();
            f.join()?;
            Ok(0)
        })
        .unwrap();

        say::free();

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(
            log.contains("Fiber gc leak is found. First leaked fiber gc allocation backtrace:"),
            "missing backtrace report in log: {}",
            log
        );
        assert!(
            log.contains("Leak backtrace is not available"),
            "missing hint in log: {}",
            log
        );
        let _ = std::fs::remove_file(&path);
    }
}
