//! HTTP environment: the transport driver and request statistics
//!
//! One `HttpEnv` per cord owns a libcurl multi handle and pumps it from
//! the cord's event loop (as a `LoopHook`). Completions are dispatched to
//! the owning request's shared state, which broadcasts the fiber
//! condition variables.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Multi};

use strand_core::error::{Error, FiberResult};
use strand_core::say_debug;
use strand_runtime::cord::{self, LoopHook};

use crate::request::{HttpHandler, HttpRequest, IoState};

/// Fallback service interval while transfers are in flight; the loop does
/// not select on the transport's sockets, so it polls at this cadence
/// when libcurl reports no nearer deadline.
const POLL_INTERVAL: f64 = 0.01;

/// Request statistics kept by the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpStats {
    pub total_requests: u64,
    pub http_200_responses: u64,
    pub http_other_responses: u64,
    pub failed_requests: u64,
}

struct ActiveTransfer {
    token: u64,
    handle: Easy2Handle<HttpHandler>,
    state: Rc<IoState>,
}

/// Per-cord HTTP client environment
pub struct HttpEnv {
    myself: std::rc::Weak<HttpEnv>,
    /// Declared before `multi`: outstanding transfer handles must drop
    /// before the multi handle they belong to
    active: RefCell<Vec<ActiveTransfer>>,
    multi: Multi,
    next_token: Cell<u64>,
    total_requests: Cell<u64>,
    http_200_responses: Cell<u64>,
    http_other_responses: Cell<u64>,
    failed_requests: Cell<u64>,
}

impl HttpEnv {
    /// Create an environment and hook it into the current cord's loop
    ///
    /// `max_conns` bounds the connection cache, `max_total_conns` the
    /// simultaneously open connections.
    pub fn new(max_conns: usize, max_total_conns: usize) -> FiberResult<Rc<HttpEnv>> {
        let mut multi = Multi::new();
        multi.set_max_connects(max_conns).map_err(multi_err)?;
        multi
            .set_max_total_connections(max_total_conns)
            .map_err(multi_err)?;

        let env = Rc::new_cyclic(|myself| HttpEnv {
            myself: myself.clone(),
            active: RefCell::new(Vec::new()),
            multi,
            next_token: Cell::new(1),
            total_requests: Cell::new(0),
            http_200_responses: Cell::new(0),
            http_other_responses: Cell::new(0),
            failed_requests: Cell::new(0),
        });
        cord::register_loop_hook(env.clone());
        Ok(env)
    }

    /// Create a request bound to this environment
    pub fn request(&self, method: &str, url: &str) -> FiberResult<HttpRequest> {
        let env = self.myself.upgrade().expect("environment destroyed");
        HttpRequest::new(env, method, url)
    }

    /// Snapshot of the statistics counters
    pub fn stats(&self) -> HttpStats {
        HttpStats {
            total_requests: self.total_requests.get(),
            http_200_responses: self.http_200_responses.get(),
            http_other_responses: self.http_other_responses.get(),
            failed_requests: self.failed_requests.get(),
        }
    }

    // Driver entry points used by requests

    pub(crate) fn start_transfer(
        &self,
        easy: Easy2<HttpHandler>,
        state: Rc<IoState>,
    ) -> FiberResult<u64> {
        let handle = self.multi.add2(easy).map_err(multi_err)?;
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        state.set_in_progress(true);
        self.active.borrow_mut().push(ActiveTransfer {
            token,
            handle,
            state,
        });
        self.total_requests.set(self.total_requests.get() + 1);
        // Kick the transfer off without waiting for the next idle tick
        let _ = self.multi.perform();
        self.dispatch_completions();
        Ok(token)
    }

    /// Resume the transport's read callback after new bytes were installed
    pub(crate) fn unpause_send(&self, token: u64) {
        let mut active = self.active.borrow_mut();
        if let Some(t) = active.iter_mut().find(|t| t.token == token) {
            let _ = t.handle.unpause_read();
        }
    }

    /// Detach a completed transfer and hand the easy handle back
    pub(crate) fn reclaim(&self, token: u64) -> FiberResult<Easy2<HttpHandler>> {
        let transfer = self.take_transfer(token)?;
        self.multi.remove2(transfer.handle).map_err(multi_err)
    }

    /// Tear down an unfinished transfer (deadline or request teardown)
    pub(crate) fn abort(&self, token: u64) -> Option<Easy2<HttpHandler>> {
        let transfer = self.take_transfer(token).ok()?;
        transfer.state.set_in_progress(false);
        self.multi.remove2(transfer.handle).ok()
    }

    pub(crate) fn count_status(&self, status: i32) {
        if status == 200 {
            self.http_200_responses.set(self.http_200_responses.get() + 1);
        } else {
            self.http_other_responses
                .set(self.http_other_responses.get() + 1);
        }
    }

    pub(crate) fn count_failure(&self) {
        self.failed_requests.set(self.failed_requests.get() + 1);
    }

    fn take_transfer(&self, token: u64) -> FiberResult<ActiveTransfer> {
        let mut active = self.active.borrow_mut();
        let idx = active
            .iter()
            .position(|t| t.token == token)
            .ok_or_else(|| Error::IllegalParams("unknown transfer".to_string()))?;
        Ok(active.remove(idx))
    }

    fn dispatch_completions(&self) {
        let active = self.active.borrow();
        self.multi.messages(|msg| {
            for t in active.iter() {
                if let Some(result) = msg.result_for2(&t.handle) {
                    say_debug!("http transfer {} completed", t.token);
                    t.state.complete(result);
                }
            }
        });
    }
}

impl LoopHook for HttpEnv {
    fn service(&self, now: f64) -> Option<f64> {
        if self.active.borrow().is_empty() {
            return None;
        }
        let _ = self.multi.perform();
        self.dispatch_completions();

        let any_running = self
            .active
            .borrow()
            .iter()
            .any(|t| t.state.in_progress());
        if !any_running {
            return None;
        }

        let hint = self
            .multi
            .get_timeout()
            .ok()
            .flatten()
            .map(|d| d.as_secs_f64())
            .unwrap_or(POLL_INTERVAL);
        Some(now + hint.clamp(0.0, POLL_INTERVAL))
    }
}

pub(crate) fn multi_err(e: curl::MultiError) -> Error {
    Error::SystemError {
        errno: 0,
        msg: format!("curl multi: {}", e),
    }
}

pub(crate) fn curl_err(e: curl::Error) -> Error {
    Error::SystemError {
        errno: 0,
        msg: format!("curl: {}", e),
    }
}
