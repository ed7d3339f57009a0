//! HTTP requests: buffered and streaming bodies over a fiber scheduler
//!
//! A request owns an easy handle and a shared `IoState` that the
//! transport callbacks write into. Streaming requests move data through
//! `io_read`/`io_write`, suspending the calling fiber on condition
//! variables until the transport catches up.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use curl::easy::{Easy2, Handler, List, ReadError, WriteError};

use strand_core::error::{Error, FiberResult};
use strand_runtime::cond::FiberCond;
use strand_runtime::fiber;
use strand_runtime::region::Region;

use crate::buf::IBuf;
use crate::env::{curl_err, HttpEnv};
use crate::MAX_HEADER_LEN;

/// State shared between a request's fiber side and its transport
/// callbacks. The callbacks run on the cord's event loop, never
/// concurrently with a fiber, so plain cells are enough.
pub(crate) struct IoState {
    /// Streaming mode (`set_io` was called)
    io: Cell<bool>,
    /// Streaming mode with a request body (POST/PUT/PATCH)
    io_send: Cell<bool>,
    /// Producer half-closed; the read callback answers EOF
    send_closed: Cell<bool>,
    in_progress: Cell<bool>,
    /// The transport made first contact (asked for body bytes or
    /// delivered some); `start` waits on this
    io_ready: Cell<bool>,
    /// Bytes queued for the wire, drained by the read callback
    send: RefCell<IBuf>,
    /// Bytes taken off the receive region by an earlier short read
    overflow: RefCell<IBuf>,
    /// Bytes received from the wire
    recv: Region,
    /// Accumulated response headers (final response only)
    headers: RefCell<Vec<u8>>,
    send_cond: FiberCond,
    recv_cond: FiberCond,
    done_cond: FiberCond,
    result: RefCell<Option<Result<(), curl::Error>>>,
}

impl IoState {
    fn new() -> IoState {
        IoState {
            io: Cell::new(false),
            io_send: Cell::new(false),
            send_closed: Cell::new(false),
            in_progress: Cell::new(false),
            io_ready: Cell::new(false),
            send: RefCell::new(IBuf::new()),
            overflow: RefCell::new(IBuf::new()),
            recv: Region::new(),
            headers: RefCell::new(Vec::new()),
            send_cond: FiberCond::new(),
            recv_cond: FiberCond::new(),
            done_cond: FiberCond::new(),
            result: RefCell::new(None),
        }
    }

    /// Headers-arrived condition: the send side hears about the transfer
    /// first on uploads, the receive side otherwise
    fn headers_cond(&self) -> &FiberCond {
        if self.io_send.get() {
            &self.send_cond
        } else {
            &self.recv_cond
        }
    }

    #[inline]
    pub(crate) fn in_progress(&self) -> bool {
        self.in_progress.get()
    }

    pub(crate) fn set_in_progress(&self, v: bool) {
        self.in_progress.set(v);
    }

    /// Transfer completion, called from the driver
    pub(crate) fn complete(&self, result: Result<(), curl::Error>) {
        *self.result.borrow_mut() = Some(result);
        self.in_progress.set(false);
        self.send_closed.set(true);
        self.io_ready.set(true);
        self.recv_cond.broadcast();
        self.send_cond.broadcast();
        self.done_cond.broadcast();
    }
}

/// Transport callbacks feeding the shared state
pub(crate) struct HttpHandler {
    state: Rc<IoState>,
}

impl Handler for HttpHandler {
    /// Producer side: hand queued bytes to the wire, EOF on half-close,
    /// pause when the queue is empty
    fn read(&mut self, data: &mut [u8]) -> Result<usize, ReadError> {
        let st = &self.state;
        st.io_ready.set(true);
        let drained = {
            let mut send = st.send.borrow_mut();
            if send.used() == 0 {
                None
            } else {
                Some(send.read_into(data))
            }
        };
        st.send_cond.broadcast();
        match drained {
            Some(n) => Ok(n),
            None if st.send_closed.get() => Ok(0),
            None => Err(ReadError::Pause),
        }
    }

    /// Consumer side: stash received bytes and wake a streaming reader
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let st = &self.state;
        st.io_ready.set(true);
        st.recv.alloc_copy(data);
        if st.io.get() {
            st.recv_cond.signal();
        }
        Ok(data.len())
    }

    /// Header accumulation
    ///
    /// A fresh status line means a new response (redirect target); the
    /// headers gathered so far belong to the old one and are dropped.
    fn header(&mut self, data: &[u8]) -> bool {
        let st = &self.state;
        let mut headers = st.headers.borrow_mut();
        if data.starts_with(b"HTTP/") && !headers.is_empty() {
            headers.clear();
        }
        headers.extend_from_slice(data);
        true
    }
}

/// An HTTP request
///
/// Created against an `HttpEnv`, configured with setters, then either
/// executed with a buffered body or streamed through the `io_*` calls.
pub struct HttpRequest {
    env: Rc<HttpEnv>,
    state: Rc<IoState>,
    /// The easy handle while idle; moves into the multi while active
    easy: RefCell<Option<Easy2<HttpHandler>>>,
    token: Cell<Option<u64>>,
    headers: RefCell<Vec<String>>,
    status: Cell<i32>,
    reason: RefCell<String>,
    content_length: Cell<i64>,
    keep_alive_timeout: Cell<i64>,
    body_set: Cell<bool>,
    set_accept_header: Cell<bool>,
    set_connection_header: Cell<bool>,
    set_keep_alive_header: Cell<bool>,
}

impl HttpRequest {
    pub(crate) fn new(env: Rc<HttpEnv>, method: &str, url: &str) -> FiberResult<HttpRequest> {
        let state = Rc::new(IoState::new());
        let mut easy = Easy2::new(HttpHandler {
            state: state.clone(),
        });

        let mut set_accept_header = false;
        match method {
            "GET" => easy.get(true).map_err(curl_err)?,
            "HEAD" => easy.nobody(true).map_err(curl_err)?,
            "POST" | "PUT" | "PATCH" => {
                // Empty copied postfields so the transport never invokes
                // the read callback unless set_body/set_io arranged one
                easy.post(true).map_err(curl_err)?;
                easy.post_fields_copy(&[]).map_err(curl_err)?;
                easy.post_field_size(0).map_err(curl_err)?;
                easy.custom_request(method).map_err(curl_err)?;
                set_accept_header = true;
            }
            other => easy.custom_request(other).map_err(curl_err)?,
        }

        easy.url(url).map_err(curl_err)?;
        easy.follow_location(true).map_err(curl_err)?;
        easy.ssl_verify_peer(true).map_err(curl_err)?;
        easy.signal(false).map_err(curl_err)?;

        Ok(HttpRequest {
            env,
            state,
            easy: RefCell::new(Some(easy)),
            token: Cell::new(None),
            headers: RefCell::new(Vec::new()),
            status: Cell::new(0),
            reason: RefCell::new(String::new()),
            content_length: Cell::new(-1),
            keep_alive_timeout: Cell::new(0),
            body_set: Cell::new(false),
            set_accept_header: Cell::new(set_accept_header),
            set_connection_header: Cell::new(true),
            set_keep_alive_header: Cell::new(true),
        })
    }

    fn with_easy<R>(
        &self,
        f: impl FnOnce(&mut Easy2<HttpHandler>) -> Result<R, curl::Error>,
    ) -> FiberResult<R> {
        let mut slot = self.easy.borrow_mut();
        let easy = slot
            .as_mut()
            .ok_or_else(|| Error::IllegalParams("request already started".to_string()))?;
        f(easy).map_err(curl_err)
    }

    // Configuration

    /// Append a request header line (`"Name: value"`)
    ///
    /// Recognized auto-managed headers (`Accept`, `Connection`,
    /// `Keep-Alive`) suppress their automatic counterpart;
    /// `Content-Length` is validated and remembered for streaming
    /// uploads.
    pub fn set_header(&self, header: &str) -> FiberResult<()> {
        if header.len() > MAX_HEADER_LEN {
            return Err(Error::IllegalParams("header is too large".to_string()));
        }

        if let Some(_) = strip_header(header, "Accept:") {
            self.set_accept_header.set(false);
        } else if let Some(_) = strip_header(header, "Connection:") {
            self.set_connection_header.set(false);
        } else if let Some(value) = strip_header(header, "Content-Length:") {
            let length: i64 = value.trim().parse().map_err(|_| {
                Error::IllegalParams(
                    "Content-Length header value must be a non-negative integer".to_string(),
                )
            })?;
            if length < 0 {
                return Err(Error::IllegalParams(
                    "Content-Length header value must be a non-negative integer".to_string(),
                ));
            }
            self.content_length.set(length);
        } else if let Some(_) = strip_header(header, "Keep-Alive:") {
            self.set_keep_alive_header.set(false);
        }

        self.headers.borrow_mut().push(header.to_string());
        Ok(())
    }

    /// Install a buffered request body; mutually exclusive with `set_io`
    pub fn set_body(&self, body: &[u8]) -> FiberResult<()> {
        if self.state.io.get() {
            return Err(Error::IllegalParams(
                "body: request is already io".to_string(),
            ));
        }
        self.with_easy(|easy| {
            easy.post_fields_copy(body)?;
            easy.post_field_size(body.len() as u64)
        })?;
        self.set_header(&format!("Content-Length: {}", body.len()))?;
        self.body_set.set(true);
        Ok(())
    }

    /// Switch the request to streaming mode
    ///
    /// POST/PUT/PATCH stream the request body through `io_write`;
    /// everything else only reads the response through `io_read`.
    /// Mutually exclusive with `set_body`.
    pub fn set_io(&self, method: &str) -> FiberResult<()> {
        if self.state.io.get() {
            return Err(Error::IllegalParams("io: request is already io".to_string()));
        }
        if self.body_set.get() {
            return Err(Error::IllegalParams(
                "io: request has a buffered body".to_string(),
            ));
        }

        self.state.io.set(true);
        match method {
            "POST" | "PUT" | "PATCH" => {
                self.with_easy(|easy| {
                    easy.upload(true)?;
                    if self.content_length.get() >= 0 {
                        easy.in_filesize(self.content_length.get() as u64)?;
                    }
                    Ok(())
                })?;
                self.state.io_send.set(true);
                self.state.send_closed.set(false);
            }
            _ => {
                self.state.io_send.set(false);
                self.state.send_closed.set(true);
            }
        }
        Ok(())
    }

    /// Enable TCP keepalive probing; also arranges the `Keep-Alive`
    /// header at start
    pub fn set_keepalive(&self, idle: i64, interval: i64) -> FiberResult<()> {
        if idle > 0 && interval > 0 {
            self.with_easy(|easy| {
                easy.tcp_keepalive(true)?;
                easy.tcp_keepidle(std::time::Duration::from_secs(idle as u64))?;
                easy.tcp_keepintvl(std::time::Duration::from_secs(interval as u64))
            })?;
            self.keep_alive_timeout.set(idle);
        }
        Ok(())
    }

    /// Fail the transfer when below `limit` bytes/s for `seconds`
    pub fn set_low_speed_time(&self, seconds: u64) -> FiberResult<()> {
        self.with_easy(|easy| easy.low_speed_time(std::time::Duration::from_secs(seconds)))
    }

    pub fn set_low_speed_limit(&self, limit: u32) -> FiberResult<()> {
        self.with_easy(|easy| easy.low_speed_limit(limit))
    }

    pub fn set_verbose(&self, verbose: bool) -> FiberResult<()> {
        self.with_easy(|easy| easy.verbose(verbose))
    }

    pub fn set_ca_path(&self, path: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.capath(path))
    }

    pub fn set_ca_file(&self, file: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.cainfo(file))
    }

    pub fn set_unix_socket(&self, path: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.unix_socket(path))
    }

    pub fn set_verify_host(&self, verify: bool) -> FiberResult<()> {
        self.with_easy(|easy| easy.ssl_verify_host(verify))
    }

    pub fn set_verify_peer(&self, verify: bool) -> FiberResult<()> {
        self.with_easy(|easy| easy.ssl_verify_peer(verify))
    }

    pub fn set_ssl_key(&self, key: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.ssl_key(key))
    }

    pub fn set_ssl_cert(&self, cert: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.ssl_cert(cert))
    }

    pub fn set_proxy(&self, proxy: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.proxy(proxy))
    }

    pub fn set_proxy_port(&self, port: u16) -> FiberResult<()> {
        self.with_easy(|easy| easy.proxy_port(port))
    }

    pub fn set_proxy_user_pwd(&self, user: &str, pwd: &str) -> FiberResult<()> {
        self.with_easy(|easy| {
            easy.proxy_username(user)?;
            easy.proxy_password(pwd)
        })
    }

    pub fn set_no_proxy(&self, skip: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.noproxy(skip))
    }

    pub fn set_interface(&self, interface: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.interface(interface))
    }

    pub fn set_follow_location(&self, follow: bool) -> FiberResult<()> {
        self.with_easy(|easy| easy.follow_location(follow))
    }

    pub fn set_accept_encoding(&self, encoding: &str) -> FiberResult<()> {
        self.with_easy(|easy| easy.accept_encoding(encoding))
    }

    // Execution

    /// Hand the request to the transport
    ///
    /// For streaming requests this suspends until the first transport
    /// activity (headers on the relevant side) or `timeout` seconds.
    pub fn start(&self, timeout: f64) -> FiberResult<()> {
        self.status.set(0);
        if self.set_accept_header.get() {
            self.set_header("Accept: */*")?;
        }
        if self.set_connection_header.get() {
            let value = if self.keep_alive_timeout.get() > 0 {
                "Keep-Alive"
            } else {
                "close"
            };
            self.set_header(&format!("Connection: {}", value))?;
        }
        if self.set_keep_alive_header.get() && self.keep_alive_timeout.get() > 0 {
            self.set_header(&format!("Keep-Alive: timeout={}", self.keep_alive_timeout.get()))?;
        }

        let mut easy = self
            .easy
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::IllegalParams("request already started".to_string()))?;
        let mut list = List::new();
        for header in self.headers.borrow().iter() {
            list.append(header).map_err(curl_err)?;
        }
        easy.http_headers(list).map_err(curl_err)?;

        let token = self.env.start_transfer(easy, self.state.clone())?;
        self.token.set(Some(token));

        if self.state.io.get() {
            // Predicate loop: a checkpoint-free check-then-wait cannot
            // miss a signal on a cooperative scheduler
            let deadline = fiber::clock() + timeout;
            while self.state.in_progress() && !self.state.io_ready.get() {
                if let Err(e) = self.state.headers_cond().wait_deadline(deadline) {
                    let _ = self.finish(0.0);
                    fiber::current().set_diag(e.clone());
                    return Err(e);
                }
            }
        }
        if self.state.io.get() && !self.state.in_progress() {
            return self.finish(0.0);
        }
        Ok(())
    }

    /// Wait for the transfer to complete and map its outcome
    ///
    /// On success the transport result is folded into `status()`; see the
    /// mapping in `map_result`. Exceeding `timeout` aborts the transfer.
    pub fn finish(&self, timeout: f64) -> FiberResult<()> {
        let token = self
            .token
            .get()
            .ok_or_else(|| Error::IllegalParams("request not started".to_string()))?;

        let deadline = fiber::clock() + timeout.max(0.0);
        while self.state.in_progress() {
            if let Err(e) = self.state.done_cond.wait_deadline(deadline) {
                if let Some(easy) = self.env.abort(token) {
                    *self.easy.borrow_mut() = Some(easy);
                }
                self.token.set(None);
                return Err(e);
            }
        }

        let easy = self.env.reclaim(token)?;
        self.token.set(None);
        *self.easy.borrow_mut() = Some(easy);

        let result = self
            .state
            .result
            .borrow_mut()
            .take()
            .unwrap_or(Ok(()));
        self.map_result(result)
    }

    /// `start` then `finish` with the same timeout
    pub fn execute(&self, timeout: f64) -> FiberResult<()> {
        self.start(timeout)?;
        if self.status.get() != 0 {
            // start() already drove the transfer to completion
            return Ok(());
        }
        self.finish(timeout)
    }

    fn map_result(&self, result: Result<(), curl::Error>) -> FiberResult<()> {
        match result {
            Ok(()) => {
                let code = self.with_easy(|easy| easy.response_code())? as i32;
                self.status.set(code);
                *self.reason.borrow_mut() = if (100..400).contains(&code) {
                    "Ok".to_string()
                } else {
                    "Unknown".to_string()
                };
                self.env.count_status(code);
                Ok(())
            }
            Err(e) => {
                self.env.count_failure();
                let mapped = if e.is_peer_failed_verification() || e.is_ssl_cacert() {
                    // 495 SSL Certificate Error (nginx non-standard)
                    Some(495)
                } else if e.is_operation_timedout() {
                    // 408 Request Timeout
                    Some(408)
                } else if e.is_got_nothing() {
                    // 444 No Response
                    Some(444)
                } else if e.is_couldnt_resolve_proxy()
                    || e.is_couldnt_resolve_host()
                    || e.is_couldnt_connect()
                    || e.is_write_error()
                    || e.is_bad_content_encoding()
                {
                    // 595 Connection Problem
                    Some(595)
                } else {
                    None
                };

                match mapped {
                    Some(status) => {
                        self.status.set(status);
                        *self.reason.borrow_mut() = e.description().to_string();
                        Ok(())
                    }
                    None if e.is_out_of_memory() => {
                        let err = Error::OutOfMemory {
                            requested: 0,
                            object: "curl",
                        };
                        fiber::current().set_diag(err.clone());
                        Err(err)
                    }
                    None => {
                        let err = Error::SystemError {
                            errno: libc::EINVAL,
                            msg: format!("curl: {}", e.description()),
                        };
                        fiber::current().set_diag(err.clone());
                        Err(err)
                    }
                }
            }
        }
    }

    // Streaming I/O

    /// Read response bytes, suspending until some arrive, the transfer
    /// ends (returns 0), or the deadline passes
    pub fn io_read(&self, buf: &mut [u8], timeout: f64) -> FiberResult<usize> {
        let st = &self.state;
        if !st.io.get() {
            return Err(Error::IllegalParams("io: request must be io".to_string()));
        }

        let deadline = fiber::clock() + timeout;
        let mut overflow_len = st.overflow.borrow().used();
        let mut recv_len = st.recv.used();
        while st.in_progress() && timeout > 0.0 && overflow_len + recv_len == 0 {
            st.recv_cond.wait_deadline(deadline)?;
            overflow_len = st.overflow.borrow().used();
            recv_len = st.recv.used();
        }

        if overflow_len + recv_len == 0 {
            return Ok(0);
        }

        // Overflow from an earlier short read drains first
        let mut copied = st.overflow.borrow_mut().read_into(buf);

        if copied < buf.len() && recv_len > 0 {
            let take = (buf.len() - copied).min(recv_len);
            let joined = st.recv.join_slice(recv_len);
            buf[copied..copied + take].copy_from_slice(&joined[..take]);
            // Anything past the caller's buffer moves to the overflow for
            // the next read
            if recv_len > take {
                st.overflow.borrow_mut().write(&joined[take..]);
            }
            copied += take;
            st.recv.truncate(0);
        }

        Ok(copied)
    }

    /// Queue request bytes for the wire, suspending until earlier bytes
    /// drained. Empty `data` half-closes the send side. Returns the bytes
    /// accepted, 0 when the send side is closed.
    pub fn io_write(&self, data: &[u8], timeout: f64) -> FiberResult<usize> {
        let st = &self.state;
        if !st.io.get() {
            return Err(Error::IllegalParams("io: request must be io".to_string()));
        }
        if !st.io_send.get() {
            return Err(Error::IllegalParams(
                "io: HTTP request method with no body to send".to_string(),
            ));
        }
        if !st.in_progress() || st.send_closed.get() {
            return Ok(0);
        }

        let deadline = fiber::clock() + timeout;
        let mut pending = st.send.borrow().used();
        while st.in_progress() && pending > 0 && timeout > 0.0 {
            st.send_cond.wait_deadline(deadline)?;
            pending = st.send.borrow().used();
        }
        if pending > 0 {
            if st.in_progress() {
                fiber::current().set_diag(Error::TimedOut);
                return Err(Error::TimedOut);
            }
            return Ok(0);
        }

        if !data.is_empty() {
            let mut send = st.send.borrow_mut();
            send.reset();
            send.write(data);
        } else {
            st.send_closed.set(true);
        }

        if let Some(token) = self.token.get() {
            self.env.unpause_send(token);
        }
        // The unpause may have run the read callback inline and drained
        // the buffer already; only wait when bytes are still queued
        if st.send.borrow().used() > 0 {
            let _ = st.send_cond.wait_deadline(deadline);
        }
        if st.send.borrow().used() > 0 {
            st.send.borrow_mut().reset();
            return Ok(0);
        }

        Ok(data.len())
    }

    /// Half-close the send side if needed, wait out the transfer, and
    /// release any fibers still parked on the request's conditions
    pub fn io_finish(&self, timeout: f64) -> FiberResult<()> {
        let st = &self.state;
        if !st.io.get() {
            return Err(Error::IllegalParams("io: request must be io".to_string()));
        }

        let mut timeout = timeout;
        if st.in_progress() && !st.send_closed.get() {
            let before = fiber::clock();
            let _ = self.io_write(&[], timeout.max(0.0));
            timeout -= fiber::clock() - before;
        }

        if self.status.get() == 0 && self.token.get().is_some() {
            self.finish(timeout.max(0.0))?;
        }

        st.send_cond.broadcast();
        st.recv_cond.broadcast();
        Ok(())
    }

    // Results

    /// HTTP status after completion (transport failures are folded in,
    /// e.g. 408 for a transport timeout)
    pub fn status(&self) -> i32 {
        self.status.get()
    }

    /// Reason phrase matching `status()`
    pub fn reason(&self) -> String {
        self.reason.borrow().clone()
    }

    /// Raw header block of the final response
    pub fn headers_raw(&self) -> Vec<u8> {
        self.state.headers.borrow().clone()
    }

    /// Buffered response body (non-streaming requests)
    pub fn body(&self) -> Vec<u8> {
        let len = self.state.recv.used();
        if len == 0 {
            return Vec::new();
        }
        self.state.recv.join_slice(len).to_vec()
    }
}

impl Drop for HttpRequest {
    fn drop(&mut self) {
        if let Some(token) = self.token.get() {
            let _ = self.env.abort(token);
            // Release any fiber still parked on this request
            self.state.send_cond.broadcast();
            self.state.recv_cond.broadcast();
            self.state.done_cond.broadcast();
        }
    }
}

fn strip_header<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    if header.len() >= name.len() && header[..name.len()].eq_ignore_ascii_case(name) {
        Some(&header[name.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use strand_runtime::cord::Cord;

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Read one request (headers + Content-Length body) off the socket
    fn read_request(sock: &mut TcpStream) -> (String, Vec<u8>) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let header_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            let n = sock.read(&mut tmp).unwrap();
            assert!(n > 0, "peer closed mid-headers");
            buf.extend_from_slice(&tmp[..n]);
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut body = buf[header_end..].to_vec();
        let content_length = headers
            .lines()
            .find_map(|l| {
                let l = l.to_ascii_lowercase();
                l.strip_prefix("content-length:")
                    .map(|v| v.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
        while body.len() < content_length {
            let n = sock.read(&mut tmp).unwrap();
            assert!(n > 0, "peer closed mid-body");
            body.extend_from_slice(&tmp[..n]);
        }
        (headers, body)
    }

    #[test]
    fn test_strip_header() {
        assert_eq!(strip_header("Accept: */*", "Accept:"), Some(" */*"));
        assert_eq!(strip_header("accept: */*", "Accept:"), Some(" */*"));
        assert_eq!(strip_header("X-Other: 1", "Accept:"), None);
    }

    #[test]
    fn test_header_validation() {
        Cord::run("http", || {
            let env = HttpEnv::new(4, 4)?;
            let req = env.request("POST", "http://127.0.0.1:9/none")?;

            match req.set_header("Content-Length: -5") {
                Err(Error::IllegalParams(msg)) => {
                    assert!(msg.contains("non-negative"));
                }
                other => panic!("expected IllegalParams, got {:?}", other),
            }

            let long = format!("X-Big: {}", "a".repeat(MAX_HEADER_LEN));
            match req.set_header(&long) {
                Err(Error::IllegalParams(msg)) => assert!(msg.contains("too large")),
                other => panic!("expected IllegalParams, got {:?}", other),
            }

            req.set_header("Content-Length: 17")?;
            assert_eq!(req.content_length.get(), 17);
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_io_mode_misuse() {
        Cord::run("http", || {
            let env = HttpEnv::new(4, 4)?;

            let req = env.request("GET", "http://127.0.0.1:9/none")?;
            let mut buf = [0u8; 8];
            assert!(matches!(
                req.io_read(&mut buf, 0.0),
                Err(Error::IllegalParams(_))
            ));

            req.set_io("GET")?;
            assert!(matches!(req.set_io("GET"), Err(Error::IllegalParams(_))));
            // GET has no body to send
            assert!(matches!(
                req.io_write(b"x", 0.0),
                Err(Error::IllegalParams(_))
            ));

            let req = env.request("POST", "http://127.0.0.1:9/none")?;
            req.set_body(b"buffered")?;
            assert!(matches!(req.set_io("POST"), Err(Error::IllegalParams(_))));
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn test_streaming_upload() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (body_tx, body_rx) = std::sync::mpsc::channel();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let (_, body) = read_request(&mut sock);
            body_tx.send(body).unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .unwrap();
        });

        Cord::run("http", move || {
            let env = HttpEnv::new(8, 8)?;
            let req = env.request("POST", &format!("http://{}/upload", addr))?;
            req.set_header("Content-Length: 3072")?;
            // The test server never answers 100-continue
            req.set_header("Expect:")?;
            req.set_io("POST")?;
            req.start(10.0)?;

            for chunk in 0..3u8 {
                let data = vec![b'a' + chunk; 1024];
                let written = req.io_write(&data, 10.0)?;
                assert_eq!(written, 1024);
            }
            req.io_finish(10.0)?;
            assert_eq!(req.status(), 200);

            let stats = env.stats();
            assert_eq!(stats.total_requests, 1);
            assert_eq!(stats.http_200_responses, 1);
            Ok(0)
        })
        .unwrap();

        let body = body_rx.recv().unwrap();
        assert_eq!(body.len(), 3072);
        assert!(body[..1024].iter().all(|&b| b == b'a'));
        assert!(body[1024..2048].iter().all(|&b| b == b'b'));
        assert!(body[2048..].iter().all(|&b| b == b'c'));
        server.join().unwrap();
    }

    #[test]
    fn test_streaming_download() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let (_, _) = read_request(&mut sock);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789",
            )
            .unwrap();
        });

        Cord::run("http", move || {
            let env = HttpEnv::new(8, 8)?;
            let req = env.request("GET", &format!("http://{}/data", addr))?;
            req.set_io("GET")?;
            req.start(10.0)?;

            // Short reads exercise the overflow path
            let mut collected = Vec::new();
            let mut buf = [0u8; 3];
            loop {
                let n = req.io_read(&mut buf, 10.0)?;
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            req.io_finish(10.0)?;

            assert_eq!(req.status(), 200);
            assert_eq!(collected, b"0123456789");
            Ok(0)
        })
        .unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_redirect_headers_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let (_, _) = read_request(&mut sock);
            let redirect = format!(
                "HTTP/1.1 302 Found\r\nLocation: http://{}/final\r\nX-Interim: yes\r\n\
                 Content-Length: 0\r\nConnection: close\r\n\r\n",
                addr
            );
            sock.write_all(redirect.as_bytes()).unwrap();
            drop(sock);

            let (mut sock, _) = listener.accept().unwrap();
            let (_, _) = read_request(&mut sock);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nX-Final: yes\r\nContent-Length: 5\r\n\
                  Connection: close\r\n\r\nhello",
            )
            .unwrap();
        });

        Cord::run("http", move || {
            let env = HttpEnv::new(8, 8)?;
            let req = env.request("GET", &format!("http://{}/start", addr))?;
            req.execute(10.0)?;

            assert_eq!(req.status(), 200);
            assert_eq!(req.body(), b"hello");

            let headers = String::from_utf8(req.headers_raw()).unwrap();
            assert!(headers.contains("X-Final"), "headers: {}", headers);
            assert!(
                !headers.contains("X-Interim"),
                "redirect headers leaked: {}",
                headers
            );
            Ok(0)
        })
        .unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_connection_refused_maps_to_595() {
        // Bind-then-drop guarantees a closed port
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        Cord::run("http", move || {
            let env = HttpEnv::new(4, 4)?;
            let req = env.request("GET", &format!("http://127.0.0.1:{}/", port))?;
            req.execute(10.0)?;
            assert_eq!(req.status(), 595);
            assert_eq!(env.stats().failed_requests, 1);
            Ok(0)
        })
        .unwrap();
    }
}
