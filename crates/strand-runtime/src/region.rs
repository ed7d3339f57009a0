//! Bump-pointer scratch regions ("gc")
//!
//! A region hands out stable allocations from a chain of chunks and frees
//! everything at once on `reset`. Every fiber owns one; a fiber that dies
//! with a non-empty region is reported as a leak. Regions are also used as
//! receive accumulators by the HTTP adapter.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

#[cfg(feature = "leak-backtrace")]
use std::backtrace::Backtrace;

/// Smallest chunk the region will map in one go
const MIN_CHUNK: usize = 4096;

struct Chunk {
    buf: Vec<u8>,
}

impl Chunk {
    fn with_capacity(cap: usize) -> Chunk {
        Chunk { buf: vec![0; cap] }
    }

    fn spare(&self, len: usize) -> usize {
        self.buf.len() - len
    }
}

/// A bump allocator tied to an owner's lifetime
///
/// Allocations are stable until `reset`/`truncate` discards them. The
/// region never frees individual allocations.
pub struct Region {
    chunks: RefCell<Vec<(Chunk, usize)>>, // (chunk, bytes used in chunk)
    used: Cell<usize>,
    track_leaks: bool,
    #[cfg(feature = "leak-backtrace")]
    origin: RefCell<Option<Backtrace>>,
}

impl Region {
    /// Plain region (HTTP accumulators and the like)
    pub fn new() -> Region {
        Region {
            chunks: RefCell::new(Vec::new()),
            used: Cell::new(0),
            track_leaks: false,
            #[cfg(feature = "leak-backtrace")]
            origin: RefCell::new(None),
        }
    }

    /// Region whose first allocation records a backtrace for leak reports
    ///
    /// Used for fiber scratch regions. Capture only happens while leak
    /// backtraces are enabled (see `fiber::leak_backtrace_enable`).
    pub fn with_leak_capture() -> Region {
        Region {
            chunks: RefCell::new(Vec::new()),
            used: Cell::new(0),
            track_leaks: true,
            #[cfg(feature = "leak-backtrace")]
            origin: RefCell::new(None),
        }
    }

    /// Allocate `size` bytes; the returned pointer is valid until the next
    /// `reset` or a `truncate` below it.
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        #[cfg(feature = "leak-backtrace")]
        if self.track_leaks
            && self.used.get() == 0
            && crate::fiber::leak_backtrace_enabled()
        {
            *self.origin.borrow_mut() = Some(Backtrace::force_capture());
        }

        let mut chunks = self.chunks.borrow_mut();
        let need_new = match chunks.last() {
            Some((chunk, len)) => chunk.spare(*len) < size,
            None => true,
        };
        if need_new {
            let cap = size.max(MIN_CHUNK).max(self.used.get());
            chunks.push((Chunk::with_capacity(cap), 0));
        }

        let (chunk, len) = chunks.last_mut().unwrap();
        let ptr = unsafe { chunk.buf.as_mut_ptr().add(*len) };
        *len += size;
        self.used.set(self.used.get() + size);
        NonNull::new(ptr).unwrap()
    }

    /// Allocate and fill with `data`
    pub fn alloc_copy(&self, data: &[u8]) -> NonNull<u8> {
        let ptr = self.alloc(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }
        ptr
    }

    /// Bytes currently allocated
    #[inline]
    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Free everything
    pub fn reset(&self) {
        self.chunks.borrow_mut().clear();
        self.used.set(0);
        #[cfg(feature = "leak-backtrace")]
        {
            *self.origin.borrow_mut() = None;
        }
    }

    /// Drop allocations until only `new_used` bytes remain
    pub fn truncate(&self, new_used: usize) {
        if new_used == 0 {
            self.reset();
            return;
        }
        let mut excess = self.used.get().saturating_sub(new_used);
        let mut chunks = self.chunks.borrow_mut();
        while excess > 0 {
            let (_, len) = chunks.last_mut().expect("region accounting out of sync");
            if *len <= excess {
                excess -= *len;
                chunks.pop();
            } else {
                *len -= excess;
                excess = 0;
            }
        }
        self.used.set(new_used);
    }

    /// Make the most recent `size` bytes contiguous and return them
    ///
    /// If they already sit in one chunk this is free; otherwise they are
    /// copied into a fresh chunk (allocation order preserved).
    pub fn join(&self, size: usize) -> NonNull<u8> {
        assert!(size <= self.used.get(), "region join past allocation");
        {
            let chunks = self.chunks.borrow();
            if let Some((chunk, len)) = chunks.last() {
                if *len >= size {
                    let ptr = unsafe { chunk.buf.as_ptr().add(len - size) as *mut u8 };
                    return NonNull::new(ptr).unwrap();
                }
            }
        }

        // Gather the tail bytes across chunks, oldest first
        let mut gathered = vec![0u8; size];
        {
            let mut chunks = self.chunks.borrow_mut();
            let mut remaining = size;
            let mut write_end = size;
            while remaining > 0 {
                let (chunk, len) = chunks.last_mut().expect("region accounting out of sync");
                let take = (*len).min(remaining);
                let src = &chunk.buf[*len - take..*len];
                gathered[write_end - take..write_end].copy_from_slice(src);
                write_end -= take;
                remaining -= take;
                *len -= take;
                if *len == 0 {
                    chunks.pop();
                }
            }
        }

        self.used.set(self.used.get() - size);
        let ptr = self.alloc_copy(&gathered);
        ptr
    }

    /// Read the most recent `size` bytes without keeping the pointer
    pub fn join_slice(&self, size: usize) -> &[u8] {
        let ptr = self.join(size);
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) }
    }

    /// Backtrace of the first allocation, if one was captured
    #[cfg(feature = "leak-backtrace")]
    pub fn take_leak_origin(&self) -> Option<Backtrace> {
        self.origin.borrow_mut().take()
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_used() {
        let r = Region::new();
        assert_eq!(r.used(), 0);
        r.alloc(10);
        r.alloc(20);
        assert_eq!(r.used(), 30);
        r.reset();
        assert_eq!(r.used(), 0);
    }

    #[test]
    fn test_alloc_copy_roundtrip() {
        let r = Region::new();
        let ptr = r.alloc_copy(b"hello");
        let got = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 5) };
        assert_eq!(got, b"hello");
    }

    #[test]
    fn test_join_within_one_chunk() {
        let r = Region::new();
        r.alloc_copy(b"abc");
        r.alloc_copy(b"def");
        let joined = r.join_slice(6);
        assert_eq!(joined, b"abcdef");
        assert_eq!(r.used(), 6);
    }

    #[test]
    fn test_join_across_chunks() {
        let r = Region::new();
        // Force separate chunks with oversized allocations
        let big = MIN_CHUNK;
        let p1 = r.alloc(big);
        unsafe { std::ptr::write_bytes(p1.as_ptr(), b'x', big) };
        let p2 = r.alloc(big);
        unsafe { std::ptr::write_bytes(p2.as_ptr(), b'y', big) };

        let joined = r.join_slice(2 * big);
        assert_eq!(joined.len(), 2 * big);
        assert!(joined[..big].iter().all(|&b| b == b'x'));
        assert!(joined[big..].iter().all(|&b| b == b'y'));
        assert_eq!(r.used(), 2 * big);
    }

    #[test]
    fn test_truncate() {
        let r = Region::new();
        r.alloc(100);
        r.truncate(40);
        assert_eq!(r.used(), 40);
        r.truncate(0);
        assert_eq!(r.used(), 0);
    }
}
