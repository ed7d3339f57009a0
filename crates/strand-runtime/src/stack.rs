//! Fiber stacks: fixed-size mmap regions with a leading guard page
//!
//! Each stack is mapped `PROT_NONE` first, then the usable region above
//! the guard page is made readable/writable. The guard page stays
//! `PROT_NONE`, so running off the end of the stack faults instead of
//! corrupting a neighbour.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::OnceLock;

use strand_core::error::{Error, FiberResult};

/// Default usable stack size for new fibers
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest usable stack size accepted from attributes
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// OS page size, queried once
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Round a requested stack size up to whole pages, at least the minimum
pub fn align_stack_size(size: usize) -> usize {
    let page = page_size();
    let size = size.max(MIN_STACK_SIZE);
    (size + page - 1) & !(page - 1)
}

/// One mapped fiber stack
///
/// `base` is the start of the mapping (the guard page); the usable region
/// is `[base + page, base + map_len)` and the stack grows down from
/// `top()`. Unmapped on drop.
pub struct Stack {
    base: NonNull<u8>,
    map_len: usize,
    size: usize,
}

impl Stack {
    /// Map a new stack with `size` usable bytes (already page-aligned)
    pub fn new(size: usize) -> FiberResult<Stack> {
        let page = page_size();
        let map_len = size + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::OutOfMemory {
                requested: map_len,
                object: "fiber stack",
            });
        }

        // Usable region above the guard page
        let usable = unsafe { (base as *mut u8).add(page) };
        let ret = unsafe {
            libc::mprotect(
                usable as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            let err = Error::from_errno("mprotect on fiber stack failed");
            unsafe { libc::munmap(base, map_len) };
            return Err(err);
        }

        Ok(Stack {
            base: NonNull::new(base as *mut u8).unwrap(),
            map_len,
            size,
        })
    }

    /// Usable stack size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total mapped bytes, guard page included
    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.map_len
    }

    /// Top of the stack (stacks grow down)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.map_len) }
    }

    /// Lowest usable address (just above the guard page)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(page_size()) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

/// Per-cord stack allocator with byte accounting
///
/// Pooling happens one level up: the cord's recycled-fiber cache keeps
/// whole fibers (stack included) keyed by stack size. The allocator only
/// maps, releases, and counts.
pub struct StackAllocator {
    bytes_used: Cell<usize>,
}

impl StackAllocator {
    pub fn new() -> Self {
        Self {
            bytes_used: Cell::new(0),
        }
    }

    /// Map a stack with `size` usable bytes (rounded up to pages)
    pub fn allocate(&self, size: usize) -> FiberResult<Stack> {
        let stack = Stack::new(align_stack_size(size))?;
        self.bytes_used.set(self.bytes_used.get() + stack.mapped_len());
        Ok(stack)
    }

    /// Unmap a stack and release its accounting
    pub fn release(&self, stack: Stack) {
        self.bytes_used.set(self.bytes_used.get() - stack.mapped_len());
        drop(stack);
    }

    /// Currently mapped stack bytes on this cord (guard pages included)
    pub fn bytes_used(&self) -> usize {
        self.bytes_used.get()
    }
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() {
        let stack = Stack::new(align_stack_size(64 * 1024)).unwrap();
        assert_eq!(stack.size(), 64 * 1024);
        assert_eq!(stack.mapped_len(), 64 * 1024 + page_size());
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(align_stack_size(MIN_STACK_SIZE)).unwrap();
        unsafe {
            let top = stack.top();
            // Touch the first and last usable bytes
            std::ptr::write_volatile(top.sub(1), 0xAB);
            std::ptr::write_volatile(stack.bottom(), 0xCD);
            assert_eq!(std::ptr::read_volatile(top.sub(1)), 0xAB);
        }
    }

    #[test]
    fn test_align_stack_size() {
        let page = page_size();
        assert_eq!(align_stack_size(1), align_stack_size(MIN_STACK_SIZE));
        assert_eq!(align_stack_size(MIN_STACK_SIZE) % page, 0);
        let bumped = align_stack_size(MIN_STACK_SIZE + 1);
        assert_eq!(bumped % page, 0);
        assert!(bumped > MIN_STACK_SIZE);
    }

    #[test]
    fn test_allocator_accounting() {
        let alloc = StackAllocator::new();
        assert_eq!(alloc.bytes_used(), 0);

        let s1 = alloc.allocate(DEFAULT_STACK_SIZE).unwrap();
        let s2 = alloc.allocate(DEFAULT_STACK_SIZE * 2).unwrap();
        let expected = s1.mapped_len() + s2.mapped_len();
        assert_eq!(alloc.bytes_used(), expected);

        alloc.release(s1);
        alloc.release(s2);
        assert_eq!(alloc.bytes_used(), 0);
    }
}
