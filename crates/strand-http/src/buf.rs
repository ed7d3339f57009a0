//! Contiguous byte buffer with a read cursor
//!
//! Producer/consumer buffer for the streaming send path and the receive
//! overflow. Writes append at the tail; reads advance the cursor; storage
//! is reclaimed whenever the buffer drains.

/// Byte buffer with a consume cursor
pub struct IBuf {
    buf: Vec<u8>,
    rpos: usize,
}

impl IBuf {
    pub fn new() -> IBuf {
        IBuf {
            buf: Vec::new(),
            rpos: 0,
        }
    }

    /// Unread bytes
    #[inline]
    pub fn used(&self) -> usize {
        self.buf.len() - self.rpos
    }

    /// Append bytes at the tail
    pub fn write(&mut self, data: &[u8]) {
        if self.used() == 0 && self.rpos != 0 {
            self.reset();
        }
        self.buf.extend_from_slice(data);
    }

    /// Copy up to `out.len()` unread bytes and consume them
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.used().min(out.len());
        out[..n].copy_from_slice(&self.buf[self.rpos..self.rpos + n]);
        self.consume(n);
        n
    }

    /// Advance the read cursor
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used());
        self.rpos += n;
        if self.rpos == self.buf.len() {
            self.reset();
        }
    }

    /// Discard everything
    pub fn reset(&mut self) {
        self.buf.clear();
        self.rpos = 0;
    }
}

impl Default for IBuf {
    fn default() -> Self {
        Self::new()
    }
}
