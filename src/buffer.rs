use std::io;
use std::os::fd::RawFd;

/// Bytes reserved in front of the read index so small headers can be
/// prepended without shifting the payload.
pub const CHEAP_PREPEND: usize = 8;

/// Initial body capacity (excluding the prepend region).
pub const INITIAL_SIZE: usize = 1024;

/// Growable byte buffer with separate read and write indices.
///
/// Layout:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      read_index   <=    write_index    <=    capacity
/// ```
///
/// Readable bytes are the payload; appends extend the writable region,
/// reclaiming the already-read prefix before reallocating. The region in
/// front of the read index never shrinks below zero and starts at
/// [`CHEAP_PREPEND`] so callers can stamp a length header in place.
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// The readable payload, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Advance the read index by `n` bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Drop everything readable and reset both indices to the buffer
    /// start, so future appends reuse the whole backing store.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consume and return the first `n` readable bytes.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    /// Consume and return the whole readable payload.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_bytes(n)
    }

    /// Consume the first `n` readable bytes as UTF-8, lossily.
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(n)).into_owned()
    }

    /// Consume the whole readable payload as UTF-8, lossily.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let n = self.readable_bytes();
        self.retrieve_as_string(n)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Write `data` immediately in front of the read index.
    ///
    /// Panics if `data` does not fit the prependable region; headers must
    /// be sized within [`CHEAP_PREPEND`] unless earlier retrieves have
    /// widened the region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        self.buf[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() < len + CHEAP_PREPEND {
            // Not enough slack anywhere; grow the backing store.
            self.buf.resize(self.write_index + len, 0);
        } else {
            // Reclaim the already-read prefix by shifting the payload
            // back to the prepend boundary.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Drain the descriptor's pending bytes with one vectored read.
    ///
    /// The read is split between the writable tail and a 64KiB stack
    /// extension buffer; the extension is appended only when the tail
    /// filled, so one burst cannot force unbounded growth while the
    /// kernel buffer is still drained in a single syscall.
    ///
    /// Returns `Ok(0)` on peer EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // Skip the extension when the tail is already large; one readv is
        // still bounded by the tail size.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}
