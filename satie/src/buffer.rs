//! Growable byte buffer with separate read/write cursors.
//!
//! The reactor fills it straight from a socket with a two-segment readv so a
//! single syscall can land more than the buffer's current tail would hold;
//! the overflow spills into a 64 KiB stack extension and is appended after.

use std::io;

use libc::c_int;

use crate::syscalls;

const INITIAL_CAPACITY: usize = 1024;
const STACK_EXTENSION: usize = 65536;

pub struct ByteBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The unread region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Mark `n` readable bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        self.read_pos += n.min(self.readable_bytes());
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_str(&mut self, data: &str) {
        self.append(data.as_bytes());
    }

    /// Make room for `n` more bytes: reclaim the consumed prefix when that is
    /// enough, otherwise grow by doubling. Never shrinks.
    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= n {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
            return;
        }
        let needed = self.write_pos + n;
        let mut cap = self.buf.len().max(1);
        while cap < needed {
            cap *= 2;
        }
        self.buf.resize(cap, 0);
    }

    /// Fill from a socket with a single scatter read. `Ok(0)` is EOF;
    /// WouldBlock comes back as the io::Error for the caller to match.
    pub fn read_from_fd(&mut self, fd: c_int) -> io::Result<usize> {
        let mut extension = [0u8; STACK_EXTENSION];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_pos);
            syscalls::readv_fd(fd, &mut [tail, &mut extension[..]])?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extension[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::{close_fd, create_wake_pipe};

    #[test]
    fn append_and_consume_track_cursors() {
        let mut buf = ByteBuffer::new();
        assert_eq!(buf.readable_bytes(), 0);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.consume(6);
        assert_eq!(buf.peek(), b"world");

        // Consuming everything rewinds both cursors.
        buf.consume(5);
        assert_eq!(buf.readable_bytes(), 0);
        buf.append(b"x");
        assert_eq!(buf.peek(), b"x");
    }

    #[test]
    fn grows_by_doubling_past_capacity() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.append(&[7u8; 100]);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(buf.peek(), &[7u8; 100][..]);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(&[1u8; 12]);
        buf.consume(10);
        // 2 readable, 14 reclaimable: this fits without a resize.
        buf.append(&[2u8; 12]);
        assert_eq!(buf.readable_bytes(), 14);
        assert_eq!(&buf.peek()[..2], &[1u8, 1u8]);
    }

    #[test]
    fn read_from_fd_spills_into_extension() {
        let (rx, tx) = create_wake_pipe().unwrap();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        crate::syscalls::writev_fd(tx, &[&payload]).unwrap();

        let mut buf = ByteBuffer::with_capacity(64);
        let n = buf.read_from_fd(rx).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        // Drained pipe reports WouldBlock, not EOF.
        let err = buf.read_from_fd(rx).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

        close_fd(tx);
        let n = buf.read_from_fd(rx).unwrap();
        assert_eq!(n, 0);
        close_fd(rx);
    }
}
