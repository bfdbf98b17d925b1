//! A growable byte buffer that scrubs its contents.
//!
//! Used for channel receive buffers and packet input, anything that may
//! hold decrypted plaintext.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use zeroize::Zeroize;

/// Bytes are appended at the end and consumed from the front.
///
/// Memory is zeroed when dropped, cleared, or moved to a larger allocation.
#[derive(Default)]
pub struct SshBuffer {
    data: Vec<u8>,
    /// Read position, bytes before this have been consumed
    pos: usize,
}

impl SshBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap), pos: 0 }
    }

    /// Unread length
    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unread bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..]
    }

    /// Ensures room for `extra` more bytes without a further reallocation.
    ///
    /// Consumed space is reclaimed first. A new allocation copies the
    /// unread bytes and zeroes the old one.
    pub fn reserve(&mut self, extra: usize) {
        if self.pos > 0 {
            self.compact();
        }
        let need = self.data.len() + extra;
        if need <= self.data.capacity() {
            return;
        }
        let cap = need.max(self.data.capacity() * 2);
        let mut n = Vec::with_capacity(cap);
        n.extend_from_slice(&self.data);
        // zeroize() on a Vec also scrubs spare capacity
        self.data.zeroize();
        self.data = n;
    }

    fn compact(&mut self) {
        let len = self.len();
        self.data.copy_within(self.pos.., 0);
        self.data[len..].zeroize();
        self.data.truncate(len);
        self.pos = 0;
    }

    /// Appends bytes
    pub fn extend(&mut self, b: &[u8]) {
        self.reserve(b.len());
        self.data.extend_from_slice(b);
    }

    /// Sets the unread length, new bytes are zero.
    pub fn resize(&mut self, len: usize) {
        let cur = self.len();
        if len > cur {
            self.reserve(len - cur);
        } else {
            self.data[self.pos + len..].zeroize();
        }
        self.data.resize(self.pos + len, 0);
    }

    /// Copies unread bytes out, returning the length copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.consume(n);
        n
    }

    /// Discards `n` unread bytes
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len());
        self.data[self.pos..self.pos + n].zeroize();
        self.pos += n;
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
        }
    }

    /// Zeroes and empties the buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.data.zeroize();
        self.pos = 0;
    }
}

impl Drop for SshBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

// Contents are never printed
impl core::fmt::Debug for SshBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SshBuffer").field("len", &self.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn fifo() {
        init_test_log();
        let mut b = SshBuffer::new();
        b.extend(b"hello ");
        b.extend(b"world");
        let mut out = [0u8; 8];
        assert_eq!(b.read(&mut out), 8);
        assert_eq!(&out, b"hello wo");
        assert_eq!(b.as_slice(), b"rld");
        b.extend(b"!");
        assert_eq!(b.read(&mut out), 4);
        assert_eq!(&out[..4], b"rld!");
        assert!(b.is_empty());
        assert_eq!(b.read(&mut out), 0);
    }

    #[test]
    fn growth_keeps_data() {
        let mut b = SshBuffer::with_capacity(4);
        for i in 0..1000u32 {
            b.extend(&i.to_be_bytes());
        }
        b.consume(4 * 500);
        b.extend(&[0xff; 10000]);
        assert_eq!(b.len(), 4 * 500 + 10000);
        assert_eq!(&b.as_slice()[..4], &500u32.to_be_bytes());
    }

    #[test]
    fn resize_zeroes() {
        let mut b = SshBuffer::new();
        b.extend(&[9; 16]);
        b.resize(4);
        b.resize(8);
        assert_eq!(b.as_slice(), &[9, 9, 9, 9, 0, 0, 0, 0]);
        b.as_mut_slice()[7] = 1;
        b.clear();
        assert!(b.is_empty());
    }
}
