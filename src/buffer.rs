//! Growable byte buffer backing the send pipeline and receive pump.
//!
//! `ByteBuffer` is the sole storage primitive for per-connection data: an
//! append-only byte region that grows geometrically, keeps its capacity
//! across `clear`, and hands out plain slices for socket I/O. It carries no
//! internal synchronization; the owning session supplies it.

use bytes::BytesMut;

/// Append-only byte region with explicit capacity management.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: BytesMut,
}

impl ByteBuffer {
    /// Create an empty buffer with no reserved capacity.
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
        }
    }

    /// Create an empty buffer with at least `capacity` bytes reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Current number of bytes stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Currently reserved capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Reset the size to zero. Capacity is retained.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Ensure total capacity is at least `capacity` bytes. Never shrinks.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.data.capacity() {
            self.data.reserve(capacity - self.data.len());
        }
    }

    /// Append bytes from `src`, doubling capacity until the request fits.
    pub fn append(&mut self, src: &[u8]) {
        let needed = self.data.len() + src.len();
        if needed > self.data.capacity() {
            let mut target = self.data.capacity().max(64);
            while target < needed {
                target *= 2;
            }
            self.data.reserve(target - self.data.len());
        }
        self.data.extend_from_slice(src);
    }

    /// Resize to exactly `len` bytes, zero-filling any extension.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// The stored bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The stored bytes, mutably. Used as the target of socket reads.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.as_slice(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_clear_retains_capacity() {
        let mut buf = ByteBuffer::with_capacity(256);
        buf.append(&[0xAB; 200]);
        let cap = buf.capacity();
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= cap);
    }

    #[test]
    fn test_growth_is_geometric() {
        let mut buf = ByteBuffer::with_capacity(64);
        buf.append(&[0u8; 65]);
        assert!(buf.capacity() >= 128);
        buf.append(&[0u8; 1000]);
        assert!(buf.capacity() >= 1065);
        assert_eq!(buf.len(), 1065);
    }

    #[test]
    fn test_reserve_never_shrinks() {
        let mut buf = ByteBuffer::with_capacity(1024);
        buf.reserve(16);
        assert!(buf.capacity() >= 1024);
        buf.reserve(4096);
        assert!(buf.capacity() >= 4096);
    }

    #[test]
    fn test_resize_zero_fills() {
        let mut buf = ByteBuffer::new();
        buf.append(b"ab");
        buf.resize(4);
        assert_eq!(buf.as_slice(), &[b'a', b'b', 0, 0]);
        buf.resize(1);
        assert_eq!(buf.as_slice(), b"a");
    }
}
