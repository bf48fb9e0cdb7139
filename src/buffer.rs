//! Receive-side byte accumulator.
//!
//! Frame decoding sees the transport's arbitrary read boundaries, so partial
//! frames must be buffered between calls. The accumulator tracks consumed
//! bytes with a cursor instead of reallocating on every frame, and compacts
//! the backing storage once enough dead bytes pile up at the front.

const COMPACT_THRESHOLD: usize = 8 * 1024;

#[derive(Debug, Default)]
pub(crate) struct RecvBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl RecvBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The unconsumed bytes.
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Marks `n` bytes as consumed and compacts if the dead prefix has
    /// grown past the threshold.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.pos += n;
        if self.pos >= COMPACT_THRESHOLD || self.pos == self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_and_advance() {
        let mut b = RecvBuffer::new();
        b.extend(b"hello");
        b.extend(b" world");
        assert_eq!(b.as_slice(), b"hello world");
        b.advance(6);
        assert_eq!(b.as_slice(), b"world");
        assert_eq!(b.len(), 5);
    }

    #[test]
    fn test_full_consumption_resets_storage() {
        let mut b = RecvBuffer::new();
        b.extend(b"frame");
        b.advance(5);
        assert_eq!(b.len(), 0);
        assert_eq!(b.pos, 0);
        assert!(b.buf.is_empty());
    }

    #[test]
    fn test_compaction_bounds_dead_prefix() {
        let mut b = RecvBuffer::new();
        // Simulate sustained partial delivery: each round leaves a byte.
        for _ in 0..100 {
            b.extend(&[0u8; 512]);
            b.advance(511);
        }
        assert!(b.pos < COMPACT_THRESHOLD);
        assert_eq!(b.len(), 100);
    }

    #[test]
    fn test_clear() {
        let mut b = RecvBuffer::new();
        b.extend(b"junk");
        b.advance(1);
        b.clear();
        assert_eq!(b.len(), 0);
        assert_eq!(b.as_slice(), b"");
    }
}
