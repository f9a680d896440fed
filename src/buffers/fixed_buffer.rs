//! Fixed-length buffers for reuse. Every packet that is sent or stored by the reliability layer
//!  lives in one of these, and they are recycled through the `BufferPool`.
//!
//! A buffer is allocated once with MTU capacity. Writing goes through `BufMut`, and `as_ref()`
//!  covers what was written so far, so a buffer can be handed to the socket as is.

use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-length dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuf instance with the given buffer capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so eager initialization is paid once per buffer
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}


#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;

    fn new_fixed_buf(capacity: usize, content: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        result.put_slice(content);
        result
    }

    #[rstest]
    #[case::empty(new_fixed_buf(100, b""), 0)]
    #[case::header_only(new_fixed_buf(100, &[4, 0, 0]), 3)]
    #[case::full(new_fixed_buf(5, b"abcde"), 5)]
    fn test_len(#[case] buf: FixedBuf, #[case] expected: usize) {
        assert_eq!(buf.len(), expected);
        assert_eq!(buf.is_empty(), expected == 0);
        assert_eq!(buf.as_ref().len(), expected);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = new_fixed_buf(20, b"payload");
        buf.clear();

        assert!(buf.is_empty());
        assert_eq!(buf.as_ref(), b"");
        assert_eq!(buf.capacity(), 20);
        assert_eq!(buf.remaining_mut(), 20);
    }

    #[rstest]
    #[case::same(new_fixed_buf(100, b"hi"), new_fixed_buf(100, b"hi"), true)]
    #[case::different_capacity(new_fixed_buf(100, b"hi"), new_fixed_buf(200, b"hi"), true)]
    #[case::different_content(new_fixed_buf(100, b"hi"), new_fixed_buf(100, b"yo"), false)]
    #[case::prefix(new_fixed_buf(100, b"h"), new_fixed_buf(100, b"hi"), false)]
    fn test_eq_ignores_capacity(#[case] buf1: FixedBuf, #[case] buf2: FixedBuf, #[case] expected: bool) {
        assert_eq!(buf1 == buf2, expected);
    }

    #[test]
    fn test_sequence_header_rewrite() {
        let mut buf = new_fixed_buf(20, &[3, 0, 0, 0, 0]);
        buf.put_slice(b"msg");
        (&mut buf.as_mut()[1..5]).put_u32_le(0x04030201);
        assert_eq!(buf.as_ref(), b"\x03\x01\x02\x03\x04msg");
    }

    #[test]
    fn test_put_little_endian() {
        let mut buf = FixedBuf::new(10);
        buf.put_u8(5);
        buf.put_u16_le(0x0201);
        buf.put_u32_le(7);
        assert_eq!(buf.as_ref(), &[5, 1, 2, 7, 0, 0, 0]);
        assert_eq!(buf.remaining_mut(), 3);
    }

    #[test]
    #[should_panic]
    fn test_put_beyond_capacity() {
        let mut buf = FixedBuf::new(2);
        buf.put_slice(b"abc");
    }
}
