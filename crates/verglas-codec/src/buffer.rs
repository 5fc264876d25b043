use bytes::{Bytes, BytesMut};

use crate::EncodingError;

/// Contiguous byte buffer with an absolute cursor.
///
/// The write side appends at the end and patches earlier positions for
/// back-filled sizes; the read side advances the cursor and fails with
/// [`EncodingError::UnmarshalOutOfBounds`] when fewer bytes remain than
/// requested. Resizing clamps the cursor into `[0, len]`.
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
    pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Buffer { data: BytesMut::with_capacity(cap), pos: 0 }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Buffer { data: BytesMut::from(&data[..]), pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Set the cursor, clamped into `[0, len]`.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Grow or shrink to `len` bytes; new bytes are zeroed and the cursor
    /// is clamped.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
        self.pos = self.pos.min(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes at the end; the cursor does not move.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Overwrite previously written bytes at `pos`.
    ///
    /// Panics if the range was never written; size patches only ever
    /// target placeholder bytes.
    pub fn patch(&mut self, pos: usize, bytes: &[u8]) {
        self.data[pos..pos + bytes.len()].copy_from_slice(bytes);
    }

    /// Read exactly `out.len()` bytes, advancing the cursor.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), EncodingError> {
        if self.remaining() < out.len() {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        out.copy_from_slice(&self.data[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }

    /// Advance the cursor without copying.
    pub fn skip(&mut self, n: usize) -> Result<(), EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        self.pos += n;
        Ok(())
    }

    /// Borrow `n` bytes at the cursor and advance past them.
    pub fn read_slice(&mut self, n: usize) -> Result<&[u8], EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Hand the accumulated bytes off; the buffer is left empty.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_advances_cursor() {
        let mut buf = Buffer::from_vec(vec![1, 2, 3, 4]);
        let mut out = [0u8; 2];
        buf.read_exact(&mut out).unwrap();
        assert_eq!(out, [1, 2]);
        assert_eq!(buf.pos(), 2);
        assert_eq!(buf.remaining(), 2);
    }

    #[test]
    fn short_read_is_out_of_bounds() {
        let mut buf = Buffer::from_vec(vec![1]);
        let mut out = [0u8; 2];
        assert_eq!(
            buf.read_exact(&mut out),
            Err(EncodingError::UnmarshalOutOfBounds)
        );
    }

    #[test]
    fn resize_clamps_cursor() {
        let mut buf = Buffer::from_vec(vec![0; 8]);
        buf.set_pos(8);
        buf.resize(3);
        assert_eq!(buf.pos(), 3);
        buf.resize(10);
        assert_eq!(buf.pos(), 3);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn set_pos_clamps() {
        let mut buf = Buffer::from_vec(vec![0; 4]);
        buf.set_pos(99);
        assert_eq!(buf.pos(), 4);
    }

    #[test]
    fn patch_overwrites() {
        let mut buf = Buffer::new();
        buf.append(&[0, 0, 0, 0, 9]);
        buf.patch(1, &[7, 8]);
        assert_eq!(buf.as_slice(), &[0, 7, 8, 0, 9]);
    }
}
