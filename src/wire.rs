// Bounds-checked byte cursor for the fixed-offset wire codecs.
//
// Every receive path parses attacker-controlled bytes through a Reader, which
// rejects truncation before any copy happens. Lengths read off the wire must
// be validated by the caller before they drive an allocation.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Trailing bytes after structure: {0}")]
    TrailingBytes(usize),

    #[error("Invalid discriminator: {0}")]
    InvalidDiscriminator(u8),

    #[error("Field out of bounds: {0}")]
    FieldOutOfBounds(&'static str),
}

/// Append-only writer. Integers are packed big-endian.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Writes `v` into a field of exactly `width` bytes, zero padded.
    /// `v` longer than `width` is a caller bug; the excess is truncated.
    pub fn put_padded(&mut self, v: &[u8], width: usize) {
        let take = v.len().min(width);
        self.buf.extend_from_slice(&v[..take]);
        self.buf.extend(std::iter::repeat(0u8).take(width - take));
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Forward-only reader over a borrowed buffer.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.remaining() < n {
            return Err(WireError::BufferTooShort {
                need: self.pos + n,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take_u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn take_u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        let mut b = [0u8; 2];
        b.copy_from_slice(&self.data[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(u16::from_be_bytes(b))
    }

    pub fn take_u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(b))
    }

    pub fn take_u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_be_bytes(b))
    }

    pub fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.need(n)?;
        let v = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take_bytes(N)?);
        Ok(out)
    }

    /// Everything not yet consumed.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let v = &self.data[self.pos..];
        self.pos = self.data.len();
        v
    }

    /// Fails unless the buffer was consumed exactly.
    pub fn finish(self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_integers() {
        let mut w = Writer::new();
        w.put_u8(0xAB);
        w.put_u16(0x1234);
        w.put_u32(0xDEADBEEF);
        w.put_u64(0x0102030405060708);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.take_u8().unwrap(), 0xAB);
        assert_eq!(r.take_u16().unwrap(), 0x1234);
        assert_eq!(r.take_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.take_u64().unwrap(), 0x0102030405060708);
        r.finish().unwrap();
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = [0u8; 3];
        let mut r = Reader::new(&bytes);
        let err = r.take_u32().unwrap_err();
        assert_eq!(err, WireError::BufferTooShort { need: 4, got: 3 });
        // The cursor does not advance on failure
        assert_eq!(r.remaining(), 3);
    }

    #[test]
    fn test_padded_field() {
        let mut w = Writer::new();
        w.put_padded(b"abc", 8);
        let bytes = w.into_bytes();
        assert_eq!(&bytes, &[b'a', b'b', b'c', 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let bytes = [1u8, 2, 3];
        let mut r = Reader::new(&bytes);
        let _ = r.take_u8().unwrap();
        assert_eq!(r.finish().unwrap_err(), WireError::TrailingBytes(2));
    }

    #[test]
    fn test_take_array() {
        let bytes = [9u8; 32];
        let mut r = Reader::new(&bytes);
        let arr: [u8; 32] = r.take_array().unwrap();
        assert_eq!(arr, [9u8; 32]);
    }
}
