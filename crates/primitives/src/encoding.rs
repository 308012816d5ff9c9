//! Fixed-layout big-endian encode/decode helpers.

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    UnexpectedEof,
    TrailingBytes,
    Overflow,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "input ended before the declared layout"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after the declared layout"),
            DecodeError::Overflow => write!(f, "declared length exceeds the input"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32_be(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64_be(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_fixed::<4>()?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_u64_be(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_fixed::<8>()?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.offset;
        self.offset += count;
        Ok(&self.bytes[start..self.offset])
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_scalars_big_endian() {
        let mut encoder = Encoder::new();
        encoder.write_u64_be(0x0102_0304_0506_0708);
        encoder.write_u32_be(7);
        encoder.write_u8(0xfe);
        let bytes = encoder.into_inner();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[7], 0x08);

        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_u64_be().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(decoder.read_u32_be().unwrap(), 7);
        assert_eq!(decoder.read_u8().unwrap(), 0xfe);
        assert!(decoder.is_empty());
    }

    #[test]
    fn short_reads_fail() {
        let mut decoder = Decoder::new(&[0u8; 3]);
        assert_eq!(decoder.read_u32_be(), Err(DecodeError::UnexpectedEof));
    }
}
