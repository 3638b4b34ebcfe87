// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Schema-driven payload reading.
//!
//! Apps declare what a message looks like by the sequence of reads
//! they perform: fixed-width integers (with or without network-order
//! conversion), a leading 1-byte case tag for switched layouts, and a
//! bounded variable-length tail (string, bytes, or fixed-size
//! elements). Every read validates against the remaining payload; a
//! failed read means the client sent a malformed message and is
//! typically answered with `Control::Close(code)`.

use std::fmt;

/// Why a payload failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes remained than the read required.
    Short,

    /// A bounded read fell outside its declared min/max.
    Bounds,

    /// A string read was not valid UTF-8.
    Utf8,

    /// Bytes remained after the schema consumed the whole layout.
    Trailing,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecodeError::Short => "payload shorter than the declared layout",
            DecodeError::Bounds => "length outside declared bounds",
            DecodeError::Utf8 => "string field is not valid UTF-8",
            DecodeError::Trailing => "payload longer than the declared layout",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for DecodeError {}

/// Sequential reader over one message payload.
#[derive(Debug, Clone, Copy)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    at: usize,
}

macro_rules! int_reads {
    ($plain:ident, $net:ident, $ty:ty) => {
        /// Native-order fixed-width read.
        pub fn $plain(&mut self) -> Result<$ty, DecodeError> {
            let bytes = self.take(std::mem::size_of::<$ty>())?;
            Ok(<$ty>::from_ne_bytes(bytes.try_into().map_err(|_| DecodeError::Short)?))
        }

        /// Network-order (big-endian) fixed-width read.
        pub fn $net(&mut self) -> Result<$ty, DecodeError> {
            let bytes = self.take(std::mem::size_of::<$ty>())?;
            Ok(<$ty>::from_be_bytes(bytes.try_into().map_err(|_| DecodeError::Short)?))
        }
    };
}

impl<'a> PayloadReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            at: 0,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }

    /// Succeeds only when the payload was consumed exactly.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(DecodeError::Trailing)
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.at.checked_add(len).ok_or(DecodeError::Short)?;
        let bytes = self.buf.get(self.at..end).ok_or(DecodeError::Short)?;
        self.at = end;
        Ok(bytes)
    }

    /// Leading case tag for switched layouts.
    pub fn case(&mut self) -> Result<u8, DecodeError> {
        self.u8()
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    int_reads!(u16, u16_net, u16);
    int_reads!(u32, u32_net, u32);
    int_reads!(u64, u64_net, u64);
    int_reads!(i16, i16_net, i16);
    int_reads!(i32, i32_net, i32);
    int_reads!(i64, i64_net, i64);

    /// Fixed-length raw bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.take(len)
    }

    /// Consume the rest of the payload as raw bytes, validated against
    /// `[min, max]` byte lengths.
    pub fn tail_bytes(&mut self, min: usize, max: usize) -> Result<&'a [u8], DecodeError> {
        let len = self.remaining();
        if len < min || len > max {
            return Err(DecodeError::Bounds);
        }
        self.take(len)
    }

    /// Consume the rest of the payload as UTF-8, validated against
    /// `[min, max]` byte lengths.
    pub fn tail_str(&mut self, min: usize, max: usize) -> Result<&'a str, DecodeError> {
        let bytes = self.tail_bytes(min, max)?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::Utf8)
    }

    /// Consume the rest of the payload as fixed-size elements,
    /// validated against `[min, max]` element counts. Returns exact
    /// chunks of `elem_size` bytes.
    pub fn tail_elems(
        &mut self,
        elem_size: usize,
        min: usize,
        max: usize,
    ) -> Result<std::slice::ChunksExact<'a, u8>, DecodeError> {
        debug_assert!(elem_size > 0);
        let len = self.remaining();
        if len % elem_size != 0 {
            return Err(DecodeError::Bounds);
        }
        let count = len / elem_size;
        if count < min || count > max {
            return Err(DecodeError::Bounds);
        }
        Ok(self.take(len)?.chunks_exact(elem_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_reads() {
        let payload = [0x01, 0x02, 0x03, 0xAA, 0xBB, 0xCC, 0xDD];
        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.u8().unwrap(), 0x01);
        assert_eq!(r.u16_net().unwrap(), 0x0203);
        assert_eq!(r.u32_net().unwrap(), 0xAABBCCDD);
        r.finish().unwrap();
    }

    #[test]
    fn test_native_order_roundtrip() {
        let v = 0x1234_5678u32;
        let payload = v.to_ne_bytes();
        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.u32().unwrap(), v);
    }

    #[test]
    fn test_short_payload() {
        let mut r = PayloadReader::new(&[0x01]);
        assert_eq!(r.u32_net().unwrap_err(), DecodeError::Short);
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut r = PayloadReader::new(&[1, 2, 3]);
        r.u8().unwrap();
        assert_eq!(r.finish().unwrap_err(), DecodeError::Trailing);
    }

    #[test]
    fn test_case_switch() {
        let mut r = PayloadReader::new(&[2, 0xFF]);
        match r.case().unwrap() {
            2 => assert_eq!(r.u8().unwrap(), 0xFF),
            other => panic!("unexpected case {}", other),
        }
    }

    #[test]
    fn test_tail_str_bounds() {
        let mut r = PayloadReader::new(b"\x07hello");
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.tail_str(1, 16).unwrap(), "hello");

        let mut r = PayloadReader::new(b"hello");
        assert_eq!(r.tail_str(6, 16).unwrap_err(), DecodeError::Bounds);

        let mut r = PayloadReader::new(b"hello");
        assert_eq!(r.tail_str(0, 4).unwrap_err(), DecodeError::Bounds);
    }

    #[test]
    fn test_tail_str_utf8() {
        let mut r = PayloadReader::new(&[0xFF, 0xFE]);
        assert_eq!(r.tail_str(0, 16).unwrap_err(), DecodeError::Utf8);
    }

    #[test]
    fn test_tail_elems() {
        let payload = [0u8, 1, 0, 2, 0, 3];
        let mut r = PayloadReader::new(&payload);
        let values: Vec<u16> = r
            .tail_elems(2, 1, 8)
            .unwrap()
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_tail_elems_bounds() {
        let payload = [0u8; 6];
        // Ragged length.
        assert_eq!(
            PayloadReader::new(&payload).tail_elems(4, 0, 8).unwrap_err(),
            DecodeError::Bounds
        );
        // Count above max.
        assert_eq!(
            PayloadReader::new(&payload).tail_elems(2, 0, 2).unwrap_err(),
            DecodeError::Bounds
        );
        // Count below min.
        assert_eq!(
            PayloadReader::new(&payload).tail_elems(2, 4, 8).unwrap_err(),
            DecodeError::Bounds
        );
    }

    #[test]
    fn test_fixed_bytes() {
        let mut r = PayloadReader::new(b"abcdef");
        assert_eq!(r.bytes(3).unwrap(), b"abc");
        assert_eq!(r.remaining(), 3);
    }
}
