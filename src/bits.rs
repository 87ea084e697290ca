//! Bit strings: the unit of data every parse and specialize step works on.
//!
//! Bits are stored MSB-first in a byte buffer; bits past `len` are always zero
//! so two equal bit strings have equal buffers.

use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct BitString {
    bytes: Vec<u8>,
    len: usize,
}

impl BitString {
    pub fn new() -> Self {
        BitString::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        BitString {
            bytes: bytes.to_vec(),
            len: bytes.len() * 8,
        }
    }

    /// Parse a string of `0`/`1` characters (underscores are ignored).
    pub fn from_binary(s: &str) -> Option<Self> {
        let mut out = BitString::new();
        for c in s.chars() {
            match c {
                '0' => out.push(false),
                '1' => out.push(true),
                '_' => {}
                _ => return None,
            }
        }
        Some(out)
    }

    pub fn zeros(len: usize) -> Self {
        BitString {
            bytes: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Big-endian rendering of the low `bits` bits of `value`.
    pub fn from_uint(value: u128, bits: usize) -> Self {
        let mut out = BitString::zeros(bits);
        for i in 0..bits {
            let shift = bits - 1 - i;
            if shift < 128 && (value >> shift) & 1 == 1 {
                out.set(i, true);
            }
        }
        out
    }

    /// Big-endian integer value; `None` past 128 bits.
    pub fn to_uint(&self) -> Option<u128> {
        if self.len > 128 {
            return None;
        }
        let mut v: u128 = 0;
        for i in 0..self.len {
            v = (v << 1) | u128::from(self.get(i));
        }
        Some(v)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.len % 8 == 0
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.bytes[i / 8] & (0x80 >> (i % 8)) != 0
    }

    fn set(&mut self, i: usize, bit: bool) {
        let mask = 0x80 >> (i % 8);
        if bit {
            self.bytes[i / 8] |= mask;
        } else {
            self.bytes[i / 8] &= !mask;
        }
    }

    pub fn flip(&mut self, i: usize) {
        if i < self.len {
            let bit = self.get(i);
            self.set(i, !bit);
        }
    }

    pub fn push(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        self.len += 1;
        self.set(self.len - 1, bit);
    }

    pub fn extend(&mut self, other: &BitString) {
        if self.is_byte_aligned() {
            self.bytes.extend_from_slice(&other.bytes);
            self.len += other.len;
            return;
        }
        for i in 0..other.len {
            self.push(other.get(i));
        }
    }

    pub fn concat<'a, I: IntoIterator<Item = &'a BitString>>(parts: I) -> BitString {
        let mut out = BitString::new();
        for p in parts {
            out.extend(p);
        }
        out
    }

    /// Bits `[start, end)`; out-of-range bounds are clamped.
    pub fn slice(&self, start: usize, end: usize) -> BitString {
        let end = end.min(self.len);
        let start = start.min(end);
        if start % 8 == 0 {
            let mut out = BitString {
                bytes: self.bytes[start / 8..end.div_ceil(8)].to_vec(),
                len: end - start,
            };
            out.clear_tail();
            return out;
        }
        let mut out = BitString::new();
        for i in start..end {
            out.push(self.get(i));
        }
        out
    }

    /// True when `self` occurs in `data` at bit `offset`.
    pub fn matches_at(&self, data: &BitString, offset: usize) -> bool {
        if offset + self.len > data.len {
            return false;
        }
        if offset % 8 == 0 && self.is_byte_aligned() {
            let start = offset / 8;
            return data.bytes[start..start + self.bytes.len()] == self.bytes[..];
        }
        (0..self.len).all(|i| self.get(i) == data.get(offset + i))
    }

    /// Bytes of the bit string, right-padded with zero bits to a byte boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn clear_tail(&mut self) {
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xffu8 << (8 - rem);
            }
        }
    }
}

impl From<Vec<u8>> for BitString {
    fn from(bytes: Vec<u8>) -> Self {
        let len = bytes.len() * 8;
        BitString { bytes, len }
    }
}

impl From<&[u8]> for BitString {
    fn from(bytes: &[u8]) -> Self {
        BitString::from_bytes(bytes)
    }
}

impl fmt::Display for BitString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_byte_aligned() {
            write!(f, "{}", hex::encode(&self.bytes))
        } else {
            for i in 0..self.len {
                f.write_str(if self.get(i) { "1" } else { "0" })?;
            }
            Ok(())
        }
    }
}

impl fmt::Debug for BitString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitString({}b: {})", self.len, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_back() {
        let b = BitString::from_binary("1011_0").expect("binary");
        assert_eq!(b.len(), 5);
        assert_eq!(b.as_bytes(), &[0b1011_0000]);
        assert_eq!(b.to_string(), "10110");
    }

    #[test]
    fn unaligned_extend_and_slice() {
        let mut b = BitString::from_binary("101").expect("binary");
        b.extend(&BitString::from_bytes(&[0xff]));
        assert_eq!(b.len(), 11);
        assert_eq!(b.slice(3, 11), BitString::from_bytes(&[0xff]));
        assert_eq!(b.slice(0, 4).to_string(), "1011");
    }

    #[test]
    fn uint_round_trip() {
        let b = BitString::from_uint(0x1234, 16);
        assert_eq!(b.as_bytes(), &[0x12, 0x34]);
        assert_eq!(b.to_uint(), Some(0x1234));
        assert_eq!(BitString::from_uint(5, 3).to_string(), "101");
    }

    #[test]
    fn matches_at_offsets() {
        let data = BitString::from_bytes(b"\x22\x00\x44");
        assert!(BitString::from_bytes(b"\x00\x44").matches_at(&data, 8));
        assert!(!BitString::from_bytes(b"\x00\x44").matches_at(&data, 0));
        assert!(BitString::from_binary("0010").expect("binary").matches_at(&data, 0));
        assert!(!BitString::from_bytes(b"\x44\x00").matches_at(&data, 16));
    }

    #[test]
    fn flip_single_bit() {
        let mut b = BitString::from_bytes(&[0x00]);
        b.flip(7);
        assert_eq!(b.as_bytes(), &[0x01]);
    }
}
