//! Leaf data types: length bounds, fixed values, and the conversion between
//! typed [`Value`]s and their bit representation.
//!
//! The engine only relies on the [`DataType`] trait; the concrete types here
//! cover the usual protocol leaves (raw bytes, ASCII, integers, bit arrays,
//! IPv4 addresses, timestamps).

use crate::bits::BitString;
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rand::{Rng, RngCore};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeError {
    #[error("{type_name}: value {value} out of range")]
    OutOfRange { type_name: &'static str, value: String },
    #[error("{type_name}: cannot represent {found}")]
    WrongKind { type_name: &'static str, found: String },
    #[error("{type_name}: {len} bits is not a valid length")]
    Length { type_name: &'static str, len: usize },
    #[error("invalid type parameter: {0}")]
    Invalid(String),
}

/// Semantic leaf descriptor consumed by the parser and specializer.
pub trait DataType: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Length bounds in bits; `None` as maximum means unbounded.
    fn size(&self) -> (usize, Option<usize>);

    /// Length granularity in bits.
    fn unit_bits(&self) -> usize {
        8
    }

    /// The fixed value, when the type is constant.
    fn value(&self) -> Option<BitString> {
        None
    }

    fn can_parse(&self, bits: &BitString) -> bool {
        if !self.accepts_len(bits.len()) {
            return false;
        }
        match self.value() {
            Some(v) => v == *bits,
            None => true,
        }
    }

    /// A value satisfying the type; unbounded types stop at `cap_bits`.
    fn generate(&self, rng: &mut dyn RngCore, cap_bits: usize) -> BitString;

    /// Typed value to bits.
    fn decode(&self, value: &Value) -> Result<BitString, TypeError>;

    /// Bits to typed value.
    fn encode(&self, bits: &BitString) -> Result<Value, TypeError>;

    fn accepts_len(&self, len: usize) -> bool {
        let (min, max) = self.size();
        len >= min && max.map_or(true, |m| len <= m) && len % self.unit_bits() == 0
    }

    /// Candidate lengths for a parse with `remaining` bits available, longest first.
    fn lengths(&self, remaining: usize) -> Vec<usize> {
        if let Some(v) = self.value() {
            return if v.len() <= remaining { vec![v.len()] } else { Vec::new() };
        }
        let (min, max) = self.size();
        let unit = self.unit_bits().max(1);
        let top = max.map_or(remaining, |m| m.min(remaining));
        if top < min {
            return Vec::new();
        }
        let top = top - top % unit;
        (min..=top).rev().filter(|l| l % unit == 0).collect()
    }
}

fn random_len(rng: &mut dyn RngCore, min: usize, max: Option<usize>, cap: usize) -> usize {
    let hi = max.unwrap_or_else(|| min.max(cap));
    if hi <= min {
        min
    } else {
        rng.random_range(min..=hi)
    }
}

fn random_bytes(rng: &mut dyn RngCore, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rng.fill_bytes(&mut buf);
    buf
}

fn bytes_of(type_name: &'static str, bits: &BitString) -> Result<Vec<u8>, TypeError> {
    if !bits.is_byte_aligned() {
        return Err(TypeError::Length { type_name, len: bits.len() });
    }
    Ok(bits.to_bytes())
}

/// Arbitrary bytes, fixed or within a byte-length range.
#[derive(Debug, Clone, PartialEq)]
pub struct Raw {
    value: Option<Vec<u8>>,
    min_bytes: usize,
    max_bytes: Option<usize>,
}

impl Raw {
    pub fn fixed(value: impl Into<Vec<u8>>) -> Self {
        let value = value.into();
        let n = value.len();
        Raw { value: Some(value), min_bytes: n, max_bytes: Some(n) }
    }

    pub fn sized(min_bytes: usize, max_bytes: Option<usize>) -> Result<Self, TypeError> {
        if max_bytes.is_some_and(|m| m < min_bytes) {
            return Err(TypeError::Invalid(format!("raw length {}..{:?}", min_bytes, max_bytes)));
        }
        Ok(Raw { value: None, min_bytes, max_bytes })
    }

    pub fn exact(n: usize) -> Self {
        Raw { value: None, min_bytes: n, max_bytes: Some(n) }
    }
}

impl DataType for Raw {
    fn name(&self) -> &'static str {
        "Raw"
    }

    fn size(&self) -> (usize, Option<usize>) {
        (self.min_bytes * 8, self.max_bytes.map(|m| m * 8))
    }

    fn value(&self) -> Option<BitString> {
        self.value.as_deref().map(BitString::from_bytes)
    }

    fn generate(&self, rng: &mut dyn RngCore, cap_bits: usize) -> BitString {
        if let Some(v) = &self.value {
            return BitString::from_bytes(v);
        }
        let n = random_len(rng, self.min_bytes, self.max_bytes, cap_bits / 8);
        BitString::from(random_bytes(rng, n))
    }

    fn decode(&self, value: &Value) -> Result<BitString, TypeError> {
        let bytes = match value {
            Value::Bytes(b) => b.clone(),
            Value::Text(s) => s.as_bytes().to_vec(),
            Value::Int(x) if *x >= 0 => {
                let raw = x.to_be_bytes();
                let skip = raw.iter().take_while(|b| **b == 0).count().min(raw.len() - 1);
                let mut bytes = raw[skip..].to_vec();
                while bytes.len() < self.min_bytes {
                    bytes.insert(0, 0);
                }
                bytes
            }
            Value::Bits(b) => bytes_of("Raw", b)?,
            other => {
                return Err(TypeError::WrongKind { type_name: "Raw", found: other.to_string() })
            }
        };
        let bits = BitString::from(bytes);
        if !self.accepts_len(bits.len()) {
            return Err(TypeError::Length { type_name: "Raw", len: bits.len() });
        }
        Ok(bits)
    }

    fn encode(&self, bits: &BitString) -> Result<Value, TypeError> {
        Ok(Value::Bytes(bytes_of("Raw", bits)?))
    }
}

/// ASCII text, fixed or within a character-length range.
#[derive(Debug, Clone, PartialEq)]
pub struct Ascii {
    value: Option<String>,
    min_chars: usize,
    max_chars: Option<usize>,
}

impl Ascii {
    pub fn fixed(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if !value.is_ascii() {
            return Err(TypeError::OutOfRange { type_name: "ASCII", value });
        }
        let n = value.len();
        Ok(Ascii { value: Some(value), min_chars: n, max_chars: Some(n) })
    }

    pub fn sized(min_chars: usize, max_chars: Option<usize>) -> Result<Self, TypeError> {
        if max_chars.is_some_and(|m| m < min_chars) {
            return Err(TypeError::Invalid(format!("ascii length {}..{:?}", min_chars, max_chars)));
        }
        Ok(Ascii { value: None, min_chars, max_chars })
    }
}

impl DataType for Ascii {
    fn name(&self) -> &'static str {
        "ASCII"
    }

    fn size(&self) -> (usize, Option<usize>) {
        (self.min_chars * 8, self.max_chars.map(|m| m * 8))
    }

    fn value(&self) -> Option<BitString> {
        self.value.as_ref().map(|s| BitString::from_bytes(s.as_bytes()))
    }

    fn can_parse(&self, bits: &BitString) -> bool {
        if !self.accepts_len(bits.len()) || !bits.as_bytes().is_ascii() {
            return false;
        }
        self.value().map_or(true, |v| v == *bits)
    }

    fn generate(&self, rng: &mut dyn RngCore, cap_bits: usize) -> BitString {
        if let Some(v) = &self.value {
            return BitString::from_bytes(v.as_bytes());
        }
        let n = random_len(rng, self.min_chars, self.max_chars, cap_bits / 8);
        let text: Vec<u8> = (0..n).map(|_| rng.random_range(0x20u8..=0x7e)).collect();
        BitString::from(text)
    }

    fn decode(&self, value: &Value) -> Result<BitString, TypeError> {
        let s = match value {
            Value::Text(s) => s.clone(),
            Value::Int(x) => x.to_string(),
            other => {
                return Err(TypeError::WrongKind { type_name: "ASCII", found: other.to_string() })
            }
        };
        if !s.is_ascii() {
            return Err(TypeError::OutOfRange { type_name: "ASCII", value: s });
        }
        Ok(BitString::from_bytes(s.as_bytes()))
    }

    fn encode(&self, bits: &BitString) -> Result<Value, TypeError> {
        let bytes = bytes_of("ASCII", bits)?;
        match String::from_utf8(bytes) {
            Ok(s) if s.is_ascii() => Ok(Value::Text(s)),
            _ => Err(TypeError::WrongKind { type_name: "ASCII", found: bits.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Signed,
    Unsigned,
}

/// Fixed-width integer with endianness, sign, and optional value or interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Integer {
    unit_bits: usize,
    endianness: Endianness,
    sign: Sign,
    value: Option<i128>,
    interval: Option<(i128, i128)>,
}

impl Integer {
    pub fn new(unit_bits: usize, endianness: Endianness, sign: Sign) -> Result<Self, TypeError> {
        if !matches!(unit_bits, 8 | 16 | 32 | 64) {
            return Err(TypeError::Invalid(format!("integer unit size {}", unit_bits)));
        }
        Ok(Integer { unit_bits, endianness, sign, value: None, interval: None })
    }

    pub fn uint8() -> Self {
        Integer { unit_bits: 8, endianness: Endianness::Big, sign: Sign::Unsigned, value: None, interval: None }
    }

    pub fn uint16() -> Self {
        Integer { unit_bits: 16, ..Integer::uint8() }
    }

    pub fn uint32() -> Self {
        Integer { unit_bits: 32, ..Integer::uint8() }
    }

    pub fn with_value(mut self, v: i128) -> Result<Self, TypeError> {
        self.check_bounds(v)?;
        self.value = Some(v);
        Ok(self)
    }

    pub fn with_interval(mut self, lo: i128, hi: i128) -> Result<Self, TypeError> {
        if lo > hi {
            return Err(TypeError::Invalid(format!("interval {}..{}", lo, hi)));
        }
        self.check_bounds(lo)?;
        self.check_bounds(hi)?;
        self.interval = Some((lo, hi));
        Ok(self)
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn bounds(&self) -> (i128, i128) {
        let b = self.unit_bits as u32;
        match self.sign {
            Sign::Unsigned => (0, (1i128 << b) - 1),
            Sign::Signed => (-(1i128 << (b - 1)), (1i128 << (b - 1)) - 1),
        }
    }

    fn check_bounds(&self, v: i128) -> Result<(), TypeError> {
        let (lo, hi) = self.bounds();
        if v < lo || v > hi {
            return Err(TypeError::OutOfRange { type_name: "Integer", value: v.to_string() });
        }
        Ok(())
    }

    fn to_bits(&self, v: i128) -> Result<BitString, TypeError> {
        self.check_bounds(v)?;
        let n = self.unit_bits / 8;
        let mut buf = [0u8; 8];
        match (self.sign, self.endianness) {
            (Sign::Unsigned, Endianness::Big) => BigEndian::write_uint(&mut buf, v as u64, n),
            (Sign::Unsigned, Endianness::Little) => LittleEndian::write_uint(&mut buf, v as u64, n),
            (Sign::Signed, Endianness::Big) => BigEndian::write_int(&mut buf, v as i64, n),
            (Sign::Signed, Endianness::Little) => LittleEndian::write_int(&mut buf, v as i64, n),
        }
        Ok(BitString::from_bytes(&buf[..n]))
    }

    fn from_bits(&self, bits: &BitString) -> Option<i128> {
        if bits.len() != self.unit_bits {
            return None;
        }
        let buf = bits.as_bytes();
        let n = self.unit_bits / 8;
        Some(match (self.sign, self.endianness) {
            (Sign::Unsigned, Endianness::Big) => i128::from(BigEndian::read_uint(buf, n)),
            (Sign::Unsigned, Endianness::Little) => i128::from(LittleEndian::read_uint(buf, n)),
            (Sign::Signed, Endianness::Big) => i128::from(BigEndian::read_int(buf, n)),
            (Sign::Signed, Endianness::Little) => i128::from(LittleEndian::read_int(buf, n)),
        })
    }
}

impl DataType for Integer {
    fn name(&self) -> &'static str {
        "Integer"
    }

    fn size(&self) -> (usize, Option<usize>) {
        (self.unit_bits, Some(self.unit_bits))
    }

    fn value(&self) -> Option<BitString> {
        self.value.and_then(|v| self.to_bits(v).ok())
    }

    fn can_parse(&self, bits: &BitString) -> bool {
        let Some(v) = self.from_bits(bits) else {
            return false;
        };
        if let Some(fixed) = self.value {
            return v == fixed;
        }
        self.interval.map_or(true, |(lo, hi)| v >= lo && v <= hi)
    }

    fn generate(&self, rng: &mut dyn RngCore, _cap_bits: usize) -> BitString {
        let v = match self.value {
            Some(v) => v,
            None => {
                let (lo, hi) = self.interval.unwrap_or_else(|| self.bounds());
                rng.random_range(lo..=hi)
            }
        };
        self.to_bits(v).unwrap_or_else(|_| BitString::zeros(self.unit_bits))
    }

    fn decode(&self, value: &Value) -> Result<BitString, TypeError> {
        match value {
            Value::Int(v) => self.to_bits(*v),
            other => Err(TypeError::WrongKind { type_name: "Integer", found: other.to_string() }),
        }
    }

    fn encode(&self, bits: &BitString) -> Result<Value, TypeError> {
        self.from_bits(bits)
            .map(Value::Int)
            .ok_or(TypeError::Length { type_name: "Integer", len: bits.len() })
    }
}

/// Bit-granular content.
#[derive(Debug, Clone, PartialEq)]
pub struct BitArray {
    value: Option<BitString>,
    min_bits: usize,
    max_bits: Option<usize>,
}

impl BitArray {
    pub fn fixed(value: BitString) -> Self {
        let n = value.len();
        BitArray { value: Some(value), min_bits: n, max_bits: Some(n) }
    }

    pub fn sized(min_bits: usize, max_bits: Option<usize>) -> Result<Self, TypeError> {
        if max_bits.is_some_and(|m| m < min_bits) {
            return Err(TypeError::Invalid(format!("bit length {}..{:?}", min_bits, max_bits)));
        }
        Ok(BitArray { value: None, min_bits, max_bits })
    }
}

impl DataType for BitArray {
    fn name(&self) -> &'static str {
        "BitArray"
    }

    fn size(&self) -> (usize, Option<usize>) {
        (self.min_bits, self.max_bits)
    }

    fn unit_bits(&self) -> usize {
        1
    }

    fn value(&self) -> Option<BitString> {
        self.value.clone()
    }

    fn generate(&self, rng: &mut dyn RngCore, cap_bits: usize) -> BitString {
        if let Some(v) = &self.value {
            return v.clone();
        }
        let n = random_len(rng, self.min_bits, self.max_bits, cap_bits);
        let mut out = BitString::new();
        for _ in 0..n {
            out.push(rng.random::<bool>());
        }
        out
    }

    fn decode(&self, value: &Value) -> Result<BitString, TypeError> {
        match value {
            Value::Bits(b) => Ok(b.clone()),
            Value::Bytes(b) => Ok(BitString::from_bytes(b)),
            other => Err(TypeError::WrongKind { type_name: "BitArray", found: other.to_string() }),
        }
    }

    fn encode(&self, bits: &BitString) -> Result<Value, TypeError> {
        Ok(Value::Bits(bits.clone()))
    }
}

/// IPv4 address, four bytes in network order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ipv4 {
    value: Option<Ipv4Addr>,
}

impl Ipv4 {
    pub fn new() -> Self {
        Ipv4::default()
    }

    pub fn fixed(addr: Ipv4Addr) -> Self {
        Ipv4 { value: Some(addr) }
    }
}

impl DataType for Ipv4 {
    fn name(&self) -> &'static str {
        "IPv4"
    }

    fn size(&self) -> (usize, Option<usize>) {
        (32, Some(32))
    }

    fn value(&self) -> Option<BitString> {
        self.value.map(|a| BitString::from_bytes(&a.octets()))
    }

    fn generate(&self, rng: &mut dyn RngCore, _cap_bits: usize) -> BitString {
        match self.value {
            Some(a) => BitString::from_bytes(&a.octets()),
            None => BitString::from(random_bytes(rng, 4)),
        }
    }

    fn decode(&self, value: &Value) -> Result<BitString, TypeError> {
        let addr = match value {
            Value::Ipv4(a) => *a,
            Value::Text(s) => s
                .parse::<Ipv4Addr>()
                .map_err(|_| TypeError::WrongKind { type_name: "IPv4", found: s.clone() })?,
            Value::Bytes(b) if b.len() == 4 => Ipv4Addr::new(b[0], b[1], b[2], b[3]),
            other => {
                return Err(TypeError::WrongKind { type_name: "IPv4", found: other.to_string() })
            }
        };
        Ok(BitString::from_bytes(&addr.octets()))
    }

    fn encode(&self, bits: &BitString) -> Result<Value, TypeError> {
        match bits.as_bytes() {
            [a, b, c, d] if bits.len() == 32 => Ok(Value::Ipv4(Ipv4Addr::new(*a, *b, *c, *d))),
            _ => Err(TypeError::Length { type_name: "IPv4", len: bits.len() }),
        }
    }
}

/// Unix timestamp: 32-bit unsigned seconds, big-endian.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Timestamp {
    value: Option<u32>,
}

impl Timestamp {
    pub fn new() -> Self {
        Timestamp::default()
    }

    pub fn fixed(seconds: u32) -> Self {
        Timestamp { value: Some(seconds) }
    }
}

impl DataType for Timestamp {
    fn name(&self) -> &'static str {
        "Timestamp"
    }

    fn size(&self) -> (usize, Option<usize>) {
        (32, Some(32))
    }

    fn value(&self) -> Option<BitString> {
        self.value.map(|s| BitString::from_uint(u128::from(s), 32))
    }

    fn generate(&self, rng: &mut dyn RngCore, _cap_bits: usize) -> BitString {
        let s = self.value.unwrap_or_else(|| rng.random::<u32>());
        BitString::from_uint(u128::from(s), 32)
    }

    fn decode(&self, value: &Value) -> Result<BitString, TypeError> {
        match value {
            Value::Int(v) if (0..=i128::from(u32::MAX)).contains(v) => {
                Ok(BitString::from_uint(*v as u128, 32))
            }
            other => Err(TypeError::OutOfRange { type_name: "Timestamp", value: other.to_string() }),
        }
    }

    fn encode(&self, bits: &BitString) -> Result<Value, TypeError> {
        if bits.len() != 32 {
            return Err(TypeError::Length { type_name: "Timestamp", len: bits.len() });
        }
        Ok(Value::Int(i128::from(BigEndian::read_u32(bits.as_bytes()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn integer_endianness() {
        let be = Integer::uint16();
        let le = Integer::new(16, Endianness::Little, Sign::Unsigned).expect("uint16le");
        assert_eq!(be.decode(&Value::Int(0x0102)).expect("be").as_bytes(), &[1, 2]);
        assert_eq!(le.decode(&Value::Int(0x0102)).expect("le").as_bytes(), &[2, 1]);
        assert_eq!(le.encode(&BitString::from_bytes(&[2, 1])).expect("le"), Value::Int(0x0102));
    }

    #[test]
    fn signed_integer_round_trip() {
        let t = Integer::new(8, Endianness::Big, Sign::Signed).expect("int8");
        let bits = t.decode(&Value::Int(-2)).expect("decode");
        assert_eq!(bits.as_bytes(), &[0xfe]);
        assert_eq!(t.encode(&bits).expect("encode"), Value::Int(-2));
        assert!(t.decode(&Value::Int(200)).is_err());
    }

    #[test]
    fn integer_interval_limits_parse_and_generate() {
        let t = Integer::uint8().with_interval(5, 8).expect("interval");
        assert!(t.can_parse(&BitString::from_bytes(&[6])));
        assert!(!t.can_parse(&BitString::from_bytes(&[9])));
        let mut rng = Pcg64::seed_from_u64(7);
        for _ in 0..32 {
            let v = t.generate(&mut rng, 64).as_bytes()[0];
            assert!((5..=8).contains(&v));
        }
    }

    #[test]
    fn raw_lengths_are_longest_first() {
        let t = Raw::sized(1, Some(3)).expect("raw");
        assert_eq!(t.lengths(40), vec![24, 16, 8]);
        assert_eq!(t.lengths(12), vec![8]);
        assert!(t.lengths(4).is_empty());
    }

    #[test]
    fn unbounded_generation_is_capped() {
        let t = Raw::sized(0, None).expect("raw");
        let mut rng = Pcg64::seed_from_u64(1);
        for _ in 0..16 {
            assert!(t.generate(&mut rng, 64 * 8).len() <= 64 * 8);
        }
    }

    #[test]
    fn ascii_rejects_binary() {
        let t = Ascii::sized(0, Some(4)).expect("ascii");
        assert!(t.can_parse(&BitString::from_bytes(b"ok")));
        assert!(!t.can_parse(&BitString::from_bytes(&[0xc3, 0xa9])));
    }

    #[test]
    fn ipv4_decode_from_text() {
        let t = Ipv4::new();
        let bits = t.decode(&Value::Text("10.0.0.1".into())).expect("ip");
        assert_eq!(bits.as_bytes(), &[10, 0, 0, 1]);
        assert_eq!(t.encode(&bits).expect("ip"), Value::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
    }
}
