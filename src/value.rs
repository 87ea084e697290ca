//! Semantic values exchanged with data types (the typed view of a bit string).

use crate::bits::BitString;
use std::fmt;
use std::net::Ipv4Addr;

/// A single decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i128),
    Bytes(Vec<u8>),
    Text(String),
    Ipv4(Ipv4Addr),
    /// Sub-byte or unaligned content.
    Bits(BitString),
}

impl Value {
    /// Stable printable key for a bit string: the ASCII text when it survives a
    /// text round trip unchanged, hex otherwise.
    pub fn symbol_key(bits: &BitString) -> String {
        if bits.is_byte_aligned() && !bits.is_empty() {
            if let Ok(s) = std::str::from_utf8(bits.as_bytes()) {
                let printable = s.chars().all(|c| c.is_ascii_graphic() || c == ' ');
                if printable && BitString::from_bytes(s.as_bytes()) == *bits {
                    return s.to_string();
                }
            }
        }
        bits.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(x) => write!(f, "{}", x),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Ipv4(a) => write!(f, "{}", a),
            Value::Bits(b) => write!(f, "0b{}", b),
        }
    }
}
