//! # protodomain: variable domain engine
//!
//! Describe the content of protocol fields as a tree of variables, then use
//! the same tree both ways:
//!
//! - **Abstraction**: parse received bits, exploring every interpretation by
//!   backtracking and keeping those that satisfy all relations.
//! - **Specialization**: generate conforming bits, filling forward references
//!   (sizes, checksums, HMACs) once their targets exist.
//!
//! ## Domain tree
//!
//! - Leaves: typed data (`Raw`, `Ascii`, `Integer`, `BitArray`, `Ipv4`,
//!   `Timestamp`) with a scope (constant, persistent, ephemeral, volatile),
//!   or relations (size, value, internet checksum, CRC32, HMAC, padding).
//! - Nodes: alternatives, aggregates, repetitions with optional delimiter.
//!
//! A [`Path`] records one partial interpretation; [`Memory`] carries values
//! across messages of a session. [`fuzz`] binds mutators to variables.
//!
//! ## Example grammar
//!
//! ```text
//! symbol "Hello" {
//!   magic: raw("HI");
//!   len: size(name, type = uint8());
//!   name: ascii(1..=16);
//!   crc: crc32(magic, len, name);
//! }
//! ```
//!
//! See `tests/session.rs` for full examples.

pub mod bits;
pub mod domain;
pub mod dsl;
pub mod error;
pub mod fuzz;
pub mod memory;
pub mod message;
pub mod parser;
pub mod path;
pub mod relation;
pub mod session;
pub mod specializer;
pub mod types;
pub mod value;

pub use bits::BitString;
pub use domain::{HashAlgorithm, RelationKind, RepeatCount, Svas, VarId, Variable, VariableKind, MAX_REPEAT};
pub use dsl::{parse, DslError};
pub use error::{DomainError, EngineError, Result};
pub use fuzz::{Fuzz, FuzzError, MutatorMode};
pub use memory::Memory;
pub use message::{Field, FieldValue, Message, MessageParser, MessageSpecializer, Symbol};
pub use parser::VariableParser;
pub use path::Path;
pub use session::{Session, SessionConfig};
pub use specializer::VariableSpecializer;
pub use types::{DataType, TypeError};
pub use value::Value;
