//! Error types for grammar construction and for the parse/specialize engine.
//!
//! A parse that finds no interpretation is not an error: it yields no paths.
//! Everything here is fatal to the call that raised it.

use crate::fuzz::FuzzError;
use crate::types::TypeError;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Invalid grammar, rejected when the tree is built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("{kind} '{name}' needs at least one child")]
    EmptyNode { kind: &'static str, name: String },

    #[error("repeat '{name}': count range {min}..{max} is empty")]
    InvalidRepeat { name: String, min: usize, max: usize },

    #[error("repeat '{name}': maximum count {max} exceeds {limit}")]
    RepeatTooLarge { name: String, max: usize, limit: usize },

    #[error("unsupported hash algorithm '{0}'")]
    UnsupportedHash(String),

    #[error("relation '{name}' has no targets")]
    MissingTargets { name: String },

    #[error("relation '{name}': data type must declare a maximum length")]
    UnboundedRelationType { name: String },

    #[error("relation '{name}': data type must not carry a fixed value")]
    ConstantRelationType { name: String },

    #[error("padding '{name}': modulo must be a positive number of bits")]
    InvalidModulo { name: String },

    #[error("relation '{name}': factor {factor} must be a finite positive number")]
    InvalidFactor { name: String, factor: f64 },

    #[error("symbol '{symbol}': duplicate field '{field}'")]
    DuplicateField { symbol: String, field: String },

    #[error("symbol '{0}' has no fields")]
    EmptySymbol(String),

    #[error("type: {0}")]
    Type(#[from] TypeError),
}

/// Failure of a parse or specialize call.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// A relation whose dependencies can never be satisfied.
    #[error("relation '{name}' cannot be resolved: its dependencies never receive a value")]
    UnresolvableRelation { name: String },

    /// Alt recursion ceiling reached while fuzzing.
    #[error("alternative recursion depth exceeded (maximum {max})")]
    DepthExceeded { max: usize },

    #[error("fuzzing: {0}")]
    Fuzz(FuzzError),

    #[error("field '{field}' has no possible value")]
    NoSpecialization { field: String },

    /// A placeholder survived into a finished message.
    #[error("placeholder for '{name}' was never replaced")]
    Placeholder { name: String },

    #[error("relation '{name}': {reason}")]
    Relation { name: String, reason: String },

    #[error("type: {0}")]
    Type(#[from] TypeError),
}

impl EngineError {
    pub fn relation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Relation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn unresolvable(name: impl Into<String>) -> Self {
        Self::UnresolvableRelation { name: name.into() }
    }
}

impl From<FuzzError> for EngineError {
    fn from(e: FuzzError) -> Self {
        match e {
            FuzzError::DepthExceeded { max } => EngineError::DepthExceeded { max },
            other => EngineError::Fuzz(other),
        }
    }
}
