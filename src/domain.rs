//! The variable domain tree: the immutable grammar describing a field's content.
//!
//! Leaves are plain data or relations computed from other variables; nodes are
//! alternatives, aggregates and repetitions. Every variable carries a stable
//! [`VarId`] that paths and memory use as key. Construction validates the tree,
//! so the parser and specializer never meet an invalid grammar.

use crate::bits::BitString;
use crate::error::DomainError;
use crate::types::{BitArray, DataType, Integer, Raw};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bound (exclusive) of any repetition count.
pub const MAX_REPEAT: usize = 1000;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

impl VarId {
    pub fn fresh() -> Self {
        VarId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Scope of validity of a data leaf's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Svas {
    /// Always the fixed (or memorized) value.
    Constant,
    /// Fresh value for every message; learned values are still memorized.
    #[default]
    Ephemeral,
    /// Fresh value for every message, never memorized.
    Volatile,
    /// Chosen once per session, replayed thereafter.
    Persistent,
}

impl FromStr for Svas {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(Svas::Constant),
            "ephemeral" => Ok(Svas::Ephemeral),
            "volatile" => Ok(Svas::Volatile),
            "persistent" => Ok(Svas::Persistent),
            other => Err(format!("unknown scope '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    /// SHA-1 truncated to 12 bytes.
    Sha1_96,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha1_96 => 12,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha1_96 => "sha1-96",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha1-96" => Ok(HashAlgorithm::Sha1_96),
            "sha224" => Ok(HashAlgorithm::Sha224),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(DomainError::UnsupportedHash(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelationKind {
    /// `floor(bits(targets) * factor + offset)`.
    Size { factor: f64, offset: i64 },
    /// Copy of the single target's bits.
    Value,
    InternetChecksum,
    Crc32,
    Hmac { algorithm: HashAlgorithm, key: Vec<u8> },
    /// Fill so the scaled target length becomes a multiple of `modulo` bits.
    Padding { modulo: usize, once: bool, factor: f64, offset: i64 },
}

impl RelationKind {
    /// Size and padding only read the lengths of their targets.
    pub fn needs_lengths_only(&self) -> bool {
        matches!(self, RelationKind::Size { .. } | RelationKind::Padding { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            RelationKind::Size { .. } => "Size",
            RelationKind::Value => "Value",
            RelationKind::InternetChecksum => "InternetChecksum",
            RelationKind::Crc32 => "CRC32",
            RelationKind::Hmac { .. } => "Hmac",
            RelationKind::Padding { .. } => "Padding",
        }
    }
}

/// A leaf whose value is computed from other variables.
#[derive(Debug, Clone)]
pub struct Relation {
    id: VarId,
    name: String,
    kind: RelationKind,
    targets: Vec<VarId>,
    data_type: Arc<dyn DataType>,
}

impl Relation {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RelationKind {
        &self.kind
    }

    pub fn targets(&self) -> &[VarId] {
        &self.targets
    }

    pub fn data_type(&self) -> &dyn DataType {
        self.data_type.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct Data {
    pub data_type: Arc<dyn DataType>,
    pub svas: Svas,
}

/// Half-open repetition count range `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatCount {
    pub min: usize,
    pub max: usize,
}

impl RepeatCount {
    pub fn new(min: usize, max: usize) -> Self {
        RepeatCount { min, max }
    }

    pub fn exactly(n: usize) -> Self {
        RepeatCount { min: n, max: n + 1 }
    }

    pub fn is_fixed(&self) -> bool {
        self.max == self.min + 1
    }
}

#[derive(Debug, Clone)]
pub struct Repeat {
    pub child: Variable,
    pub count: RepeatCount,
    pub delimiter: Option<BitString>,
}

#[derive(Debug, Clone)]
pub enum VariableKind {
    Data(Data),
    Relation(Arc<Relation>),
    Alt(Vec<Variable>),
    Agg(Vec<Variable>),
    Repeat(Box<Repeat>),
}

/// A node of the domain tree.
#[derive(Debug, Clone)]
pub struct Variable {
    id: VarId,
    name: String,
    kind: VariableKind,
}

impl Variable {
    pub fn data(name: impl Into<String>, data_type: impl DataType + 'static) -> Self {
        Self::data_arc(name, Arc::new(data_type))
    }

    pub fn data_arc(name: impl Into<String>, data_type: Arc<dyn DataType>) -> Self {
        Variable {
            id: VarId::fresh(),
            name: name.into(),
            kind: VariableKind::Data(Data { data_type, svas: Svas::default() }),
        }
    }

    /// Set the scope of a data leaf; no effect on other variants.
    pub fn with_svas(mut self, svas: Svas) -> Self {
        if let VariableKind::Data(d) = &mut self.kind {
            d.svas = svas;
        }
        self
    }

    pub fn alt(name: impl Into<String>, children: Vec<Variable>) -> Result<Self, DomainError> {
        let name = name.into();
        if children.is_empty() {
            return Err(DomainError::EmptyNode { kind: "Alt", name });
        }
        Ok(Variable { id: VarId::fresh(), name, kind: VariableKind::Alt(children) })
    }

    pub fn agg(name: impl Into<String>, children: Vec<Variable>) -> Result<Self, DomainError> {
        let name = name.into();
        if children.is_empty() {
            return Err(DomainError::EmptyNode { kind: "Agg", name });
        }
        Ok(Variable { id: VarId::fresh(), name, kind: VariableKind::Agg(children) })
    }

    pub fn repeat(
        name: impl Into<String>,
        child: Variable,
        count: RepeatCount,
        delimiter: Option<BitString>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        if count.max <= count.min {
            return Err(DomainError::InvalidRepeat { name, min: count.min, max: count.max });
        }
        if count.max > MAX_REPEAT {
            return Err(DomainError::RepeatTooLarge { name, max: count.max, limit: MAX_REPEAT });
        }
        Ok(Variable {
            id: VarId::fresh(),
            name,
            kind: VariableKind::Repeat(Box::new(Repeat { child, count, delimiter })),
        })
    }

    pub fn relation(
        name: impl Into<String>,
        kind: RelationKind,
        targets: Vec<VarId>,
        data_type: Arc<dyn DataType>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        if targets.is_empty() {
            return Err(DomainError::MissingTargets { name });
        }
        if data_type.size().1.is_none() {
            return Err(DomainError::UnboundedRelationType { name });
        }
        match &kind {
            RelationKind::Size { factor, .. } if !(factor.is_finite() && *factor > 0.0) => {
                return Err(DomainError::InvalidFactor { name, factor: *factor });
            }
            RelationKind::Padding { factor, .. } if !(factor.is_finite() && *factor > 0.0) => {
                return Err(DomainError::InvalidFactor { name, factor: *factor });
            }
            RelationKind::Padding { modulo, .. } => {
                if *modulo == 0 || data_type.size().1 == Some(0) {
                    return Err(DomainError::InvalidModulo { name });
                }
            }
            _ => {
                if data_type.value().is_some() {
                    return Err(DomainError::ConstantRelationType { name });
                }
            }
        }
        let id = VarId::fresh();
        let relation = Relation { id, name: name.clone(), kind, targets, data_type };
        Ok(Variable { id, name, kind: VariableKind::Relation(Arc::new(relation)) })
    }

    /// Size in bytes of `targets`, encoded with `data_type`.
    pub fn size(
        name: impl Into<String>,
        targets: &[&Variable],
        data_type: impl DataType + 'static,
    ) -> Result<Self, DomainError> {
        Self::size_with(name, targets, data_type, 1.0 / 8.0, 0)
    }

    pub fn size_with(
        name: impl Into<String>,
        targets: &[&Variable],
        data_type: impl DataType + 'static,
        factor: f64,
        offset: i64,
    ) -> Result<Self, DomainError> {
        Self::relation(name, RelationKind::Size { factor, offset }, ids(targets), Arc::new(data_type))
    }

    /// Copy of `target`, typed by the target's own bit bounds.
    pub fn value(name: impl Into<String>, target: &Variable) -> Result<Self, DomainError> {
        let name = name.into();
        let (min, max) = target.bit_bounds();
        if max.is_none() {
            return Err(DomainError::UnboundedRelationType { name });
        }
        let data_type: Arc<dyn DataType> = match max {
            Some(max) if min % 8 == 0 && max % 8 == 0 => Arc::new(Raw::sized(min / 8, Some(max / 8))?),
            _ => Arc::new(BitArray::sized(min, max)?),
        };
        Self::relation(name, RelationKind::Value, vec![target.id], data_type)
    }

    /// RFC 1071 checksum rendered as a big-endian `uint16`.
    pub fn internet_checksum(name: impl Into<String>, targets: &[&Variable]) -> Result<Self, DomainError> {
        Self::relation(name, RelationKind::InternetChecksum, ids(targets), Arc::new(Integer::uint16()))
    }

    pub fn crc32(name: impl Into<String>, targets: &[&Variable]) -> Result<Self, DomainError> {
        Self::relation(name, RelationKind::Crc32, ids(targets), Arc::new(Integer::uint32()))
    }

    pub fn hmac(
        name: impl Into<String>,
        targets: &[&Variable],
        algorithm: &str,
        key: impl Into<Vec<u8>>,
    ) -> Result<Self, DomainError> {
        let algorithm: HashAlgorithm = algorithm.parse()?;
        let data_type = Raw::exact(algorithm.digest_len());
        Self::relation(
            name,
            RelationKind::Hmac { algorithm, key: key.into() },
            ids(targets),
            Arc::new(data_type),
        )
    }

    /// Pad with repetitions of `pad` so `targets` align on `modulo` bits.
    pub fn padding(
        name: impl Into<String>,
        targets: &[&Variable],
        pad: impl DataType + 'static,
        modulo: usize,
    ) -> Result<Self, DomainError> {
        let kind = RelationKind::Padding { modulo, once: false, factor: 1.0, offset: 0 };
        Self::relation(name, kind, ids(targets), Arc::new(pad))
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> &VariableKind {
        &self.kind
    }

    /// Short variant label ("Data", "Alt", "Size", ...).
    pub fn kind(&self) -> &'static str {
        match &self.kind {
            VariableKind::Data(_) => "Data",
            VariableKind::Relation(r) => r.kind.label(),
            VariableKind::Alt(_) => "Alt",
            VariableKind::Agg(_) => "Agg",
            VariableKind::Repeat(_) => "Repeat",
        }
    }

    pub fn children(&self) -> Vec<&Variable> {
        match &self.kind {
            VariableKind::Alt(c) | VariableKind::Agg(c) => c.iter().collect(),
            VariableKind::Repeat(r) => vec![&r.child],
            VariableKind::Data(_) | VariableKind::Relation(_) => Vec::new(),
        }
    }

    /// Variables a relation leaf reads; empty for everything else.
    pub fn dependencies(&self) -> &[VarId] {
        match &self.kind {
            VariableKind::Relation(r) => &r.targets,
            _ => &[],
        }
    }

    pub fn as_relation(&self) -> Option<&Arc<Relation>> {
        match &self.kind {
            VariableKind::Relation(r) => Some(r),
            _ => None,
        }
    }

    /// Pre-order traversal of this variable and its descendants.
    pub fn iter(&self) -> Iter<'_> {
        Iter { stack: vec![self] }
    }

    pub fn find(&self, id: VarId) -> Option<&Variable> {
        self.iter().find(|v| v.id == id)
    }

    pub fn min_bits(&self) -> usize {
        self.bit_bounds().0
    }

    /// Length bounds in bits of any content this variable can hold.
    pub fn bit_bounds(&self) -> (usize, Option<usize>) {
        match &self.kind {
            VariableKind::Data(d) => d.data_type.size(),
            VariableKind::Relation(r) => r.data_type.size(),
            VariableKind::Alt(children) => {
                let bounds: Vec<_> = children.iter().map(Variable::bit_bounds).collect();
                let min = bounds.iter().map(|b| b.0).min().unwrap_or(0);
                let max = bounds.iter().try_fold(0usize, |acc, b| b.1.map(|m| acc.max(m)));
                (min, max)
            }
            VariableKind::Agg(children) => {
                let bounds: Vec<_> = children.iter().map(Variable::bit_bounds).collect();
                let min = bounds.iter().map(|b| b.0).sum();
                let max = bounds.iter().try_fold(0usize, |acc, b| b.1.map(|m| acc + m));
                (min, max)
            }
            VariableKind::Repeat(r) => {
                let (cmin, cmax) = r.child.bit_bounds();
                let delim = r.delimiter.as_ref().map_or(0, BitString::len);
                let lo = r.count.min;
                let hi = r.count.max - 1;
                let min = cmin * lo + delim * lo.saturating_sub(1);
                let max = cmax.map(|m| m * hi + delim * hi.saturating_sub(1));
                (min, max)
            }
        }
    }

    /// Give this variable a pre-reserved id (used when ids are handed out
    /// before the tree is built).
    pub(crate) fn with_id(mut self, id: VarId) -> Self {
        self.id = id;
        if let VariableKind::Relation(r) = &mut self.kind {
            Arc::make_mut(r).id = id;
        }
        self
    }
}

fn ids(targets: &[&Variable]) -> Vec<VarId> {
    targets.iter().map(|v| v.id).collect()
}

pub struct Iter<'a> {
    stack: Vec<&'a Variable>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Variable;

    fn next(&mut self) -> Option<&'a Variable> {
        let v = self.stack.pop()?;
        let children = v.children();
        self.stack.extend(children.into_iter().rev());
        Some(v)
    }
}
