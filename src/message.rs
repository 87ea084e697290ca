//! Field/symbol orchestration: parse and specialize whole messages.
//!
//! A symbol is an ordered list of fields, each with its own domain. Parsing
//! explores every combination of per-field interpretations and keeps those
//! that consume the message exactly; specialization threads one path through
//! the fields so relations can see values produced earlier (or later, through
//! placeholders settled at the end).

use crate::bits::BitString;
use crate::domain::{VarId, Variable, VariableKind, MAX_REPEAT};
use crate::error::{DomainError, EngineError};
use crate::fuzz::Fuzz;
use crate::memory::Memory;
use crate::parser::{consumed, VariableParser};
use crate::path::Path;
use crate::relation;
use crate::specializer::{VariableSpecializer, DEFAULT_MAX_GENERATED_BYTES};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::iter;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    domain: Variable,
}

impl Field {
    pub fn new(name: impl Into<String>, domain: Variable) -> Self {
        Field { name: name.into(), domain }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &Variable {
        &self.domain
    }

    pub fn id(&self) -> VarId {
        self.domain.id()
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    name: String,
    fields: Vec<Field>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Result<Self, DomainError> {
        let name = name.into();
        if fields.is_empty() {
            return Err(DomainError::EmptySymbol(name));
        }
        let mut seen = HashSet::new();
        for f in &fields {
            if !seen.insert(f.name.as_str()) {
                return Err(DomainError::DuplicateField { symbol: name, field: f.name.clone() });
            }
        }
        Ok(Symbol { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Every variable of every field.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.fields.iter().flat_map(|f| f.domain.iter())
    }

    pub fn variable_ids(&self) -> HashSet<VarId> {
        self.variables().map(Variable::id).collect()
    }

    /// Reject relations that wait on each other's bits: such a cycle can never
    /// settle. Size and padding only need lengths and never close a cycle.
    pub fn check_relations(&self) -> Result<(), EngineError> {
        let by_id: HashMap<VarId, &Variable> = self.variables().map(|v| (v.id(), v)).collect();
        let mut edges: HashMap<VarId, Vec<VarId>> = HashMap::new();
        for v in self.variables() {
            let VariableKind::Relation(rel) = v.variant() else {
                continue;
            };
            if rel.kind().needs_lengths_only() {
                continue;
            }
            let mut reads = Vec::new();
            for t in rel.targets() {
                let Some(target) = by_id.get(t) else {
                    continue;
                };
                for inner in target.iter() {
                    if let VariableKind::Relation(r) = inner.variant() {
                        if r.id() != rel.id() && !r.kind().needs_lengths_only() {
                            reads.push(r.id());
                        }
                    }
                }
            }
            edges.insert(rel.id(), reads);
        }
        let mut state: HashMap<VarId, u8> = HashMap::new();
        for start in edges.keys() {
            if let Some(id) = find_cycle(*start, &edges, &mut state) {
                let name = by_id.get(&id).map_or_else(|| id.to_string(), |v| v.name().to_string());
                return Err(EngineError::unresolvable(name));
            }
        }
        Ok(())
    }
}

fn find_cycle(node: VarId, edges: &HashMap<VarId, Vec<VarId>>, state: &mut HashMap<VarId, u8>) -> Option<VarId> {
    match state.get(&node) {
        Some(1) => return Some(node),
        Some(_) => return None,
        None => {}
    }
    state.insert(node, 1);
    for next in edges.get(&node).into_iter().flatten() {
        if let Some(id) = find_cycle(*next, edges, state) {
            return Some(id);
        }
    }
    state.insert(node, 2);
    None
}

/// Value of one field inside a message.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub name: String,
    pub bits: BitString,
    /// Start of the field, in bits from the beginning of the message.
    pub offset: usize,
}

/// A message split into its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub symbol: String,
    pub fields: Vec<FieldValue>,
}

impl Message {
    fn from_path(symbol: &Symbol, path: &Path) -> Result<Self, EngineError> {
        let mut fields = Vec::with_capacity(symbol.fields.len());
        let mut offset = 0;
        for f in &symbol.fields {
            let bits = path
                .bits(f.id())
                .ok_or_else(|| EngineError::Placeholder { name: f.name.clone() })?;
            let len = bits.len();
            fields.push(FieldValue { name: f.name.clone(), bits, offset });
            offset += len;
        }
        Ok(Message { symbol: symbol.name.clone(), fields })
    }

    pub fn field(&self, name: &str) -> Option<&BitString> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.bits)
    }

    pub fn bits(&self) -> BitString {
        BitString::concat(self.fields.iter().map(|f| &f.bits))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits().to_bytes()
    }
}

/// Commit what a successful path learned into session memory.
fn commit(path: &Path, memory: &mut Memory, persist: bool) {
    for (id, bits) in path.learned() {
        memory.memorize(id, bits);
    }
    if persist {
        memory.persist();
    } else {
        memory.discard();
    }
}

pub struct MessageParser<'s> {
    symbol: &'s Symbol,
    max_repeat: usize,
    persist: bool,
}

impl<'s> MessageParser<'s> {
    pub fn new(symbol: &'s Symbol) -> Self {
        MessageParser { symbol, max_repeat: MAX_REPEAT, persist: true }
    }

    pub fn with_max_repeat(mut self, max: usize) -> Self {
        self.max_repeat = max;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Every interpretation of `data` that consumes it exactly and leaves no
    /// relation unverified.
    pub fn paths<'a>(&'a self, data: &'a BitString, memory: &Memory) -> impl Iterator<Item = Path> + 'a {
        let parser = VariableParser::new(data).with_max_repeat(self.max_repeat);
        let start = Path::with_memory(memory).with_scope(self.symbol.variable_ids());
        let mut acc: Box<dyn Iterator<Item = (Path, usize)> + 'a> = Box::new(iter::once((start, 0)));
        for field in &self.symbol.fields {
            let domain = &field.domain;
            acc = Box::new(acc.flat_map(move |(p, off)| {
                parser.parse(domain, p, off).map(move |p| {
                    let end = off + consumed(&p, domain);
                    (p, end)
                })
            }));
        }
        let total = data.len();
        acc.filter_map(move |(mut p, end)| {
            if end != total {
                return None;
            }
            if !relation::settle_parsed(&mut p) || !p.pending().is_empty() {
                debug!("interpretation dropped: relation left unverified");
                return None;
            }
            Some(p)
        })
    }

    /// First complete interpretation of `data`; memory learns its values.
    pub fn parse(&self, data: &BitString, memory: &mut Memory) -> Option<Message> {
        let path = self.paths(data, memory).next()?;
        let message = Message::from_path(self.symbol, &path).ok()?;
        commit(&path, memory, self.persist);
        debug!(symbol = self.symbol.name(), "message abstracted");
        Some(message)
    }
}

pub struct MessageSpecializer<'s> {
    rng: &'s mut dyn RngCore,
    fuzz: Option<&'s mut Fuzz>,
    max_generated_bytes: usize,
    max_repeat: usize,
    persist: bool,
}

impl<'s> MessageSpecializer<'s> {
    pub fn new(rng: &'s mut dyn RngCore) -> Self {
        MessageSpecializer {
            rng,
            fuzz: None,
            max_generated_bytes: DEFAULT_MAX_GENERATED_BYTES,
            max_repeat: MAX_REPEAT,
            persist: true,
        }
    }

    pub fn with_fuzz(mut self, fuzz: &'s mut Fuzz) -> Self {
        self.fuzz = Some(fuzz);
        self
    }

    pub fn with_max_generated_bytes(mut self, bytes: usize) -> Self {
        self.max_generated_bytes = bytes;
        self
    }

    pub fn with_max_repeat(mut self, max: usize) -> Self {
        self.max_repeat = max;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Produce one message of `symbol`. Memory is read for replayed values and
    /// learns the new ones only when the message is complete.
    pub fn specialize(&mut self, symbol: &Symbol, memory: &mut Memory) -> Result<Message, EngineError> {
        symbol.check_relations()?;
        if let Some(fuzz) = self.fuzz.as_deref_mut() {
            fuzz.reset_depth();
        }
        let start = Path::with_memory(memory).with_scope(symbol.variable_ids());
        let mut specializer = VariableSpecializer::new(&mut *self.rng)
            .with_max_generated_bytes(self.max_generated_bytes)
            .with_max_repeat(self.max_repeat);
        if let Some(fuzz) = self.fuzz.as_deref_mut() {
            specializer = specializer.with_fuzz(fuzz);
        }
        let path = match walk(&mut specializer, symbol, 0, start)? {
            Walk::Done(path) => path,
            Walk::Empty(field) => return Err(EngineError::NoSpecialization { field }),
        };
        let message = Message::from_path(symbol, &path)?;
        commit(&path, memory, self.persist);
        info!(symbol = symbol.name(), bits = message.bits().len(), "message specialized");
        Ok(message)
    }
}

enum Walk {
    Done(Path),
    /// No candidate for the named field.
    Empty(String),
}

/// Depth-first over candidate paths, field by field.
fn walk(specializer: &mut VariableSpecializer<'_>, symbol: &Symbol, index: usize, path: Path) -> Result<Walk, EngineError> {
    let Some(field) = symbol.fields.get(index) else {
        return finish(path).map(Walk::Done);
    };
    let candidates = specializer.specialize(&field.domain, path)?;
    let mut last = Walk::Empty(field.name.clone());
    for candidate in candidates {
        match walk(specializer, symbol, index + 1, candidate)? {
            Walk::Done(p) => return Ok(Walk::Done(p)),
            empty => last = empty,
        }
    }
    Ok(last)
}

/// Every placeholder must have been replaced by now.
fn finish(path: Path) -> Result<Path, EngineError> {
    if let Some(rel) = path.pending().first() {
        return Err(EngineError::unresolvable(rel.name()));
    }
    Ok(path)
}

