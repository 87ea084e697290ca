//! Paths: branchable snapshots of "variable -> resolved bits" used by one parse
//! or specialize call.
//!
//! Assignments and learned values live in persistent linked layers, so
//! duplicating a path is O(1) and each branch only pays for what it adds.
//! Relation leaves are stored as cells that may still be waiting for their
//! value; the contents of enclosing nodes refer to them through slots until
//! the value is known.

use crate::bits::BitString;
use crate::domain::{Relation, VarId};
use crate::memory::Memory;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Piece of a variable's content.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Bits(BitString),
    /// Reference to a relation cell, substituted when read.
    Slot(VarId),
}

/// Ordered content recorded for a data leaf or a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    chunks: Vec<Chunk>,
}

impl Content {
    pub fn new() -> Self {
        Content::default()
    }

    pub fn from_bits(bits: BitString) -> Self {
        Content { chunks: vec![Chunk::Bits(bits)] }
    }

    pub fn slot(relation: VarId) -> Self {
        Content { chunks: vec![Chunk::Slot(relation)] }
    }

    pub fn push_bits(&mut self, bits: &BitString) {
        if bits.is_empty() {
            return;
        }
        if let Some(Chunk::Bits(last)) = self.chunks.last_mut() {
            last.extend(bits);
        } else {
            self.chunks.push(Chunk::Bits(bits.clone()));
        }
    }

    pub fn append(&mut self, other: Content) {
        for chunk in other.chunks {
            match chunk {
                Chunk::Bits(b) => self.push_bits(&b),
                slot => self.chunks.push(slot),
            }
        }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn slots(&self) -> impl Iterator<Item = VarId> + '_ {
        self.chunks.iter().filter_map(|c| match c {
            Chunk::Slot(id) => Some(*id),
            Chunk::Bits(_) => None,
        })
    }
}

/// Storage of a relation leaf: its bits once known, and its length when
/// known ahead of the bits.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub bits: Option<BitString>,
    pub len: Option<usize>,
}

#[derive(Debug, Clone)]
enum Entry {
    Content(Content),
    Cell(Cell),
}

#[derive(Debug)]
struct Link<V> {
    id: VarId,
    value: V,
    next: Option<Arc<Link<V>>>,
}

/// Persistent map: newest binding of an id shadows older ones.
#[derive(Debug)]
struct Trail<V> {
    head: Option<Arc<Link<V>>>,
}

impl<V> Clone for Trail<V> {
    fn clone(&self) -> Self {
        Trail { head: self.head.clone() }
    }
}

impl<V> Default for Trail<V> {
    fn default() -> Self {
        Trail { head: None }
    }
}

impl<V> Trail<V> {
    fn get(&self, id: VarId) -> Option<&V> {
        let mut cur = self.head.as_deref();
        while let Some(link) = cur {
            if link.id == id {
                return Some(&link.value);
            }
            cur = link.next.as_deref();
        }
        None
    }

    fn push(&mut self, id: VarId, value: V) {
        let next = self.head.take();
        self.head = Some(Arc::new(Link { id, value, next }));
    }

    /// Newest binding of every id.
    fn latest(&self) -> Vec<(VarId, &V)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut cur = self.head.as_deref();
        while let Some(link) = cur {
            if seen.insert(link.id) {
                out.push((link.id, &link.value));
            }
            cur = link.next.as_deref();
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Path {
    entries: Trail<Entry>,
    learned: Trail<BitString>,
    committed: Arc<HashMap<VarId, BitString>>,
    scope: Arc<HashSet<VarId>>,
    pending: Vec<Arc<Relation>>,
}

impl Path {
    /// Path without memory.
    pub fn new() -> Self {
        Path::default()
    }

    /// Path reading the committed layer of `memory`.
    pub fn with_memory(memory: &Memory) -> Self {
        Path { committed: memory.snapshot(), ..Path::default() }
    }

    /// Declare the variables that belong to the message being processed: a
    /// relation waits for these instead of reading them from memory.
    pub fn with_scope(mut self, scope: impl IntoIterator<Item = VarId>) -> Self {
        self.scope = Arc::new(scope.into_iter().collect());
        self
    }

    /// Independent branch sharing everything recorded so far.
    pub fn duplicate(&self) -> Path {
        self.clone()
    }

    pub fn add_result(&mut self, id: VarId, content: Content) {
        self.entries.push(id, Entry::Content(content));
    }

    pub(crate) fn set_cell(&mut self, id: VarId, bits: Option<BitString>, len: Option<usize>) {
        let len = bits.as_ref().map(BitString::len).or(len);
        self.entries.push(id, Entry::Cell(Cell { bits, len }));
    }

    pub fn cell(&self, id: VarId) -> Option<&Cell> {
        match self.entries.get(id)? {
            Entry::Cell(c) => Some(c),
            Entry::Content(_) => None,
        }
    }

    /// True when `id` has fully resolved bits.
    pub fn has_data(&self, id: VarId) -> bool {
        self.bits(id).is_some()
    }

    /// Content recorded for `id`; a relation leaf reads as a slot to itself.
    pub fn content(&self, id: VarId) -> Option<Content> {
        match self.entries.get(id)? {
            Entry::Content(c) => Some(c.clone()),
            Entry::Cell(_) => Some(Content::slot(id)),
        }
    }

    /// Resolved bits of `id`.
    pub fn bits(&self, id: VarId) -> Option<BitString> {
        match self.entries.get(id)? {
            Entry::Content(c) => self.flatten(c, None),
            Entry::Cell(c) => c.bits.clone(),
        }
    }

    /// Length in bits of `id`, which may be known before its bits.
    pub fn measure(&self, id: VarId) -> Option<usize> {
        match self.entries.get(id)? {
            Entry::Content(c) => self.measure_content(c),
            Entry::Cell(c) => c.len,
        }
    }

    /// Concatenate `content`, reading slots from their cells. The slot of
    /// `exclude` reads as zeros of its length.
    pub fn flatten(&self, content: &Content, exclude: Option<VarId>) -> Option<BitString> {
        let mut out = BitString::new();
        for chunk in &content.chunks {
            match chunk {
                Chunk::Bits(b) => out.extend(b),
                Chunk::Slot(id) => {
                    let cell = self.cell(*id)?;
                    if Some(*id) == exclude {
                        out.extend(&BitString::zeros(cell.len?));
                    } else {
                        out.extend(cell.bits.as_ref()?);
                    }
                }
            }
        }
        Some(out)
    }

    pub fn measure_content(&self, content: &Content) -> Option<usize> {
        content.chunks.iter().try_fold(0usize, |acc, chunk| match chunk {
            Chunk::Bits(b) => Some(acc + b.len()),
            Chunk::Slot(id) => self.cell(*id)?.len.map(|l| acc + l),
        })
    }

    /// Replace the slots of settled relations by their bits, so the content
    /// keeps its value if the cell is later rebound.
    pub fn freeze(&self, content: Content) -> Content {
        let mut out = Content::new();
        for chunk in content.chunks {
            match chunk {
                Chunk::Slot(id) if !self.is_pending(id) => match self.cell(id).and_then(|c| c.bits.as_ref()) {
                    Some(bits) => out.push_bits(bits),
                    None => out.chunks.push(Chunk::Slot(id)),
                },
                Chunk::Bits(b) => out.push_bits(&b),
                slot => out.chunks.push(slot),
            }
        }
        out
    }

    /// Bits of a relation target: from this path, or from memory when the
    /// target is not part of the current message.
    pub(crate) fn target_bits(&self, id: VarId, exclude: Option<VarId>) -> Option<BitString> {
        match self.entries.get(id) {
            Some(Entry::Content(c)) => self.flatten(c, exclude),
            Some(Entry::Cell(c)) => c.bits.clone(),
            None if self.scope.contains(&id) => None,
            None => self.recall(id).cloned(),
        }
    }

    pub(crate) fn target_len(&self, id: VarId) -> Option<usize> {
        match self.entries.get(id) {
            Some(_) => self.measure(id),
            None if self.scope.contains(&id) => None,
            None => self.recall(id).map(BitString::len),
        }
    }

    /// Remember a value learned by this branch.
    pub fn memorize(&mut self, id: VarId, bits: BitString) {
        self.learned.push(id, bits);
    }

    /// Value learned by this branch, else the committed one.
    pub fn recall(&self, id: VarId) -> Option<&BitString> {
        self.learned.get(id).or_else(|| self.committed.get(&id))
    }

    /// Values learned by this branch, newest per variable.
    pub fn learned(&self) -> HashMap<VarId, BitString> {
        self.learned.latest().into_iter().map(|(id, b)| (id, b.clone())).collect()
    }

    pub fn register_pending(&mut self, relation: Arc<Relation>) {
        if !self.is_pending(relation.id()) {
            self.pending.push(relation);
        }
    }

    pub fn pending(&self) -> &[Arc<Relation>] {
        &self.pending
    }

    pub fn is_pending(&self, id: VarId) -> bool {
        self.pending.iter().any(|r| r.id() == id)
    }

    pub(crate) fn remove_pending(&mut self, id: VarId) {
        self.pending.retain(|r| r.id() != id);
    }
}
