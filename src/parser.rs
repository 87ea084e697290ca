//! Variable parser: backtracking recursive descent over the domain tree.
//!
//! Every call returns a lazy, finite sequence of paths, one per way the
//! variable can consume a prefix of the remaining data. Alternatives are tried
//! in declaration order and repetition counts in ascending order. An empty
//! sequence means the data does not conform.

use crate::bits::BitString;
use crate::domain::{Data, Relation, Repeat, Svas, Variable, VariableKind, MAX_REPEAT};
use crate::path::{Content, Path};
use crate::relation::{self, Computed};
use std::iter;
use std::sync::Arc;
use tracing::{debug, trace};

pub type Paths<'a> = Box<dyn Iterator<Item = Path> + 'a>;

/// Parse `var` against the start of `data`.
pub fn parse<'a>(var: &'a Variable, path: Path, data: &'a BitString) -> Paths<'a> {
    VariableParser::new(data).parse(var, path, 0)
}

/// Bits consumed by `var` in `path`.
pub fn consumed(path: &Path, var: &Variable) -> usize {
    path.measure(var.id()).unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
pub struct VariableParser<'a> {
    data: &'a BitString,
    max_repeat: usize,
}

impl<'a> VariableParser<'a> {
    pub fn new(data: &'a BitString) -> Self {
        VariableParser { data, max_repeat: MAX_REPEAT }
    }

    /// Never try more than `max` repetitions, whatever the grammar allows.
    pub fn with_max_repeat(mut self, max: usize) -> Self {
        self.max_repeat = max.min(MAX_REPEAT);
        self
    }

    /// All interpretations of `var` starting at bit `offset` of the data.
    pub fn parse(self, var: &'a Variable, path: Path, offset: usize) -> Paths<'a> {
        match var.variant() {
            VariableKind::Data(d) => self.parse_data(var, d, path, offset),
            VariableKind::Relation(r) => self.parse_relation(r, path, offset),
            VariableKind::Alt(children) => self.parse_alt(var, children, path, offset),
            VariableKind::Agg(children) => self.parse_agg(var, children, path, offset),
            VariableKind::Repeat(r) => self.parse_repeat(var, r, path, offset),
        }
    }

    fn remaining(&self, offset: usize) -> usize {
        self.data.len().saturating_sub(offset)
    }

    fn parse_data(self, var: &'a Variable, d: &'a Data, path: Path, offset: usize) -> Paths<'a> {
        let id = var.id();
        let known = match d.svas {
            Svas::Constant | Svas::Persistent => {
                d.data_type.value().or_else(|| path.recall(id).cloned())
            }
            Svas::Ephemeral | Svas::Volatile => None,
        };
        if let Some(expected) = known {
            if !expected.matches_at(self.data, offset) {
                trace!(var = var.name(), "known value does not match");
                return Box::new(iter::empty());
            }
            let mut p = path;
            p.add_result(id, Content::from_bits(expected));
            return Box::new(relation::settle_parsed(&mut p).then_some(p).into_iter());
        }
        if d.svas == Svas::Constant {
            debug!(var = var.name(), "constant without a value");
            return Box::new(iter::empty());
        }
        let learn = d.svas != Svas::Volatile;
        let data = self.data;
        let lengths = d.data_type.lengths(self.remaining(offset));
        Box::new(lengths.into_iter().filter_map(move |len| {
            let bits = data.slice(offset, offset + len);
            if !d.data_type.can_parse(&bits) {
                return None;
            }
            let mut p = path.duplicate();
            if learn {
                p.memorize(id, bits.clone());
            }
            p.add_result(id, Content::from_bits(bits));
            relation::settle_parsed(&mut p).then_some(p)
        }))
    }

    fn parse_relation(self, rel: &'a Arc<Relation>, path: Path, offset: usize) -> Paths<'a> {
        let id = rel.id();
        let remaining = self.remaining(offset);
        match relation::compute(rel, &path) {
            Ok(Computed::Ready(expected)) => {
                if !expected.matches_at(self.data, offset) {
                    trace!(relation = rel.name(), expected = %expected, "relation value mismatch");
                    return Box::new(iter::empty());
                }
                let mut p = path;
                p.set_cell(id, Some(expected), None);
                Box::new(relation::settle_parsed(&mut p).then_some(p).into_iter())
            }
            Ok(Computed::Length(n)) => {
                if n > remaining {
                    return Box::new(iter::empty());
                }
                let bits = self.data.slice(offset, offset + n);
                if !relation::plausible(rel, &bits) {
                    return Box::new(iter::empty());
                }
                let mut p = path;
                p.set_cell(id, Some(bits), None);
                Box::new(relation::settle_parsed(&mut p).then_some(p).into_iter())
            }
            Ok(Computed::Waiting) => {
                let data = self.data;
                let lengths = relation::candidate_lengths(rel, remaining);
                Box::new(lengths.into_iter().filter_map(move |len| {
                    let bits = data.slice(offset, offset + len);
                    if !relation::plausible(rel, &bits) {
                        return None;
                    }
                    let mut p = path.duplicate();
                    p.set_cell(id, Some(bits), None);
                    p.register_pending(Arc::clone(rel));
                    relation::settle_parsed(&mut p).then_some(p)
                }))
            }
            Err(e) => {
                debug!(relation = rel.name(), error = %e, "relation rejected during parse");
                Box::new(iter::empty())
            }
        }
    }

    fn parse_alt(self, var: &'a Variable, children: &'a [Variable], path: Path, offset: usize) -> Paths<'a> {
        Box::new(children.iter().flat_map(move |child| {
            self.parse(child, path.duplicate(), offset)
                .filter_map(move |p| compose(var, iter::once(child), p))
        }))
    }

    fn parse_agg(self, var: &'a Variable, children: &'a [Variable], path: Path, offset: usize) -> Paths<'a> {
        let mut acc: Box<dyn Iterator<Item = (Path, usize)> + 'a> = Box::new(iter::once((path, offset)));
        for child in children {
            acc = Box::new(acc.flat_map(move |(p, off)| {
                self.parse(child, p, off).map(move |p| {
                    let end = off + consumed(&p, child);
                    (p, end)
                })
            }));
        }
        Box::new(acc.filter_map(move |(p, _)| compose(var, children.iter(), p)))
    }

    fn parse_repeat(self, var: &'a Variable, r: &'a Repeat, path: Path, offset: usize) -> Paths<'a> {
        let unit = r.child.min_bits().max(1);
        let delim = r.delimiter.as_ref().map_or(0, BitString::len);
        let remaining = self.remaining(offset);
        let max = r.count.max.min(self.max_repeat.max(r.count.min + 1));
        Box::new(
            (r.count.min..max)
                .take_while(move |k| k * unit + k.saturating_sub(1) * delim <= remaining)
                .flat_map(move |k| self.repeat_exactly(var, r, path.duplicate(), offset, k)),
        )
    }

    /// Interpretations made of exactly `k` instances of the repeated child.
    fn repeat_exactly(self, var: &'a Variable, r: &'a Repeat, path: Path, offset: usize, k: usize) -> Paths<'a> {
        type State = (Path, usize, Content);
        let data = self.data;
        let mut acc: Box<dyn Iterator<Item = State> + 'a> = Box::new(iter::once((path, offset, Content::new())));
        for i in 0..k {
            acc = Box::new(acc.flat_map(move |(p, off, mut content)| -> Box<dyn Iterator<Item = State> + 'a> {
                let mut start = off;
                if i > 0 {
                    if let Some(d) = &r.delimiter {
                        if !d.matches_at(data, off) {
                            return Box::new(iter::empty());
                        }
                        content.push_bits(d);
                        start += d.len();
                    }
                }
                Box::new(self.parse(&r.child, p, start).filter_map(move |p| {
                    let n = consumed(&p, &r.child);
                    if n == 0 {
                        return None;
                    }
                    let instance = p.freeze(p.content(r.child.id())?);
                    let mut content = content.clone();
                    content.append(instance);
                    Some((p, start + n, content))
                }))
            }));
        }
        Box::new(acc.filter_map(move |(mut p, _, content)| {
            p.add_result(var.id(), content);
            relation::settle_parsed(&mut p).then_some(p)
        }))
    }
}

/// Record a node's content from its children's and check pending relations.
fn compose<'v>(var: &Variable, children: impl Iterator<Item = &'v Variable>, mut path: Path) -> Option<Path> {
    let mut content = Content::new();
    for child in children {
        content.append(path.freeze(path.content(child.id())?));
    }
    path.add_result(var.id(), content);
    relation::settle_parsed(&mut path).then_some(path)
}
