//! Variable specializer: produce bits for a variable, the dual of parsing.
//!
//! Randomness comes from the caller's RNG and from mutators bound in an
//! optional [`Fuzz`] registry, so a fixed seed reproduces the same messages.
//! Relations whose targets are not known yet get a placeholder cell and stay
//! pending until their targets land.

use crate::bits::BitString;
use crate::domain::{Data, Relation, RelationKind, Repeat, Svas, Variable, VariableKind, MAX_REPEAT};
use crate::error::EngineError;
use crate::fuzz::{Fuzz, MutatorMode};
use crate::path::{Content, Path};
use crate::relation::{self, Computed};
use crate::types::DataType;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use std::sync::Arc;
use tracing::trace;

/// Default bound for unbounded leaves, in bytes.
pub const DEFAULT_MAX_GENERATED_BYTES: usize = 64;

pub struct VariableSpecializer<'s> {
    rng: &'s mut dyn RngCore,
    fuzz: Option<&'s mut Fuzz>,
    cap_bits: usize,
    max_repeat: usize,
}

impl<'s> VariableSpecializer<'s> {
    pub fn new(rng: &'s mut dyn RngCore) -> Self {
        VariableSpecializer {
            rng,
            fuzz: None,
            cap_bits: DEFAULT_MAX_GENERATED_BYTES * 8,
            max_repeat: MAX_REPEAT,
        }
    }

    pub fn with_fuzz(mut self, fuzz: &'s mut Fuzz) -> Self {
        self.fuzz = Some(fuzz);
        self
    }

    pub fn with_max_generated_bytes(mut self, bytes: usize) -> Self {
        self.cap_bits = bytes * 8;
        self
    }

    pub fn with_max_repeat(mut self, max: usize) -> Self {
        self.max_repeat = max.min(MAX_REPEAT);
        self
    }

    /// Candidate paths, each extending `path` with a value for `var`.
    pub fn specialize(&mut self, var: &Variable, path: Path) -> Result<Vec<Path>, EngineError> {
        match var.variant() {
            VariableKind::Data(d) => self.specialize_data(var, d, path),
            VariableKind::Relation(r) => self.specialize_relation(r, path),
            VariableKind::Alt(children) => self.specialize_alt(var, children, path),
            VariableKind::Agg(children) => self.specialize_agg(var, children, path),
            VariableKind::Repeat(r) => self.specialize_repeat(var, r, path),
        }
    }

    /// Normal value of a data leaf under its scope; `None` when a constant
    /// has nothing to replay.
    fn leaf_value(&mut self, var: &Variable, d: &Data, path: &mut Path) -> Option<BitString> {
        let id = var.id();
        match d.svas {
            Svas::Constant => d.data_type.value().or_else(|| path.recall(id).cloned()),
            Svas::Persistent => {
                if let Some(v) = d.data_type.value().or_else(|| path.recall(id).cloned()) {
                    return Some(v);
                }
                let v = d.data_type.generate(&mut *self.rng, self.cap_bits);
                path.memorize(id, v.clone());
                Some(v)
            }
            Svas::Ephemeral => {
                let v = d.data_type.generate(&mut *self.rng, self.cap_bits);
                path.memorize(id, v.clone());
                Some(v)
            }
            Svas::Volatile => Some(d.data_type.generate(&mut *self.rng, self.cap_bits)),
        }
    }

    fn specialize_data(&mut self, var: &Variable, d: &Data, mut path: Path) -> Result<Vec<Path>, EngineError> {
        let id = var.id();
        let mode = self.fuzz.as_deref().and_then(|f| f.mode(id));
        let value = match mode {
            Some(MutatorMode::Generate) | Some(MutatorMode::Fixed) => {
                self.mutator_generate(var, d.data_type.as_ref())?
            }
            Some(MutatorMode::Mutate) => {
                let Some(base) = self.leaf_value(var, d, &mut path) else {
                    return Ok(Vec::new());
                };
                match self.fuzz.as_deref_mut().and_then(|f| f.leaf(id)) {
                    Some(m) => m.mutate(&base)?,
                    None => base,
                }
            }
            None => match self.leaf_value(var, d, &mut path) {
                Some(v) => v,
                None => {
                    trace!(var = var.name(), "constant without a value");
                    return Ok(Vec::new());
                }
            },
        };
        trace!(var = var.name(), value = %value, "leaf specialized");
        path.add_result(id, Content::from_bits(value));
        relation::settle_specialized(&mut path, &mut *self.rng)?;
        Ok(vec![path])
    }

    fn mutator_generate(&mut self, var: &Variable, data_type: &dyn DataType) -> Result<BitString, EngineError> {
        match self.fuzz.as_deref_mut().and_then(|f| f.leaf(var.id())) {
            Some(m) => Ok(m.generate(data_type)?),
            None => Ok(data_type.generate(&mut *self.rng, self.cap_bits)),
        }
    }

    fn specialize_relation(&mut self, rel: &Arc<Relation>, mut path: Path) -> Result<Vec<Path>, EngineError> {
        let id = rel.id();
        let fuzzed = self.fuzz.as_deref().and_then(|f| f.mode(id)).is_some();
        if fuzzed {
            let bits = self.fuzz_relation(rel)?;
            path.set_cell(id, Some(bits), None);
        } else {
            match relation::compute(rel, &path)? {
                Computed::Ready(bits) => path.set_cell(id, Some(bits), None),
                Computed::Length(n) => {
                    let bits = relation::fill(rel, n, &mut *self.rng);
                    path.set_cell(id, Some(bits), None);
                }
                Computed::Waiting => {
                    let len = match (rel.kind(), rel.data_type().size()) {
                        (RelationKind::Padding { .. }, _) => None,
                        (_, (min, Some(max))) if min == max => Some(min),
                        _ => None,
                    };
                    trace!(relation = rel.name(), "placeholder registered");
                    path.set_cell(id, None, len);
                    path.register_pending(Arc::clone(rel));
                }
            }
        }
        relation::settle_specialized(&mut path, &mut *self.rng)?;
        Ok(vec![path])
    }

    fn fuzz_relation(&mut self, rel: &Relation) -> Result<BitString, EngineError> {
        let Some(m) = self.fuzz.as_deref_mut().and_then(|f| f.leaf(rel.id())) else {
            return Err(EngineError::relation(rel.name(), "no mutator bound"));
        };
        Ok(m.generate(rel.data_type())?)
    }

    fn specialize_alt(&mut self, var: &Variable, children: &[Variable], path: Path) -> Result<Vec<Path>, EngineError> {
        let chosen = self.fuzz.as_deref_mut().and_then(|f| f.alt_index(var.id(), children.len()));
        let index = match chosen {
            Some(index) => index?,
            None => self.rng.random_range(0..children.len()),
        };
        let child = &children[index];
        trace!(var = var.name(), child = child.name(), "alternative chosen");
        let mut out = Vec::new();
        for p in self.specialize(child, path)? {
            out.push(self.compose(var, std::slice::from_ref(child), p)?);
        }
        out.shuffle(&mut *self.rng);
        Ok(out)
    }

    fn specialize_agg(&mut self, var: &Variable, children: &[Variable], path: Path) -> Result<Vec<Path>, EngineError> {
        let mut paths = vec![path];
        for child in children {
            let mut next = Vec::new();
            for p in paths {
                next.extend(self.specialize(child, p)?);
            }
            paths = next;
        }
        paths.into_iter().map(|p| self.compose(var, children, p)).collect()
    }

    fn specialize_repeat(&mut self, var: &Variable, r: &Repeat, path: Path) -> Result<Vec<Path>, EngineError> {
        let chosen = self.fuzz.as_deref_mut().and_then(|f| f.repeat_count(var.id()));
        let k = match chosen {
            Some(count) => count?,
            None => {
                let max = r.count.max.min(self.max_repeat.max(r.count.min + 1));
                self.rng.random_range(r.count.min..max)
            }
        };
        trace!(var = var.name(), count = k, "repetition count chosen");
        let mut states = vec![(path, Content::new())];
        for i in 0..k {
            let mut next = Vec::new();
            for (p, mut content) in states {
                if i > 0 {
                    if let Some(d) = &r.delimiter {
                        content.push_bits(d);
                    }
                }
                for q in self.specialize(&r.child, p)? {
                    let Some(instance) = q.content(r.child.id()) else {
                        continue;
                    };
                    let mut content = content.clone();
                    content.append(q.freeze(instance));
                    next.push((q, content));
                }
            }
            states = next;
        }
        let mut out = Vec::with_capacity(states.len());
        for (mut p, content) in states {
            p.add_result(var.id(), content);
            relation::settle_specialized(&mut p, &mut *self.rng)?;
            out.push(p);
        }
        Ok(out)
    }

    fn compose(&mut self, var: &Variable, children: &[Variable], mut path: Path) -> Result<Path, EngineError> {
        let mut content = Content::new();
        for child in children {
            if let Some(c) = path.content(child.id()) {
                content.append(path.freeze(c));
            }
        }
        path.add_result(var.id(), content);
        relation::settle_specialized(&mut path, &mut *self.rng)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Integer, Raw};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn same_seed_same_output() {
        let v = Variable::data("v", Raw::sized(1, Some(8)).expect("raw"));
        let run = |seed| {
            let mut rng = Pcg64::seed_from_u64(seed);
            let paths = VariableSpecializer::new(&mut rng).specialize(&v, Path::new()).expect("specialize");
            paths[0].bits(v.id())
        };
        assert_eq!(run(11), run(11));
    }

    #[test]
    fn forward_size_is_patched() {
        let payload = Variable::data("payload", Raw::exact(5));
        let len = Variable::size("len", &[&payload], Integer::uint8()).expect("size");
        let len_id = len.id();
        let msg = Variable::agg("msg", vec![len, payload]).expect("agg");
        let mut rng = Pcg64::seed_from_u64(1);
        let paths = VariableSpecializer::new(&mut rng).specialize(&msg, Path::new()).expect("specialize");
        assert_eq!(paths.len(), 1);
        assert!(paths[0].pending().is_empty());
        assert_eq!(paths[0].bits(len_id), Some(BitString::from_bytes(&[5])));
        assert_eq!(paths[0].measure(msg.id()), Some(48));
    }
}
