//! Fuzzing: value generators, mutators bound to variables, and the registry
//! the specializer consults.
//!
//! A mutator replaces (or perturbs) the value the specializer would normally
//! produce for a leaf, picks the branch of an alternative, or the count of a
//! repetition. Finite generators report exhaustion instead of wrapping, unless
//! explicitly made cyclic.

use crate::bits::BitString;
use crate::domain::{RepeatCount, VarId, Variable, MAX_REPEAT};
use crate::types::DataType;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// Default number of mutator-driven alternative choices allowed in one
/// message. Every choice counts, whether the alternatives are nested or sit
/// side by side (e.g. the items of a repetition), so this is a budget rather
/// than a nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 20;

/// Default number of values a mutator produces before it stops.
pub const COUNTER_MAX_DEFAULT: usize = 1 << 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FuzzError {
    #[error("generator exhausted")]
    Exhausted,
    #[error("mutator reached its maximum of {0} values")]
    MaxCounter(usize),
    #[error("alternative recursion depth exceeded (maximum {max})")]
    DepthExceeded { max: usize },
    #[error("position {index} out of range for {len} choices")]
    InvalidPosition { index: u64, len: usize },
}

/// Source of raw values for mutators.
pub trait Generator: fmt::Debug + Send {
    fn next_value(&mut self) -> Result<u64, FuzzError>;
}

/// xorshift64 generator bounded to `[min, max]`.
#[derive(Debug, Clone)]
pub struct XorShift {
    state: u64,
    min: u64,
    max: u64,
}

impl XorShift {
    pub fn new(seed: u64, min: u64, max: u64) -> Self {
        let state = if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed };
        XorShift { state, min: min.min(max), max: max.max(min) }
    }
}

impl Generator for XorShift {
    fn next_value(&mut self) -> Result<u64, FuzzError> {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        let span = self.max - self.min;
        if span == u64::MAX {
            return Ok(x);
        }
        Ok(self.min + x % (span + 1))
    }
}

/// PCG-backed generator bounded to `[min, max]`.
#[derive(Debug, Clone)]
pub struct PcgGenerator {
    rng: Pcg64,
    min: u64,
    max: u64,
}

impl PcgGenerator {
    pub fn new(seed: u64, min: u64, max: u64) -> Self {
        PcgGenerator { rng: Pcg64::seed_from_u64(seed), min: min.min(max), max: max.max(min) }
    }
}

impl Generator for PcgGenerator {
    fn next_value(&mut self) -> Result<u64, FuzzError> {
        Ok(self.rng.random_range(self.min..=self.max))
    }
}

/// Finite list of values.
#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    values: Vec<u64>,
    pos: usize,
    cyclic: bool,
}

impl SequenceGenerator {
    pub fn new(values: Vec<u64>) -> Self {
        SequenceGenerator { values, pos: 0, cyclic: false }
    }

    /// Restart from the first value instead of reporting exhaustion.
    pub fn cycle(mut self) -> Self {
        self.cyclic = true;
        self
    }
}

impl Generator for SequenceGenerator {
    fn next_value(&mut self) -> Result<u64, FuzzError> {
        if self.pos >= self.values.len() {
            if !self.cyclic || self.values.is_empty() {
                return Err(FuzzError::Exhausted);
            }
            self.pos = 0;
        }
        let v = self.values[self.pos];
        self.pos += 1;
        Ok(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutatorMode {
    /// Replace the normal value.
    #[default]
    Generate,
    /// Perturb the normal value.
    Mutate,
    /// Always the same value.
    Fixed,
}

pub trait Mutator: fmt::Debug + Send {
    fn mode(&self) -> MutatorMode;

    /// Value used instead of the leaf's normal one.
    fn generate(&mut self, data_type: &dyn DataType) -> Result<BitString, FuzzError>;

    /// Perturbation of the leaf's normal value.
    fn mutate(&mut self, value: &BitString) -> Result<BitString, FuzzError>;
}

/// Generator-driven values with the leaf's length bounds but not its other
/// constraints.
#[derive(Debug)]
pub struct DataMutator {
    mode: MutatorMode,
    generator: Box<dyn Generator>,
    counter: usize,
    counter_max: usize,
    cap_bits: usize,
}

impl DataMutator {
    pub fn new(mode: MutatorMode, generator: impl Generator + 'static) -> Self {
        DataMutator {
            mode,
            generator: Box::new(generator),
            counter: 0,
            counter_max: COUNTER_MAX_DEFAULT,
            cap_bits: 64 * 8,
        }
    }

    /// Seeded pseudo-random mutator.
    pub fn seeded(mode: MutatorMode, seed: u64) -> Self {
        DataMutator::new(mode, PcgGenerator::new(seed, 0, u64::MAX))
    }

    pub fn with_counter_max(mut self, counter_max: usize) -> Self {
        self.counter_max = counter_max;
        self
    }

    fn tick(&mut self) -> Result<(), FuzzError> {
        if self.counter >= self.counter_max {
            return Err(FuzzError::MaxCounter(self.counter_max));
        }
        self.counter += 1;
        Ok(())
    }

    fn bits(&mut self, len: usize) -> Result<BitString, FuzzError> {
        let mut bytes = Vec::with_capacity(len.div_ceil(8));
        while bytes.len() * 8 < len {
            bytes.extend_from_slice(&self.generator.next_value()?.to_be_bytes());
        }
        Ok(BitString::from(bytes).slice(0, len))
    }
}

impl Mutator for DataMutator {
    fn mode(&self) -> MutatorMode {
        self.mode
    }

    fn generate(&mut self, data_type: &dyn DataType) -> Result<BitString, FuzzError> {
        self.tick()?;
        let (min, max) = data_type.size();
        let unit = data_type.unit_bits().max(1);
        let max = max.unwrap_or_else(|| min.max(self.cap_bits));
        let len = if max > min {
            let span = ((max - min) / unit) as u64 + 1;
            min + (self.generator.next_value()? % span) as usize * unit
        } else {
            min
        };
        self.bits(len)
    }

    fn mutate(&mut self, value: &BitString) -> Result<BitString, FuzzError> {
        self.tick()?;
        let mut out = value.clone();
        if !out.is_empty() {
            let i = (self.generator.next_value()? % out.len() as u64) as usize;
            out.flip(i);
        }
        Ok(out)
    }
}

/// Deterministic boundary values of a `bits`-wide integer, then exhaustion.
#[derive(Debug)]
pub struct IntegerBoundaryMutator {
    bits: usize,
    values: SequenceGenerator,
}

impl IntegerBoundaryMutator {
    pub fn new(bits: usize, signed: bool) -> Self {
        let bits = bits.clamp(2, 64);
        let all = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let values = if signed {
            let min = 1u64 << (bits - 1);
            vec![min, min + 1, all, 0, 1, min - 2, min - 1]
        } else {
            vec![0, 1, all / 2, all / 2 + 1, all - 1, all]
        };
        IntegerBoundaryMutator { bits, values: SequenceGenerator::new(values) }
    }

    fn next_bits(&mut self) -> Result<BitString, FuzzError> {
        let v = self.values.next_value()?;
        Ok(BitString::from_uint(u128::from(v), self.bits))
    }
}

impl Mutator for IntegerBoundaryMutator {
    fn mode(&self) -> MutatorMode {
        MutatorMode::Generate
    }

    fn generate(&mut self, _data_type: &dyn DataType) -> Result<BitString, FuzzError> {
        self.next_bits()
    }

    fn mutate(&mut self, _value: &BitString) -> Result<BitString, FuzzError> {
        self.next_bits()
    }
}

#[derive(Debug, Clone)]
pub struct FixedMutator {
    value: BitString,
}

impl FixedMutator {
    pub fn new(value: BitString) -> Self {
        FixedMutator { value }
    }
}

impl Mutator for FixedMutator {
    fn mode(&self) -> MutatorMode {
        MutatorMode::Fixed
    }

    fn generate(&mut self, _data_type: &dyn DataType) -> Result<BitString, FuzzError> {
        Ok(self.value.clone())
    }

    fn mutate(&mut self, _value: &BitString) -> Result<BitString, FuzzError> {
        Ok(self.value.clone())
    }
}

/// Chooses the branch of an alternative.
#[derive(Debug)]
pub struct AltMutator {
    generator: Box<dyn Generator>,
}

impl AltMutator {
    pub fn new(generator: impl Generator + 'static) -> Self {
        AltMutator { generator: Box::new(generator) }
    }

    /// Uniformly random branch among `choices`.
    pub fn random(seed: u64, choices: usize) -> Self {
        AltMutator::new(PcgGenerator::new(seed, 0, choices.saturating_sub(1) as u64))
    }

    /// Given branch positions, in order.
    pub fn positions(positions: Vec<usize>) -> Self {
        AltMutator::new(SequenceGenerator::new(positions.into_iter().map(|p| p as u64).collect()))
    }

    fn next_index(&mut self, len: usize) -> Result<usize, FuzzError> {
        let index = self.generator.next_value()?;
        if index >= len as u64 {
            return Err(FuzzError::InvalidPosition { index, len });
        }
        Ok(index as usize)
    }
}

/// Chooses the count of a repetition, possibly outside the grammar's range.
#[derive(Debug)]
pub struct RepeatMutator {
    generator: Box<dyn Generator>,
}

impl RepeatMutator {
    pub fn new(generator: impl Generator + 'static) -> Self {
        RepeatMutator { generator: Box::new(generator) }
    }

    pub fn random(seed: u64, count: RepeatCount) -> Self {
        RepeatMutator::new(PcgGenerator::new(seed, count.min as u64, (count.max - 1) as u64))
    }

    fn next_count(&mut self) -> Result<usize, FuzzError> {
        let count = self.generator.next_value()?;
        if count >= MAX_REPEAT as u64 {
            return Err(FuzzError::InvalidPosition { index: count, len: MAX_REPEAT });
        }
        Ok(count as usize)
    }
}

/// Mutators bound to variables, consulted by the specializer.
#[derive(Debug)]
pub struct Fuzz {
    leaves: HashMap<VarId, Box<dyn Mutator>>,
    alts: HashMap<VarId, AltMutator>,
    repeats: HashMap<VarId, RepeatMutator>,
    depth: usize,
    max_depth: usize,
}

impl Default for Fuzz {
    fn default() -> Self {
        Fuzz::new()
    }
}

impl Fuzz {
    pub fn new() -> Self {
        Fuzz {
            leaves: HashMap::new(),
            alts: HashMap::new(),
            repeats: HashMap::new(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Caps the alternative choices made by mutators in one message. The
    /// count covers sibling alternatives as well as nested ones and restarts
    /// with each message.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Bind a mutator to a data or relation leaf.
    pub fn set(&mut self, var: &Variable, mutator: impl Mutator + 'static) -> &mut Self {
        self.leaves.insert(var.id(), Box::new(mutator));
        self
    }

    pub fn set_alt(&mut self, var: &Variable, mutator: AltMutator) -> &mut Self {
        self.alts.insert(var.id(), mutator);
        self
    }

    pub fn set_repeat(&mut self, var: &Variable, mutator: RepeatMutator) -> &mut Self {
        self.repeats.insert(var.id(), mutator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty() && self.alts.is_empty() && self.repeats.is_empty()
    }

    pub fn mode(&self, var: VarId) -> Option<MutatorMode> {
        self.leaves.get(&var).map(|m| m.mode())
    }

    pub(crate) fn leaf(&mut self, var: VarId) -> Option<&mut Box<dyn Mutator>> {
        self.leaves.get_mut(&var)
    }

    /// Branch chosen for the alternative `var`. Each call spends one unit of
    /// the per-message choice budget.
    pub(crate) fn alt_index(&mut self, var: VarId, len: usize) -> Option<Result<usize, FuzzError>> {
        let max_depth = self.max_depth;
        let mutator = self.alts.get_mut(&var)?;
        if self.depth >= max_depth {
            return Some(Err(FuzzError::DepthExceeded { max: max_depth }));
        }
        self.depth += 1;
        trace!(%var, depth = self.depth, "alternative chosen by mutator");
        Some(mutator.next_index(len))
    }

    pub(crate) fn repeat_count(&mut self, var: VarId) -> Option<Result<usize, FuzzError>> {
        self.repeats.get_mut(&var).map(RepeatMutator::next_count)
    }

    /// Start a new message: the recursion counter goes back to zero.
    pub fn reset_depth(&mut self) {
        self.depth = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_stays_in_bounds() {
        let mut g = XorShift::new(42, 5, 8);
        for _ in 0..100 {
            let v = g.next_value().expect("value");
            assert!((5..=8).contains(&v));
        }
    }

    #[test]
    fn sequence_exhausts_unless_cyclic() {
        let mut g = SequenceGenerator::new(vec![1, 2]);
        assert_eq!(g.next_value(), Ok(1));
        assert_eq!(g.next_value(), Ok(2));
        assert_eq!(g.next_value(), Err(FuzzError::Exhausted));
        let mut c = SequenceGenerator::new(vec![1, 2]).cycle();
        let values: Vec<u64> = (0..5).map(|_| c.next_value().expect("cyclic")).collect();
        assert_eq!(values, vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn data_mutator_counter_max() {
        let t = crate::types::Raw::exact(2);
        let mut m = DataMutator::seeded(MutatorMode::Generate, 3).with_counter_max(2);
        assert_eq!(m.generate(&t).expect("first").len(), 16);
        assert!(m.generate(&t).is_ok());
        assert_eq!(m.generate(&t), Err(FuzzError::MaxCounter(2)));
    }

    #[test]
    fn mutate_flips_exactly_one_bit() {
        let mut m = DataMutator::seeded(MutatorMode::Mutate, 9);
        let v = BitString::from_bytes(&[0u8; 4]);
        let out = m.mutate(&v).expect("mutate");
        let ones: u32 = out.as_bytes().iter().map(|b| b.count_ones()).sum();
        assert_eq!(ones, 1);
    }

    #[test]
    fn unsigned_boundaries_then_exhausted() {
        let t = crate::types::Integer::uint8();
        let mut m = IntegerBoundaryMutator::new(8, false);
        let values: Vec<u8> = (0..6).map(|_| m.generate(&t).expect("value").as_bytes()[0]).collect();
        assert_eq!(values, vec![0, 1, 127, 128, 254, 255]);
        assert_eq!(m.generate(&t), Err(FuzzError::Exhausted));
    }
}
