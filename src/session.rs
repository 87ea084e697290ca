//! A session: memory, randomness and fuzzing shared across messages.

use crate::bits::BitString;
use crate::domain::MAX_REPEAT;
use crate::error::Result;
use crate::fuzz::{Fuzz, DEFAULT_MAX_DEPTH};
use crate::memory::Memory;
use crate::message::{Message, MessageParser, MessageSpecializer, Symbol};
use crate::specializer::DEFAULT_MAX_GENERATED_BYTES;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Seed of the session RNG; a random one when unset.
    pub seed: Option<u64>,
    /// Mutator-driven alternative choices allowed per message, nested or not.
    pub max_alt_depth: usize,
    pub max_repeat: usize,
    /// Promote learned values to committed memory after each message.
    pub persist_on_success: bool,
    /// Bound for leaves without a maximum length.
    pub max_generated_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            seed: None,
            max_alt_depth: DEFAULT_MAX_DEPTH,
            max_repeat: MAX_REPEAT,
            persist_on_success: true,
            max_generated_bytes: DEFAULT_MAX_GENERATED_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_alt_depth(mut self, depth: usize) -> Self {
        self.max_alt_depth = depth;
        self
    }

    pub fn with_max_repeat(mut self, max: usize) -> Self {
        self.max_repeat = max;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist_on_success = persist;
        self
    }

    pub fn with_max_generated_bytes(mut self, bytes: usize) -> Self {
        self.max_generated_bytes = bytes;
        self
    }
}

pub struct Session {
    config: SessionConfig,
    memory: Memory,
    rng: Pcg64,
    fuzz: Option<Fuzz>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        debug!(seed, "session created");
        Session { config, memory: Memory::new(), rng: Pcg64::seed_from_u64(seed), fuzz: None }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Bind mutators; the registry's depth limit follows the session config.
    pub fn set_fuzz(&mut self, fuzz: Fuzz) {
        self.fuzz = Some(fuzz.with_max_depth(self.config.max_alt_depth));
    }

    pub fn fuzz_mut(&mut self) -> Option<&mut Fuzz> {
        self.fuzz.as_mut()
    }

    pub fn clear_fuzz(&mut self) -> Option<Fuzz> {
        self.fuzz.take()
    }

    pub fn specialize(&mut self, symbol: &Symbol) -> Result<Message> {
        let mut specializer = MessageSpecializer::new(&mut self.rng)
            .with_max_generated_bytes(self.config.max_generated_bytes)
            .with_max_repeat(self.config.max_repeat)
            .with_persist(self.config.persist_on_success);
        if let Some(fuzz) = self.fuzz.as_mut() {
            specializer = specializer.with_fuzz(fuzz);
        }
        specializer.specialize(symbol, &mut self.memory)
    }

    /// Abstract `data` against the first symbol that accepts it.
    pub fn abstract_message(&mut self, symbols: &[Symbol], data: &[u8]) -> Option<Message> {
        let bits = BitString::from_bytes(data);
        for symbol in symbols {
            let parser = MessageParser::new(symbol)
                .with_max_repeat(self.config.max_repeat)
                .with_persist(self.config.persist_on_success);
            if let Some(message) = parser.parse(&bits, &mut self.memory) {
                return Some(message);
            }
        }
        debug!(bytes = data.len(), "no symbol matches");
        None
    }

    /// An independent session with a copy of this one's memory and a fresh
    /// RNG stream derived from this one. Mutators are not shared.
    pub fn fork(&mut self) -> Session {
        let seed = rand::RngCore::next_u64(&mut self.rng);
        Session {
            config: self.config.clone(),
            memory: self.memory.duplicate(),
            rng: Pcg64::seed_from_u64(seed),
            fuzz: None,
        }
    }
}
