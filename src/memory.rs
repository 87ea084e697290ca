//! Session memory: values that survive from one message to the next.
//!
//! Writes land in a scratch layer and only reach the committed layer on
//! [`Memory::persist`]; a failed message calls [`Memory::discard`] instead.

use crate::bits::BitString;
use crate::domain::VarId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct Memory {
    committed: Arc<HashMap<VarId, BitString>>,
    scratch: HashMap<VarId, BitString>,
}

impl Memory {
    pub fn new() -> Self {
        Memory::default()
    }

    /// Stage a value for the message in progress.
    pub fn memorize(&mut self, var: VarId, value: BitString) {
        self.scratch.insert(var, value);
    }

    /// Committed value of `var`.
    pub fn recall(&self, var: VarId) -> Option<&BitString> {
        self.committed.get(&var)
    }

    pub fn contains(&self, var: VarId) -> bool {
        self.committed.contains_key(&var)
    }

    pub fn forget(&mut self, var: VarId) {
        self.scratch.remove(&var);
        if self.committed.contains_key(&var) {
            Arc::make_mut(&mut self.committed).remove(&var);
        }
    }

    /// Move every staged value into the committed layer.
    pub fn persist(&mut self) {
        if self.scratch.is_empty() {
            return;
        }
        let committed = Arc::make_mut(&mut self.committed);
        for (var, value) in self.scratch.drain() {
            if let Some(old) = committed.get(&var) {
                if *old != value {
                    trace!(%var, old = %old, new = %value, "persisted value replaced");
                }
            }
            committed.insert(var, value);
        }
        debug!(entries = committed.len(), "memory persisted");
    }

    /// Drop staged values without committing them.
    pub fn discard(&mut self) {
        self.scratch.clear();
    }

    /// Independent copy: later writes to either memory do not affect the other.
    pub fn duplicate(&self) -> Memory {
        Memory {
            committed: Arc::new((*self.committed).clone()),
            scratch: self.scratch.clone(),
        }
    }

    /// Read-only view of the committed layer, shared with the paths of one call.
    pub fn snapshot(&self) -> Arc<HashMap<VarId, BitString>> {
        Arc::clone(&self.committed)
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memorize_is_invisible_until_persist() {
        let mut m = Memory::new();
        let v = VarId::fresh();
        m.memorize(v, BitString::from_bytes(b"x"));
        assert!(m.recall(v).is_none());
        m.persist();
        assert_eq!(m.recall(v), Some(&BitString::from_bytes(b"x")));
    }

    #[test]
    fn discard_keeps_committed_state() {
        let mut m = Memory::new();
        let v = VarId::fresh();
        m.memorize(v, BitString::from_bytes(b"a"));
        m.persist();
        m.memorize(v, BitString::from_bytes(b"b"));
        m.discard();
        m.persist();
        assert_eq!(m.recall(v), Some(&BitString::from_bytes(b"a")));
    }

    #[test]
    fn duplicate_is_a_value_copy() {
        let mut m = Memory::new();
        let v = VarId::fresh();
        m.memorize(v, BitString::from_bytes(b"a"));
        m.persist();
        let snapshot = m.snapshot();
        let mut copy = m.duplicate();
        copy.forget(v);
        assert!(copy.recall(v).is_none());
        assert!(m.recall(v).is_some());
        assert!(snapshot.contains_key(&v));
    }
}
