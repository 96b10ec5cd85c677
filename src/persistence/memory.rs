//! In-process checkpoint store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{Checkpoint, Persistence, RehydrationResult};
use crate::errors::PersistenceError;

/// Keeps checkpoints in memory, per agent, compacted at every full
/// checkpoint. Survives a distributor being dropped and rebuilt, which is
/// what the restart tests and the demo need.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    checkpoints: Mutex<HashMap<String, Vec<Checkpoint>>>,
    unavailable: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Checkpoints retained for `agent`.
    pub fn checkpoints(&self, agent: &str) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend(anyhow::anyhow!(
                "memory persistence marked unavailable"
            )));
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn persist(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut all = self.checkpoints.lock();
        let list = all.entry(checkpoint.agent.clone()).or_default();
        if checkpoint.full {
            list.clear();
        }
        list.push(checkpoint.clone());
        log::debug!(
            "MemoryPersistence: stored epoch {} for {} ({} retained)",
            checkpoint.epoch,
            checkpoint.agent,
            list.len()
        );
        Ok(())
    }

    fn rehydrate(&self, agent: &str) -> Result<Option<RehydrationResult>, PersistenceError> {
        self.check_available()?;
        let all = self.checkpoints.lock();
        Ok(all.get(agent).and_then(|list| RehydrationResult::fold(list)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn test_full_checkpoint_compacts() {
        let store = MemoryPersistence::new();
        store.persist(&checkpoint(1, true)).unwrap();
        store.persist(&checkpoint(2, false)).unwrap();
        assert_eq!(store.checkpoints("a").len(), 2);
        store.persist(&checkpoint(3, true)).unwrap();
        assert_eq!(store.checkpoints("a").len(), 1);
        assert!(store.checkpoints("b").is_empty());
    }

    #[test]
    fn test_rehydrate_cold_and_warm() {
        let store = MemoryPersistence::new();
        assert!(store.rehydrate("a").unwrap().is_none());

        let mut full = checkpoint(1, true);
        let mut base = Envelope::persistence();
        base.bulk_add(vec![obj(1, 0)]);
        full.baseline = Some(base);
        store.persist(&full).unwrap();

        let result = store.rehydrate("a").unwrap().unwrap();
        assert_eq!(result.epoch, 1);
        assert_eq!(result.baseline.tuples()[0].objects().len(), 1);
    }

    #[test]
    fn test_unavailable_fails() {
        let store = MemoryPersistence::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.persist(&checkpoint(1, true)),
            Err(PersistenceError::Backend(_))
        ));
        store.set_unavailable(false);
        assert!(store.persist(&checkpoint(1, true)).is_ok());
    }
}
