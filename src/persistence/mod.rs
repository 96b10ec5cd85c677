//! Persistence boundary.
//!
//! The distributor decides *when* to checkpoint and *what* goes into a
//! [`Checkpoint`]; a [`Persistence`] backend decides where it lives. Running
//! without a backend is a supported configuration.
//!
//! A checkpoint is either *full* (a baseline snapshot of the store) or a
//! *delta* (the envelopes distributed since the previous checkpoint). Both
//! carry the per-subscriber pending envelopes and the message manager
//! state as of the checkpoint. Rehydration folds the latest full checkpoint
//! and every later delta into a [`RehydrationResult`].

pub mod memory;
pub mod sqlite;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryPersistence;
pub use sqlite::SqlitePersistence;

use crate::blackboard::Blackboard;
use crate::envelope::Envelope;
use crate::errors::PersistenceError;
use crate::message::MessageManagerState;

/// Envelopes a subscriber had received but not finished applying: those
/// of its open transaction, if any, followed by its inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberCheckpoint {
    pub name: String,
    pub pending: Vec<Envelope>,
}

/// One persisted epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub agent: String,
    pub epoch: u64,
    pub full: bool,
    /// Store snapshot (full checkpoints only).
    pub baseline: Option<Envelope>,
    /// Envelopes distributed during this epoch (delta checkpoints).
    pub envelopes: Vec<Envelope>,
    pub subscribers: Vec<SubscriberCheckpoint>,
    pub message_state: Option<MessageManagerState>,
    /// Open transactions when the checkpoint was taken.
    pub open_transactions: usize,
    pub created_at: DateTime<Utc>,
}

/// What an agent resumes from.
#[derive(Debug, Clone)]
pub struct RehydrationResult {
    pub epoch: u64,
    /// Invisible envelope holding every object that was on the blackboard.
    pub baseline: Envelope,
    pub subscribers: Vec<SubscriberCheckpoint>,
    pub message_state: Option<MessageManagerState>,
}

impl RehydrationResult {
    /// Fold checkpoints (oldest first) starting at the latest full one.
    ///
    /// Returns `None` if there is no full checkpoint to start from.
    pub fn fold(checkpoints: &[Checkpoint]) -> Option<Self> {
        let start = checkpoints.iter().rposition(|c| c.full)?;
        let mut store = Blackboard::new();
        for checkpoint in &checkpoints[start..] {
            if let Some(baseline) = &checkpoint.baseline {
                store.clear();
                store.apply(baseline);
            }
            for envelope in &checkpoint.envelopes {
                store.apply(envelope);
            }
        }
        let last = checkpoints.last()?;
        Some(Self {
            epoch: last.epoch,
            baseline: store.to_persistence_envelope(),
            subscribers: last.subscribers.clone(),
            message_state: last.message_state.clone(),
        })
    }
}

/// A checkpoint store.
pub trait Persistence: Send + Sync + fmt::Debug {
    /// Durably record one checkpoint.
    fn persist(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;

    /// Latest resumable state for `agent`, or `None` on a cold start.
    fn rehydrate(&self, agent: &str) -> Result<Option<RehydrationResult>, PersistenceError>;
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::blackboard::ObjectId;

    #[test]
    fn test_fold_applies_deltas_after_latest_full() {
        let mut base = Envelope::persistence();
        base.bulk_add(vec![obj(1, 0), obj(2, 0)]);
        let mut full = checkpoint(1, true);
        full.baseline = Some(base);

        let mut delta_env = Envelope::new();
        delta_env.remove_object(obj(1, 0));
        delta_env.add_object(obj(3, 0));
        delta_env.change_object(obj(2, 7), vec![]);
        let mut delta = checkpoint(2, false);
        delta.envelopes.push(delta_env);
        delta.subscribers.push(SubscriberCheckpoint {
            name: "planner".into(),
            pending: vec![Envelope::new()],
        });

        let result = RehydrationResult::fold(&[checkpoint(0, false), full, delta]).unwrap();
        assert_eq!(result.epoch, 2);
        assert!(!result.baseline.is_visible());
        let mut store = Blackboard::new();
        store.apply(&result.baseline);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&ObjectId::new("a", 2)).unwrap().field("n").unwrap(), 7);
        assert_eq!(result.subscribers[0].name, "planner");
    }

    #[test]
    fn test_fold_without_full_is_cold_start() {
        assert!(RehydrationResult::fold(&[checkpoint(1, false)]).is_none());
        assert!(RehydrationResult::fold(&[]).is_none());
    }

    #[test]
    fn test_checkpoint_serde() {
        let mut c = checkpoint(4, true);
        let mut base = Envelope::persistence();
        base.bulk_add(vec![obj(1, 1)]);
        c.baseline = Some(base);
        let json = serde_json::to_string(&c).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epoch, 4);
        assert!(back.full);
        assert_eq!(back.baseline.unwrap().len(), 1);
    }
}
