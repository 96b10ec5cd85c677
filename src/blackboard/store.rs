//! Blackboard store: the authoritative object set of one agent.
//!
//! Only the distributor mutates the store, and only while applying
//! envelopes under its lock. Everybody else reads through subscriptions.

use std::collections::BTreeMap;

use super::object::{ObjectId, ObjectRef};
use crate::envelope::{Envelope, EnvelopeTuple};
use crate::subscription::Predicate;

/// The agent-wide object store.
#[derive(Debug, Default, Clone)]
pub struct Blackboard {
    objects: BTreeMap<ObjectId, ObjectRef>,
}

impl Blackboard {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Check whether an object is published.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Current version of an object.
    pub fn get(&self, id: &ObjectId) -> Option<&ObjectRef> {
        self.objects.get(id)
    }

    /// Iterate over current versions in id order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectRef> {
        self.objects.values()
    }

    /// Every object matching `predicate`.
    pub fn query(&self, predicate: &Predicate) -> Vec<ObjectRef> {
        self.objects
            .values()
            .filter(|o| predicate.is_member(o))
            .cloned()
            .collect()
    }

    /// Clone of the id → object map.
    pub fn snapshot(&self) -> BTreeMap<ObjectId, ObjectRef> {
        self.objects.clone()
    }

    /// Highest sequence minted by `owner`, for resuming id generation.
    pub fn max_sequence_for(&self, owner: &str) -> u64 {
        self.objects
            .keys()
            .filter(|id| id.owner == owner)
            .map(|id| id.sequence)
            .max()
            .unwrap_or(0)
    }

    /// Apply an envelope; returns the number of effective mutations.
    pub fn apply(&mut self, envelope: &Envelope) -> usize {
        let mut applied = 0;
        for tuple in envelope.tuples() {
            match tuple {
                EnvelopeTuple::Add(o) => {
                    if self.objects.insert(o.id.clone(), o.clone()).is_none() {
                        applied += 1;
                    } else {
                        log::debug!("Blackboard: add of already present {}", o.id);
                    }
                }
                EnvelopeTuple::Remove(o) => {
                    if self.objects.remove(&o.id).is_some() {
                        applied += 1;
                    } else {
                        log::debug!("Blackboard: remove of absent {}", o.id);
                    }
                }
                EnvelopeTuple::Change { object, .. } => {
                    self.objects.insert(object.id.clone(), object.clone());
                    applied += 1;
                }
                EnvelopeTuple::Bulk(objects) => {
                    for o in objects {
                        if !self.objects.contains_key(&o.id) {
                            self.objects.insert(o.id.clone(), o.clone());
                            applied += 1;
                        }
                    }
                }
                EnvelopeTuple::Event(_) => {}
            }
        }
        applied
    }

    /// Snapshot as a persistence envelope with a single bulk tuple.
    pub fn to_persistence_envelope(&self) -> Envelope {
        let mut envelope = Envelope::persistence();
        if !self.objects.is_empty() {
            envelope.bulk_add(self.objects.values().cloned().collect());
        }
        envelope
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::BlackboardObject;

    fn obj(seq: u64, kind: &str) -> ObjectRef {
        BlackboardObject::new(ObjectId::new("a", seq), kind, serde_json::json!({})).into_ref()
    }

    #[test]
    fn test_apply_counts_effective_changes() {
        let mut bb = Blackboard::new();
        let mut env = Envelope::new();
        env.add_object(obj(1, "task"));
        env.add_object(obj(1, "task"));
        env.bulk_add(vec![obj(1, "task"), obj(2, "task")]);
        env.remove_object(obj(9, "task"));
        assert_eq!(bb.apply(&env), 2);
        assert_eq!(bb.len(), 2);
    }

    #[test]
    fn test_change_replaces_version() {
        let mut bb = Blackboard::new();
        let v1 = obj(1, "task");
        let mut env = Envelope::new();
        env.add_object(v1.clone());
        bb.apply(&env);

        let v2 = v1.with_payload(serde_json::json!({"state": "done"})).into_ref();
        let mut env = Envelope::new();
        env.change_object(v2, vec![]);
        bb.apply(&env);

        let current = bb.get(&v1.id).unwrap();
        assert_eq!(current.field("state").unwrap(), "done");
    }

    #[test]
    fn test_query_and_persistence_envelope() {
        let mut bb = Blackboard::new();
        let mut env = Envelope::new();
        env.add_object(obj(1, "task"));
        env.add_object(obj(2, "asset"));
        env.add_object(obj(5, "task"));
        bb.apply(&env);

        assert_eq!(bb.query(&Predicate::of_kind("task")).len(), 2);
        assert_eq!(bb.max_sequence_for("a"), 5);
        assert_eq!(bb.max_sequence_for("b"), 0);

        let snapshot = bb.to_persistence_envelope();
        assert!(!snapshot.is_visible());
        let mut restored = Blackboard::new();
        restored.apply(&snapshot);
        assert_eq!(restored.len(), 3);
    }
}
