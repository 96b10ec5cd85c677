//! Subscription with per-transaction deltas.

use std::collections::HashMap;

use super::{CollectionSubscription, Predicate, Subscription};
use crate::blackboard::{ObjectId, ObjectRef};
use crate::envelope::ChangeReport;

/// A [`CollectionSubscription`] that also records what happened during the
/// current transaction.
///
/// The added / removed / changed lists and the events seen are valid from
/// transaction open until the subscriber closes the transaction, at which
/// point they are cleared. Invisible (persistence) applications update
/// membership without recording deltas.
#[derive(Debug)]
pub struct IncrementalSubscription {
    inner: CollectionSubscription,
    added: Vec<ObjectRef>,
    removed: Vec<ObjectRef>,
    changed: Vec<ObjectRef>,
    change_reports: HashMap<ObjectId, Vec<ChangeReport>>,
    events: Vec<ObjectRef>,
}

impl IncrementalSubscription {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            inner: CollectionSubscription::new(predicate),
            added: Vec::new(),
            removed: Vec::new(),
            changed: Vec::new(),
            change_reports: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Members added in this transaction.
    pub fn added_list(&self) -> &[ObjectRef] {
        &self.added
    }

    /// Members removed in this transaction.
    pub fn removed_list(&self) -> &[ObjectRef] {
        &self.removed
    }

    /// Members changed in this transaction (at most once each, latest version).
    pub fn changed_list(&self) -> &[ObjectRef] {
        &self.changed
    }

    /// Accumulated change reports for one changed member.
    pub fn change_reports(&self, id: &ObjectId) -> &[ChangeReport] {
        self.change_reports.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Events matched in this transaction.
    pub fn events(&self) -> &[ObjectRef] {
        &self.events
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ObjectRef> {
        self.inner.get(id)
    }

    pub fn elements(&self) -> Vec<ObjectRef> {
        self.inner.elements()
    }
}

impl Subscription for IncrementalSubscription {
    fn predicate(&self) -> &Predicate {
        self.inner.predicate()
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.inner.contains(id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn private_add(&mut self, object: &ObjectRef, visible: bool) {
        self.inner.private_add(object, visible);
        if visible {
            self.added.push(object.clone());
        }
    }

    fn private_remove(&mut self, object: &ObjectRef, visible: bool) {
        self.inner.private_remove(object, visible);
        if visible {
            self.changed.retain(|o| o.id != object.id);
            self.change_reports.remove(&object.id);
            self.removed.push(object.clone());
        }
    }

    fn private_change(&mut self, object: &ObjectRef, changes: &[ChangeReport], visible: bool) {
        self.inner.private_change(object, changes, visible);
        if !visible {
            return;
        }
        // An object added in this transaction stays reported as added.
        if let Some(slot) = self.added.iter_mut().find(|o| o.id == object.id) {
            *slot = object.clone();
            return;
        }
        match self.changed.iter_mut().find(|o| o.id == object.id) {
            Some(slot) => *slot = object.clone(),
            None => self.changed.push(object.clone()),
        }
        self.change_reports
            .entry(object.id.clone())
            .or_default()
            .extend(changes.iter().cloned());
    }

    fn private_event(&mut self, object: &ObjectRef, visible: bool) {
        if visible {
            self.events.push(object.clone());
        }
    }

    fn reset_changes(&mut self) {
        self.inner.reset_changes();
        self.added.clear();
        self.removed.clear();
        self.changed.clear();
        self.change_reports.clear();
        self.events.clear();
    }

    fn has_changed(&self) -> bool {
        self.inner.has_changed() || !self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::BlackboardObject;
    use crate::envelope::Envelope;

    fn obj(seq: u64, n: i64) -> ObjectRef {
        BlackboardObject::new(ObjectId::new("a", seq), "task", serde_json::json!({"n": n}))
            .into_ref()
    }

    #[test]
    fn test_deltas_for_one_transaction() {
        let mut sub = IncrementalSubscription::new(Predicate::all());
        let mut setup = Envelope::new();
        setup.add_object(obj(1, 0));
        setup.add_object(obj(2, 0));
        setup.apply_to_subscription(&mut sub);
        sub.reset_changes();

        let mut env = Envelope::new();
        env.add_object(obj(3, 0));
        env.change_object(obj(1, 1), vec![ChangeReport::field("n")]);
        env.change_object(obj(1, 2), vec![ChangeReport::field("n")]);
        env.remove_object(obj(2, 0));
        env.add_event(obj(9, 0));
        assert!(env.apply_to_subscription(&mut sub));

        assert_eq!(sub.added_list().len(), 1);
        assert_eq!(sub.removed_list().len(), 1);
        assert_eq!(sub.changed_list().len(), 1);
        assert_eq!(sub.changed_list()[0].field("n").unwrap(), 2);
        assert_eq!(sub.change_reports(&ObjectId::new("a", 1)).len(), 2);
        assert_eq!(sub.events().len(), 1);
        assert_eq!(sub.len(), 2);

        sub.reset_changes();
        assert!(sub.added_list().is_empty());
        assert!(sub.events().is_empty());
        assert!(!sub.has_changed());
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn test_change_after_add_reports_add_only() {
        let mut sub = IncrementalSubscription::new(Predicate::all());
        let mut env = Envelope::new();
        env.add_object(obj(1, 0));
        env.change_object(obj(1, 5), vec![]);
        env.apply_to_subscription(&mut sub);

        assert_eq!(sub.added_list().len(), 1);
        assert_eq!(sub.added_list()[0].field("n").unwrap(), 5);
        assert!(sub.changed_list().is_empty());
    }
}
