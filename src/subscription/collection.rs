//! Plain membership subscription.

use std::collections::BTreeMap;

use super::{Predicate, Subscription};
use crate::blackboard::{ObjectId, ObjectRef};
use crate::envelope::ChangeReport;

/// Current members of a predicate, in id order, with a changed flag.
#[derive(Debug)]
pub struct CollectionSubscription {
    predicate: Predicate,
    members: BTreeMap<ObjectId, ObjectRef>,
    changed: bool,
}

impl CollectionSubscription {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            members: BTreeMap::new(),
            changed: false,
        }
    }

    /// Current version of a member.
    pub fn get(&self, id: &ObjectId) -> Option<&ObjectRef> {
        self.members.get(id)
    }

    /// Members in id order.
    pub fn elements(&self) -> Vec<ObjectRef> {
        self.members.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectRef> {
        self.members.values()
    }
}

impl Subscription for CollectionSubscription {
    fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.members.contains_key(id)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn private_add(&mut self, object: &ObjectRef, visible: bool) {
        self.members.insert(object.id.clone(), object.clone());
        self.changed |= visible;
    }

    fn private_remove(&mut self, object: &ObjectRef, visible: bool) {
        self.members.remove(&object.id);
        self.changed |= visible;
    }

    fn private_change(&mut self, object: &ObjectRef, _changes: &[ChangeReport], visible: bool) {
        self.members.insert(object.id.clone(), object.clone());
        self.changed |= visible;
    }

    fn reset_changes(&mut self) {
        self.changed = false;
    }

    fn has_changed(&self) -> bool {
        self.changed
    }
}
