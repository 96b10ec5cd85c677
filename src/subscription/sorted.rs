//! Comparator-ordered subscription.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::{Predicate, Subscription};
use crate::blackboard::{ObjectId, ObjectRef};
use crate::envelope::ChangeReport;

type Comparator = dyn Fn(&ObjectRef, &ObjectRef) -> Ordering + Send + Sync;

/// Members kept in comparator order.
///
/// Inserts and changes append or replace in place and mark the view dirty;
/// [`elements`](Self::elements) performs a stable sort only when dirty. The
/// order observed by a reader is therefore always consistent with the
/// comparator, but the cost is paid on the first read after a mutation.
pub struct SortedSubscription {
    predicate: Predicate,
    comparator: Arc<Comparator>,
    members: Vec<ObjectRef>,
    ids: HashSet<ObjectId>,
    dirty: bool,
    changed: bool,
}

impl SortedSubscription {
    pub fn new(
        predicate: Predicate,
        comparator: impl Fn(&ObjectRef, &ObjectRef) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Self {
            predicate,
            comparator: Arc::new(comparator),
            members: Vec::new(),
            ids: HashSet::new(),
            dirty: false,
            changed: false,
        }
    }

    /// Members in comparator order.
    pub fn elements(&mut self) -> &[ObjectRef] {
        if self.dirty {
            let cmp = Arc::clone(&self.comparator);
            self.members.sort_by(|a, b| cmp(a, b));
            self.dirty = false;
        }
        &self.members
    }

    /// First member in comparator order.
    pub fn first(&mut self) -> Option<&ObjectRef> {
        self.elements().first()
    }

    /// True if the next read will re-sort.
    pub fn needs_sort(&self) -> bool {
        self.dirty
    }
}

impl fmt::Debug for SortedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedSubscription")
            .field("len", &self.members.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Subscription for SortedSubscription {
    fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn private_add(&mut self, object: &ObjectRef, visible: bool) {
        if self.ids.insert(object.id.clone()) {
            self.members.push(object.clone());
            self.dirty = true;
        }
        self.changed |= visible;
    }

    fn private_remove(&mut self, object: &ObjectRef, visible: bool) {
        if self.ids.remove(&object.id) {
            // Removal keeps relative order.
            self.members.retain(|o| o.id != object.id);
        }
        self.changed |= visible;
    }

    fn private_change(&mut self, object: &ObjectRef, _changes: &[ChangeReport], visible: bool) {
        if let Some(slot) = self.members.iter_mut().find(|o| o.id == object.id) {
            *slot = object.clone();
            self.dirty = true;
        }
        self.changed |= visible;
    }

    fn reset_changes(&mut self) {
        self.changed = false;
    }

    fn has_changed(&self) -> bool {
        self.changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::BlackboardObject;
    use crate::envelope::Envelope;

    fn prio(seq: u64, p: i64) -> ObjectRef {
        BlackboardObject::new(ObjectId::new("a", seq), "task", serde_json::json!({"p": p}))
            .into_ref()
    }

    fn by_priority(a: &ObjectRef, b: &ObjectRef) -> Ordering {
        let pa = a.field("p").and_then(|v| v.as_i64()).unwrap_or(0);
        let pb = b.field("p").and_then(|v| v.as_i64()).unwrap_or(0);
        pa.cmp(&pb)
    }

    fn order(sub: &mut SortedSubscription) -> Vec<u64> {
        sub.elements().iter().map(|o| o.id.sequence).collect()
    }

    #[test]
    fn test_sorts_lazily_on_read() {
        let mut sub = SortedSubscription::new(Predicate::all(), by_priority);
        let mut env = Envelope::new();
        env.add_object(prio(1, 30));
        env.add_object(prio(2, 10));
        env.add_object(prio(3, 20));
        env.apply_to_subscription(&mut sub);

        assert!(sub.needs_sort());
        assert_eq!(order(&mut sub), vec![2, 3, 1]);
        assert!(!sub.needs_sort());
    }

    #[test]
    fn test_change_reorders() {
        let mut sub = SortedSubscription::new(Predicate::all(), by_priority);
        let mut env = Envelope::new();
        env.add_object(prio(1, 1));
        env.add_object(prio(2, 2));
        env.apply_to_subscription(&mut sub);
        assert_eq!(order(&mut sub), vec![1, 2]);

        let mut env = Envelope::new();
        env.change_object(prio(1, 5), vec![]);
        env.remove_object(prio(9, 0));
        env.apply_to_subscription(&mut sub);
        assert_eq!(order(&mut sub), vec![2, 1]);
        assert_eq!(sub.first().map(|o| o.id.sequence), Some(2));
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut sub = SortedSubscription::new(Predicate::all(), by_priority);
        for (seq, p) in [(1, 3), (2, 1), (3, 2)] {
            sub.conditional_add(&prio(seq, p), true);
        }
        assert_eq!(order(&mut sub), vec![2, 3, 1]);
        sub.conditional_remove(&prio(3, 2), true);
        assert!(!sub.needs_sort());
        assert_eq!(order(&mut sub), vec![2, 1]);
        assert!(!sub.contains(&ObjectId::new("a", 3)));
    }
}
