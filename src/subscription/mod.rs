//! Subscriptions: predicate-filtered views over the blackboard.
//!
//! A subscription is created by a client inside
//! [`Subscriber::subscribe`](crate::subscriber::Subscriber::subscribe), filled
//! once at creation, and afterwards mutated only when its subscriber applies
//! inbox envelopes at transaction open.
//!
//! Three flavours are provided:
//!
//! - [`CollectionSubscription`]: membership snapshot only.
//! - [`IncrementalSubscription`]: also tracks added / removed / changed
//!   objects for the current transaction.
//! - [`SortedSubscription`]: membership kept in comparator order. Sorting is
//!   lazy: inserts only mark the view unsorted and
//!   [`elements`](SortedSubscription::elements) re-sorts on read. Reads after
//!   a burst of inserts pay for the sort; inserts stay O(1).
//!
//! Invariant for all of them: a subscription contains only objects that
//! satisfied its predicate when last offered (on every change, for dynamic
//! predicates).

pub mod collection;
pub mod incremental;
pub mod predicate;
pub mod sorted;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

pub use collection::CollectionSubscription;
pub use incremental::IncrementalSubscription;
pub use predicate::Predicate;
pub use sorted::SortedSubscription;

use crate::blackboard::{ObjectId, ObjectRef};
use crate::envelope::ChangeReport;

// ---------------------------------------------------------------------------
// Subscription trait
// ---------------------------------------------------------------------------

/// Container behaviour shared by all subscription flavours.
///
/// Implementors provide the `private_*` primitives; the `conditional_*`
/// operations decide, from the predicate and current membership, which
/// primitive an envelope tuple turns into.
pub trait Subscription: Send {
    /// The membership predicate.
    fn predicate(&self) -> &Predicate;

    /// Whether an object is currently a member.
    fn contains(&self, id: &ObjectId) -> bool;

    /// Number of members.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a member.
    fn private_add(&mut self, object: &ObjectRef, visible: bool);

    /// Remove a member.
    fn private_remove(&mut self, object: &ObjectRef, visible: bool);

    /// Replace a member with its new version.
    fn private_change(&mut self, object: &ObjectRef, changes: &[ChangeReport], visible: bool);

    /// Observe a transient event. Containers do not store events.
    fn private_event(&mut self, _object: &ObjectRef, _visible: bool) {}

    /// Clear per-transaction delta tracking.
    fn reset_changes(&mut self);

    /// True if a visible mutation happened since the last reset.
    fn has_changed(&self) -> bool;

    /// Add `object` if it is a member and not yet present.
    fn conditional_add(&mut self, object: &ObjectRef, visible: bool) -> bool {
        if self.contains(&object.id) || !self.predicate().is_member(object) {
            return false;
        }
        self.private_add(object, visible);
        true
    }

    /// Remove `object` if present.
    fn conditional_remove(&mut self, object: &ObjectRef, visible: bool) -> bool {
        if !self.contains(&object.id) {
            return false;
        }
        self.private_remove(object, visible);
        true
    }

    /// Route a change to add, change or remove according to membership.
    fn conditional_change(
        &mut self,
        object: &ObjectRef,
        changes: &[ChangeReport],
        visible: bool,
    ) -> bool {
        let present = self.contains(&object.id);
        if present && !self.predicate().is_dynamic() {
            self.private_change(object, changes, visible);
            return true;
        }
        match (present, self.predicate().is_member(object)) {
            (true, true) => self.private_change(object, changes, visible),
            (true, false) => self.private_remove(object, visible),
            (false, true) => self.private_add(object, visible),
            (false, false) => return false,
        }
        true
    }

    /// Deliver an event if it matches.
    fn conditional_event(&mut self, object: &ObjectRef, visible: bool) -> bool {
        if !self.predicate().is_member(object) {
            return false;
        }
        self.private_event(object, visible);
        visible
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Process-unique subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

static SUBSCRIPTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(SUBSCRIPTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Type-erased subscription as held by its subscriber.
pub type SharedSubscription = Arc<Mutex<dyn Subscription>>;

/// Client-side handle to a subscription.
///
/// Reads should happen inside a transaction owned by the reading thread;
/// that is when the subscription's contents are stable.
pub struct SubscriptionHandle<S> {
    id: SubscriptionId,
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SubscriptionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Subscription + 'static> SubscriptionHandle<S> {
    pub(crate) fn new(subscription: S) -> Self {
        Self {
            id: SubscriptionId::next(),
            inner: Arc::new(Mutex::new(subscription)),
        }
    }

    pub(crate) fn shared(&self) -> SharedSubscription {
        self.inner.clone()
    }
}

impl<S> SubscriptionHandle<S> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Lock the subscription for reading.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::BlackboardObject;
    use crate::envelope::Envelope;

    fn task(seq: u64, state: &str) -> ObjectRef {
        BlackboardObject::new(
            ObjectId::new("a", seq),
            "task",
            serde_json::json!({"state": state}),
        )
        .into_ref()
    }

    #[test]
    fn test_bulk_replay_is_idempotent() {
        let mut env = Envelope::new();
        env.bulk_add(vec![task(1, "new"), task(2, "new"), task(3, "new")]);

        let mut once = CollectionSubscription::new(Predicate::of_kind("task"));
        env.apply_to_subscription(&mut once);

        let mut twice = CollectionSubscription::new(Predicate::of_kind("task"));
        assert!(env.apply_to_subscription(&mut twice));
        assert!(!env.apply_to_subscription(&mut twice));

        assert_eq!(once.len(), 3);
        assert_eq!(twice.len(), once.len());
        let ids: Vec<_> = twice.elements().iter().map(|o| o.id.clone()).collect();
        let expected: Vec<_> = once.elements().iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_dynamic_predicate_moves_objects_out_on_change() {
        let pred = Predicate::dynamic(|o| o.field("state").and_then(|v| v.as_str()) == Some("open"));
        let mut sub = IncrementalSubscription::new(pred);

        let mut env = Envelope::new();
        env.add_object(task(1, "open"));
        env.apply_to_subscription(&mut sub);
        assert!(sub.contains(&ObjectId::new("a", 1)));
        sub.reset_changes();

        let mut env = Envelope::new();
        env.change_object(task(1, "closed"), vec![ChangeReport::field("state")]);
        assert!(env.apply_to_subscription(&mut sub));
        assert!(!sub.contains(&ObjectId::new("a", 1)));
        assert_eq!(sub.removed_list().len(), 1);
    }

    #[test]
    fn test_static_predicate_keeps_member_on_change() {
        let pred = Predicate::new(|o| o.field("state").and_then(|v| v.as_str()) == Some("open"));
        let mut sub = CollectionSubscription::new(pred);

        let mut env = Envelope::new();
        env.add_object(task(1, "open"));
        env.change_object(task(1, "closed"), vec![]);
        env.apply_to_subscription(&mut sub);

        assert!(sub.contains(&ObjectId::new("a", 1)));
        let current = sub.get(&ObjectId::new("a", 1)).unwrap();
        assert_eq!(current.field("state").unwrap(), "closed");
    }

    #[test]
    fn test_change_of_nonmember_becomes_add() {
        let mut sub = IncrementalSubscription::new(Predicate::of_kind("task"));
        let mut env = Envelope::new();
        env.change_object(task(4, "open"), vec![]);
        env.apply_to_subscription(&mut sub);
        assert_eq!(sub.added_list().len(), 1);
        assert!(sub.changed_list().is_empty());
    }

    #[test]
    fn test_persistence_envelope_refills_silently() {
        let mut sub = IncrementalSubscription::new(Predicate::all());
        let mut env = Envelope::persistence();
        env.bulk_add(vec![task(1, "open"), task(2, "open")]);

        assert!(!env.apply_to_subscription(&mut sub));
        assert_eq!(sub.len(), 2);
        assert!(!sub.has_changed());
        assert!(sub.added_list().is_empty());
    }

    #[test]
    fn test_handle_ids_are_unique() {
        let a = SubscriptionHandle::new(CollectionSubscription::new(Predicate::all()));
        let b = SubscriptionHandle::new(CollectionSubscription::new(Predicate::all()));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert!(a.lock().is_empty());
    }
}
