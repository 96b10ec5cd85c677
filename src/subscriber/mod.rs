//! Subscribers: per-client transaction contexts.
//!
//! # State machine
//!
//! A subscriber is either idle or has a transaction open:
//!
//! 1. [`open_transaction`](Subscriber::open_transaction) takes the
//!    re-entrant [`TransactionLock`], waits at the distributor's admission
//!    gate while a checkpoint is pending, then applies every envelope from
//!    the inbox to every subscription.
//! 2. While open, the owning thread reads its subscriptions and publishes
//!    adds, changes, removes and events into the outbox.
//! 3. The outermost [`close_transaction`](Subscriber::close_transaction)
//!    resets delta tracking, files the outbox in the subscriber's own inbox
//!    (so it sees its own deltas next time), hands it to the distributor and
//!    releases the lock.
//!
//! # Buffers
//!
//! The [`Inbox`] holds two envelope buffers: pending (appended to by the
//! distributor) and in flight (being applied by the open transaction).
//! Opening a transaction moves pending to in flight; closing clears it.
//! Both are visible to checkpoints, so a checkpoint taken inside a
//! transaction still records what it had not finished with. The outbox is
//! a separate [`Envelope`].
//!
//! # Publish checks
//!
//! Publishing outside a transaction owned by the calling thread, adding an
//! object twice, changing or removing an unpublished object, and touching an
//! object claimed by another subscriber are all *reported*: logged with the
//! offending stack and returned in the [`PublishOutcome`], but the operation
//! still completes. Only a veto hook can stop a publish.

pub mod inbox;
pub mod policy;
pub mod transaction;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

pub use inbox::Inbox;
pub use policy::{PublishOutcome, PublishRecord, PublishVeto};
pub use transaction::{Transaction, TransactionLock};

use crate::blackboard::{ObjectId, ObjectRef, PublishPolicy};
use crate::distributor::Distributor;
use crate::envelope::{ChangeReport, Envelope};
use crate::errors::{PersistenceError, PublishError, PublishViolation, TransactionError};
use crate::persistence::Checkpoint;
use crate::subscription::{SharedSubscription, Subscription, SubscriptionHandle, SubscriptionId};

/// Distributor-assigned subscriber id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

struct SubscriberState {
    subscriptions: Vec<(SubscriptionId, SharedSubscription)>,
    outbox: Envelope,
    changed: bool,
    vetoes: HashMap<String, Vec<Arc<dyn PublishVeto>>>,
}

impl SubscriberState {
    fn vetoed(&self, kind: &str, allows: impl Fn(&dyn PublishVeto) -> bool) -> bool {
        self.vetoes
            .get(kind)
            .is_some_and(|hooks| hooks.iter().any(|hook| !allows(hook.as_ref())))
    }
}

/// One client of the blackboard.
///
/// Dropping a subscriber deregisters it; the distributor stops delivering
/// to it.
pub struct Subscriber {
    id: SubscriberId,
    name: String,
    distributor: Arc<Distributor>,
    inbox: Arc<Inbox>,
    lock: TransactionLock,
    state: Mutex<SubscriberState>,
    privileged: AtomicBool,
}

impl Subscriber {
    /// Register a new subscriber. If the distributor was rehydrated and had
    /// pending envelopes for `name`, they are waiting in the inbox.
    pub fn new(distributor: &Arc<Distributor>, name: impl Into<String>) -> Self {
        let name = name.into();
        let (id, inbox) = distributor.register_subscriber(&name);
        Self {
            id,
            lock: TransactionLock::new(name.clone()),
            name,
            distributor: Arc::clone(distributor),
            inbox,
            state: Mutex::new(SubscriberState {
                subscriptions: Vec::new(),
                outbox: Envelope::new(),
                changed: false,
                vetoes: HashMap::new(),
            }),
            privileged: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    /// A privileged subscriber may change or remove objects claimed by
    /// others without a violation.
    pub fn set_privileged(&self, privileged: bool) {
        self.privileged.store(privileged, Ordering::Relaxed);
    }

    /// Register a veto hook for active objects of `kind`.
    pub fn add_veto(&self, kind: impl Into<String>, veto: Arc<dyn PublishVeto>) {
        self.state
            .lock()
            .vetoes
            .entry(kind.into())
            .or_default()
            .push(veto);
    }

    /// Mint an object id owned by this agent.
    pub fn next_object_id(&self) -> ObjectId {
        self.distributor.next_object_id()
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a subscription and fill it from the blackboard.
    ///
    /// The fill reflects the blackboard *before* the envelopes still in the
    /// inbox, which the next open transaction applies as usual, so every
    /// delta is seen exactly once.
    pub fn subscribe<S: Subscription + 'static>(&self, mut subscription: S) -> SubscriptionHandle<S> {
        let mut state = self.state.lock();
        self.distributor.fill_subscription(&self.inbox, &mut subscription);
        let handle = SubscriptionHandle::new(subscription);
        state.subscriptions.push((handle.id(), handle.shared()));
        log::debug!(
            "Subscriber '{}': subscription {:?} registered",
            self.name,
            handle.id()
        );
        handle
    }

    /// Drop a subscription; returns false if it was not registered here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|(sid, _)| *sid != id);
        state.subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Open (or re-enter) a transaction on the calling thread; returns the
    /// nesting depth.
    pub fn open_transaction(&self) -> usize {
        let depth = self.lock.acquire();
        if depth > 1 {
            return depth;
        }
        self.distributor.start_transaction();

        let mut state = self.state.lock();
        let envelopes = self.inbox.begin_transaction();

        let mut changed = false;
        for (_, subscription) in &state.subscriptions {
            let mut subscription = subscription.lock();
            for envelope in &envelopes {
                changed |= envelope.apply_to_subscription(&mut *subscription);
            }
        }
        state.changed = changed;
        depth
    }

    /// Scoped transaction, closed on drop.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::begin(self)
    }

    /// Close one level of the calling thread's transaction.
    ///
    /// Fails if the calling thread does not own an open transaction.
    pub fn close_transaction(&self) -> Result<(), TransactionError> {
        if self.lock.depth()? > 1 {
            self.lock.release()?;
            return Ok(());
        }

        let outbox = {
            let mut state = self.state.lock();
            for (_, subscription) in &state.subscriptions {
                subscription.lock().reset_changes();
            }
            self.inbox.end_transaction();
            state.changed = false;
            Arc::new(state.outbox.take())
        };
        if !outbox.is_empty() {
            self.inbox.push(Arc::clone(&outbox));
        }
        self.distributor.finish_transaction(self.id, outbox);
        self.lock.release()?;
        Ok(())
    }

    pub fn is_transaction_open(&self) -> bool {
        self.lock.owner().is_some()
    }

    /// True if applying the inbox at open visibly changed any subscription.
    pub fn was_changed(&self) -> bool {
        self.state.lock().changed
    }

    /// Envelopes waiting for the next transaction.
    pub fn pending_envelopes(&self) -> usize {
        self.inbox.len()
    }

    /// Block until the inbox is non-empty or `timeout` passes.
    pub fn wait_for_envelopes(&self, timeout: Duration) -> bool {
        self.inbox.wait(timeout)
    }

    /// Force a checkpoint, waiting for every other open transaction to
    /// close first.
    pub fn persist_now(&self) -> Result<Checkpoint, PersistenceError> {
        self.distributor.persist_now()
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    pub fn publish_add(&self, object: ObjectRef) -> PublishOutcome {
        let mut violation = self.check_transaction(&object.id);
        let mut state = self.state.lock();
        if object.policy == PublishPolicy::Active
            && state.vetoed(&object.kind, |hook| hook.adding(&object))
        {
            log::debug!("Subscriber '{}': add of {} vetoed", self.name, object.id);
            return PublishOutcome::Vetoed;
        }

        let publication = self.distributor.publication(&object.id);
        let already = (publication.published && !state.outbox.removes(&object.id))
            || state.outbox.adds(&object.id);
        if already && violation.is_none() {
            violation = Some(PublishError::AlreadyPublished(
                PublishViolation::capture(object.id.clone(), self.name.clone())
                    .with_previous_stack(publication.record.map(|r| r.stack)),
            ));
        }

        state.outbox.add_object(Arc::clone(&object));
        self.distributor.record_publisher(
            object.id.clone(),
            PublishRecord {
                subscriber: self.name.clone(),
                stack: std::backtrace::Backtrace::capture().to_string(),
                claimed: object.policy == PublishPolicy::Claimable,
            },
        );
        PublishOutcome::from_violation(violation)
    }

    pub fn publish_change(&self, object: ObjectRef, changes: Vec<ChangeReport>) -> PublishOutcome {
        let mut violation = self.check_transaction(&object.id);
        let mut state = self.state.lock();
        if object.policy == PublishPolicy::Active
            && state.vetoed(&object.kind, |hook| hook.changing(&object, &changes))
        {
            log::debug!("Subscriber '{}': change of {} vetoed", self.name, object.id);
            return PublishOutcome::Vetoed;
        }
        if violation.is_none() {
            violation = self.check_published(&state, &object);
        }
        state.outbox.change_object(object, changes);
        PublishOutcome::from_violation(violation)
    }

    pub fn publish_remove(&self, object: ObjectRef) -> PublishOutcome {
        let mut violation = self.check_transaction(&object.id);
        let mut state = self.state.lock();
        if object.policy == PublishPolicy::Active
            && state.vetoed(&object.kind, |hook| hook.removing(&object))
        {
            log::debug!("Subscriber '{}': remove of {} vetoed", self.name, object.id);
            return PublishOutcome::Vetoed;
        }
        if violation.is_none() {
            violation = self.check_published(&state, &object);
        }
        state.outbox.remove_object(object);
        PublishOutcome::from_violation(violation)
    }

    /// Publish a transient event. Events reach matching subscriptions and
    /// envelope providers but are never stored.
    pub fn publish_event(&self, object: ObjectRef) -> PublishOutcome {
        let violation = self.check_transaction(&object.id);
        self.state.lock().outbox.add_event(object);
        PublishOutcome::from_violation(violation)
    }

    fn check_transaction(&self, object: &ObjectId) -> Option<PublishError> {
        let violation = || PublishViolation::capture(object.clone(), self.name.clone());
        match self.lock.owner() {
            None => Some(PublishError::NoTransaction(violation())),
            Some(owner) if owner != thread::current().id() => {
                Some(PublishError::WrongThread(violation()))
            }
            Some(_) => None,
        }
    }

    /// Published-ness and claim checks for change and remove.
    fn check_published(&self, state: &SubscriberState, object: &ObjectRef) -> Option<PublishError> {
        let publication = self.distributor.publication(&object.id);
        if !publication.published && !state.outbox.adds(&object.id) {
            return Some(PublishError::NotPublished(PublishViolation::capture(
                object.id.clone(),
                self.name.clone(),
            )));
        }
        match publication.record {
            Some(record)
                if object.policy == PublishPolicy::Claimable
                    && record.claimed
                    && record.subscriber != self.name
                    && !self.privileged.load(Ordering::Relaxed) =>
            {
                Some(PublishError::ClaimConflict {
                    claimant: record.subscriber,
                    violation: PublishViolation::capture(object.id.clone(), self.name.clone())
                        .with_previous_stack(Some(record.stack)),
                })
            }
            _ => None,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(owner) = self.lock.owner() {
            log::warn!(
                "Subscriber '{}' dropped with an open transaction; discarding its outbox",
                self.name
            );
            self.distributor.abandon_transaction(owner);
            self.lock.force_release();
        }
        self.distributor.deregister_subscriber(self.id);
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &self.inbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::BlackboardObject;
    use crate::subscription::{CollectionSubscription, IncrementalSubscription, Predicate};

    fn distributor() -> Arc<Distributor> {
        Distributor::builder("a").build().unwrap()
    }

    fn task(sub: &Subscriber, n: i64) -> ObjectRef {
        BlackboardObject::new(sub.next_object_id(), "task", serde_json::json!({ "n": n })).into_ref()
    }

    #[test]
    fn test_other_subscriber_sees_add_next_transaction() {
        let dist = distributor();
        let producer = Subscriber::new(&dist, "producer");
        let consumer = Subscriber::new(&dist, "consumer");
        let tasks = consumer.subscribe(IncrementalSubscription::new(Predicate::of_kind("task")));

        let obj = task(&producer, 1);
        {
            let txn = producer.transaction();
            assert!(matches!(txn.publish_add(obj.clone()), PublishOutcome::Published));
        }
        assert_eq!(consumer.pending_envelopes(), 1);

        consumer.open_transaction();
        assert!(consumer.was_changed());
        assert_eq!(tasks.lock().added_list().len(), 1);
        consumer.close_transaction().unwrap();
        // Deltas reset at close.
        assert!(tasks.lock().added_list().is_empty());
        assert_eq!(tasks.lock().len(), 1);
    }

    #[test]
    fn test_own_outbox_is_self_delivered() {
        let dist = distributor();
        let sub = Subscriber::new(&dist, "self");
        let all = sub.subscribe(IncrementalSubscription::new(Predicate::all()));
        {
            let txn = sub.transaction();
            txn.publish_add(task(&sub, 1));
        }
        sub.open_transaction();
        assert_eq!(all.lock().added_list().len(), 1);
        sub.close_transaction().unwrap();
    }

    #[test]
    fn test_subscribe_fills_from_store_excluding_inbox() {
        let dist = distributor();
        let producer = Subscriber::new(&dist, "producer");
        let late = Subscriber::new(&dist, "late");
        let first = task(&producer, 1);
        {
            let txn = producer.transaction();
            txn.publish_add(first.clone());
        }
        // `late` has the add in its inbox; the fill must not include it yet.
        let view = late.subscribe(IncrementalSubscription::new(Predicate::all()));
        assert_eq!(view.lock().len(), 0);
        late.open_transaction();
        assert_eq!(view.lock().added_list().len(), 1);
        late.close_transaction().unwrap();

        // A subscription created afterwards is filled silently.
        let filled = late.subscribe(IncrementalSubscription::new(Predicate::all()));
        assert_eq!(filled.lock().len(), 1);
        assert!(filled.lock().added_list().is_empty());
    }

    #[test]
    fn test_publish_outside_transaction_is_reported_but_applied() {
        let dist = distributor();
        let sub = Subscriber::new(&dist, "sloppy");
        let outcome = sub.publish_add(task(&sub, 1));
        assert!(matches!(outcome.violation(), Some(PublishError::NoTransaction(_))));
        sub.open_transaction();
        sub.close_transaction().unwrap();
        assert_eq!(dist.object_count(), 1);
    }

    #[test]
    fn test_double_add_and_unpublished_change() {
        let dist = distributor();
        let sub = Subscriber::new(&dist, "s");
        let obj = task(&sub, 1);
        {
            let txn = sub.transaction();
            txn.publish_add(obj.clone());
            let again = txn.publish_add(obj.clone());
            assert!(matches!(again.violation(), Some(PublishError::AlreadyPublished(_))));
            let stray = task(&sub, 2);
            let change = txn.publish_change(stray, vec![]);
            assert!(matches!(change.violation(), Some(PublishError::NotPublished(_))));
        }
        let txn = sub.transaction();
        let outcome = txn.publish_add(obj);
        assert!(matches!(outcome.violation(), Some(PublishError::AlreadyPublished(_))));
    }

    #[test]
    fn test_close_from_wrong_thread_fails() {
        let dist = distributor();
        let sub = Arc::new(Subscriber::new(&dist, "s"));
        sub.open_transaction();
        let other = Arc::clone(&sub);
        let result = thread::spawn(move || other.close_transaction()).join().unwrap();
        assert!(matches!(result, Err(TransactionError::NotOwner { .. })));
        sub.close_transaction().unwrap();
        assert!(matches!(
            sub.close_transaction(),
            Err(TransactionError::NotOpen { .. })
        ));
    }

    #[test]
    fn test_nested_transactions_flush_once() {
        let dist = distributor();
        let sub = Subscriber::new(&dist, "s");
        let watcher = Subscriber::new(&dist, "w");
        assert_eq!(sub.open_transaction(), 1);
        assert_eq!(sub.open_transaction(), 2);
        sub.publish_add(task(&sub, 1));
        sub.close_transaction().unwrap();
        assert_eq!(watcher.pending_envelopes(), 0);
        sub.close_transaction().unwrap();
        assert_eq!(watcher.pending_envelopes(), 1);
    }

    struct NoRemovals;

    impl PublishVeto for NoRemovals {
        fn removing(&self, _object: &crate::blackboard::BlackboardObject) -> bool {
            false
        }
    }

    #[test]
    fn test_veto_cancels_active_publish() {
        let dist = distributor();
        let sub = Subscriber::new(&dist, "s");
        sub.add_veto("task", Arc::new(NoRemovals));
        let obj = BlackboardObject::new(sub.next_object_id(), "task", serde_json::Value::Null)
            .with_policy(PublishPolicy::Active)
            .into_ref();
        {
            let txn = sub.transaction();
            assert!(txn.publish_add(obj.clone()).is_published());
        }
        {
            let txn = sub.transaction();
            assert!(matches!(txn.publish_remove(obj), PublishOutcome::Vetoed));
        }
        assert_eq!(dist.object_count(), 1);
    }

    #[test]
    fn test_claim_conflict_reported_unless_privileged() {
        let dist = distributor();
        let owner = Subscriber::new(&dist, "owner");
        let intruder = Subscriber::new(&dist, "intruder");
        let obj = BlackboardObject::new(owner.next_object_id(), "asset", serde_json::json!({"v": 1}))
            .with_policy(PublishPolicy::Claimable)
            .into_ref();
        {
            let txn = owner.transaction();
            txn.publish_add(obj.clone());
        }

        let next = obj.with_payload(serde_json::json!({"v": 2})).into_ref();
        {
            let txn = intruder.transaction();
            let outcome = txn.publish_change(next.clone(), vec![ChangeReport::field("v")]);
            match outcome.violation() {
                Some(PublishError::ClaimConflict { claimant, .. }) => assert_eq!(claimant, "owner"),
                other => panic!("expected claim conflict, got {:?}", other),
            }
        }

        intruder.set_privileged(true);
        let txn = intruder.transaction();
        assert!(txn.publish_change(next, vec![]).violation().is_none());
    }

    #[test]
    fn test_unsubscribe_stops_updates() {
        let dist = distributor();
        let sub = Subscriber::new(&dist, "s");
        let handle = sub.subscribe(CollectionSubscription::new(Predicate::all()));
        assert!(sub.unsubscribe(handle.id()));
        assert!(!sub.unsubscribe(handle.id()));
        {
            let txn = sub.transaction();
            txn.publish_add(task(&sub, 1));
        }
        sub.open_transaction();
        sub.close_transaction().unwrap();
        assert!(handle.lock().is_empty());
    }

    #[test]
    fn test_dropped_subscriber_is_deregistered() {
        let dist = distributor();
        let sub = Subscriber::new(&dist, "gone");
        assert_eq!(dist.subscriber_count(), 1);
        sub.open_transaction();
        drop(sub);
        assert_eq!(dist.subscriber_count(), 0);
        assert_eq!(dist.open_transactions(), 0);
    }
}
