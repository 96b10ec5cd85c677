//! The view a logic provider gets of its agent during distribution.

use std::collections::HashSet;
use std::fmt;

use crate::blackboard::{Blackboard, ObjectId, ObjectIdGenerator, ObjectRef};
use crate::envelope::{ChangeReport, Envelope};
use crate::message::{Directive, PeerId};
use crate::subscription::Predicate;

/// Deferred provider work, run once the current distribution round drains.
pub type DelayedAction = Box<dyn FnOnce(&mut LogicContext<'_>) -> anyhow::Result<()> + Send>;

/// Read-only store access plus sinks for cascading deltas and outgoing
/// directives.
///
/// Deltas published here are not visible in [`get`](Self::get) or
/// [`query`](Self::query) until the distributor applies them in its next
/// round.
pub struct LogicContext<'a> {
    agent: &'a PeerId,
    store: &'a Blackboard,
    ids: &'a ObjectIdGenerator,
    now: i64,
    cascade: Envelope,
    directives: Vec<Directive>,
    delayed: Vec<(String, DelayedAction)>,
}

impl<'a> LogicContext<'a> {
    pub(crate) fn new(
        agent: &'a PeerId,
        store: &'a Blackboard,
        ids: &'a ObjectIdGenerator,
        now: i64,
    ) -> Self {
        Self {
            agent,
            store,
            ids,
            now,
            cascade: Envelope::new(),
            directives: Vec::new(),
            delayed: Vec::new(),
        }
    }

    /// The agent this context belongs to.
    pub fn agent(&self) -> &PeerId {
        self.agent
    }

    /// Execution time at the start of this distribution.
    pub fn now(&self) -> i64 {
        self.now
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ObjectRef> {
        self.store.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.store.contains(id)
    }

    pub fn query(&self, predicate: &Predicate) -> Vec<ObjectRef> {
        self.store.query(predicate)
    }

    /// Mint an id owned by this agent.
    pub fn next_object_id(&self) -> ObjectId {
        self.ids.next_id()
    }

    pub fn publish_add(&mut self, object: ObjectRef) {
        self.cascade.add_object(object);
    }

    pub fn publish_remove(&mut self, object: ObjectRef) {
        self.cascade.remove_object(object);
    }

    pub fn publish_change(&mut self, object: ObjectRef, changes: Vec<ChangeReport>) {
        self.cascade.change_object(object, changes);
    }

    pub fn publish_event(&mut self, object: ObjectRef) {
        self.cascade.add_event(object);
    }

    /// Queue a directive for another agent.
    pub fn send_directive(&mut self, directive: Directive) {
        self.directives.push(directive);
    }

    /// Defer `action` until the current round drains. A second action with
    /// a key that is already queued is dropped.
    pub fn delay(
        &mut self,
        key: impl Into<String>,
        action: impl FnOnce(&mut LogicContext<'_>) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.delayed.push((key.into(), Box::new(action)));
    }

    pub(crate) fn into_output(self) -> LogicOutput {
        LogicOutput {
            cascade: self.cascade,
            directives: self.directives,
            delayed: self.delayed,
        }
    }
}

impl fmt::Debug for LogicContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicContext")
            .field("agent", &self.agent)
            .field("now", &self.now)
            .field("cascade", &self.cascade.len())
            .field("directives", &self.directives.len())
            .field("delayed", &self.delayed.len())
            .finish()
    }
}

/// What providers produced through one [`LogicContext`].
pub(crate) struct LogicOutput {
    pub cascade: Envelope,
    pub directives: Vec<Directive>,
    pub delayed: Vec<(String, DelayedAction)>,
}

/// Delayed actions of one distribution, deduplicated by key.
#[derive(Default)]
pub(crate) struct DelayedQueue {
    keys: HashSet<String>,
    actions: Vec<(String, DelayedAction)>,
}

impl DelayedQueue {
    pub fn extend(&mut self, actions: Vec<(String, DelayedAction)>) {
        for (key, action) in actions {
            if self.keys.insert(key.clone()) {
                self.actions.push((key, action));
            } else {
                log::debug!("Delayed action '{}' already queued", key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Take everything queued. Keys become available again.
    pub fn drain(&mut self) -> Vec<(String, DelayedAction)> {
        self.keys.clear();
        std::mem::take(&mut self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::BlackboardObject;

    #[test]
    fn test_context_collects_output() {
        let agent = PeerId::new("a");
        let store = Blackboard::new();
        let ids = ObjectIdGenerator::new("a");
        let mut ctx = LogicContext::new(&agent, &store, &ids, 42);

        let id = ctx.next_object_id();
        let obj = BlackboardObject::new(id.clone(), "task", serde_json::Value::Null).into_ref();
        ctx.publish_add(obj.clone());
        ctx.publish_event(obj);
        ctx.send_directive(Directive::new("a", "b", "task", serde_json::Value::Null));
        ctx.delay("k", |_| Ok(()));
        // Not applied yet.
        assert!(!ctx.contains(&id));
        assert_eq!(ctx.now(), 42);

        let out = ctx.into_output();
        assert_eq!(out.cascade.len(), 2);
        assert_eq!(out.directives.len(), 1);
        assert_eq!(out.delayed.len(), 1);
    }

    #[test]
    fn test_delayed_queue_dedups_by_key() {
        let mut queue = DelayedQueue::default();
        let noop = || -> DelayedAction { Box::new(|_: &mut LogicContext<'_>| Ok(())) };
        queue.extend(vec![("x".into(), noop()), ("x".into(), noop()), ("y".into(), noop())]);
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
        queue.extend(vec![("x".into(), noop())]);
        assert!(!queue.is_empty());
    }
}
