//! Envelopes: ordered, write-once batches of blackboard deltas.
//!
//! An envelope is the unit of transactional communication: a subscriber's
//! outbox becomes one envelope at transaction close, the distributor applies
//! it to the store, and every other subscriber receives it in its inbox.
//!
//! Envelopes are built by one thread and then only read; they are shared as
//! `Arc<Envelope>` once handed to the distributor. They serialize with serde
//! because they are part of every checkpoint.
//!
//! A *persistence* envelope is invisible: applying it refills containers
//! silently and never reports a visible change, so rehydration does not wake
//! subscribers.

pub mod change_report;
pub mod tuple;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use change_report::ChangeReport;
pub use tuple::{EnvelopeAction, EnvelopeTuple};

use crate::blackboard::{ObjectId, ObjectRef};
use crate::subscription::Subscription;

/// An ordered sequence of [`EnvelopeTuple`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    tuples: Vec<EnvelopeTuple>,
    visible: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    /// Create an empty, visible envelope.
    pub fn new() -> Self {
        Self {
            tuples: Vec::new(),
            visible: true,
        }
    }

    /// Create an empty persistence (invisible) envelope.
    pub fn persistence() -> Self {
        Self {
            tuples: Vec::new(),
            visible: false,
        }
    }

    /// False for persistence envelopes.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    /// The tuples in publication order.
    pub fn tuples(&self) -> &[EnvelopeTuple] {
        &self.tuples
    }

    // --- Building ---

    fn push(&mut self, tuple: EnvelopeTuple) -> &EnvelopeTuple {
        self.tuples.push(tuple);
        // just pushed, never empty
        &self.tuples[self.tuples.len() - 1]
    }

    /// Append an `Add` tuple.
    pub fn add_object(&mut self, object: ObjectRef) -> &EnvelopeTuple {
        self.push(EnvelopeTuple::Add(object))
    }

    /// Append a `Remove` tuple.
    pub fn remove_object(&mut self, object: ObjectRef) -> &EnvelopeTuple {
        self.push(EnvelopeTuple::Remove(object))
    }

    /// Append a `Change` tuple.
    pub fn change_object(&mut self, object: ObjectRef, changes: Vec<ChangeReport>) -> &EnvelopeTuple {
        self.push(EnvelopeTuple::Change { object, changes })
    }

    /// Append a `Bulk` tuple carrying pre-existing objects.
    pub fn bulk_add(&mut self, objects: Vec<ObjectRef>) -> &EnvelopeTuple {
        self.push(EnvelopeTuple::Bulk(objects))
    }

    /// Append an `Event` tuple.
    pub fn add_event(&mut self, object: ObjectRef) -> &EnvelopeTuple {
        self.push(EnvelopeTuple::Event(object))
    }

    /// Move all tuples of `other` to the end of this envelope.
    pub fn append(&mut self, other: Envelope) {
        self.tuples.extend(other.tuples);
    }

    /// Take the tuples out, leaving an empty envelope with the same visibility.
    pub fn take(&mut self) -> Envelope {
        Envelope {
            tuples: std::mem::take(&mut self.tuples),
            visible: self.visible,
        }
    }

    // --- Queries ---

    /// True if an `Add` or `Bulk` tuple for `id` is present.
    pub fn adds(&self, id: &ObjectId) -> bool {
        self.tuples.iter().any(|t| match t {
            EnvelopeTuple::Add(o) => &o.id == id,
            EnvelopeTuple::Bulk(objects) => objects.iter().any(|o| &o.id == id),
            _ => false,
        })
    }

    /// True if a `Remove` tuple for `id` is present.
    pub fn removes(&self, id: &ObjectId) -> bool {
        self.tuples
            .iter()
            .any(|t| matches!(t, EnvelopeTuple::Remove(o) if &o.id == id))
    }

    // --- Application ---

    /// Replay every tuple against one subscription.
    ///
    /// Returns whether anything *visibly* changed; always false for a
    /// persistence envelope.
    pub fn apply_to_subscription<S>(&self, subscription: &mut S) -> bool
    where
        S: Subscription + ?Sized,
    {
        let mut changed = false;
        for tuple in &self.tuples {
            changed |= tuple.apply_to(subscription, self.visible);
        }
        changed && self.visible
    }

    /// Undo this envelope's membership effects on a snapshot map.
    ///
    /// Used to reconstruct what a subscriber had seen before the envelopes
    /// still sitting in its inbox.
    pub fn unapply_from(&self, snapshot: &mut BTreeMap<ObjectId, ObjectRef>) {
        for tuple in self.tuples.iter().rev() {
            match tuple {
                EnvelopeTuple::Add(o) => {
                    snapshot.remove(&o.id);
                }
                EnvelopeTuple::Bulk(objects) => {
                    for o in objects {
                        snapshot.remove(&o.id);
                    }
                }
                EnvelopeTuple::Remove(o) => {
                    snapshot.insert(o.id.clone(), o.clone());
                }
                EnvelopeTuple::Change { .. } | EnvelopeTuple::Event(_) => {}
            }
        }
    }
}
