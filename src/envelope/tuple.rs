//! Envelope tuples: one delta each.

use serde::{Deserialize, Serialize};

use super::change_report::ChangeReport;
use crate::blackboard::ObjectRef;
use crate::subscription::Subscription;

/// The kind of delta a tuple carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeAction {
    Add,
    Remove,
    Change,
    Bulk,
    Event,
}

/// A single delta inside an [`Envelope`](super::Envelope).
///
/// Every variant owns its object handle(s), so a tuple can never refer to a
/// missing object.
///
/// `Bulk` is *not* a batch of `Add`s from a logic provider's point of view:
/// it carries pre-existing state (initial fill, rehydration) and providers
/// reacting to newly created state must skip it. See [`is_bulk`](Self::is_bulk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnvelopeTuple {
    Add(ObjectRef),
    Remove(ObjectRef),
    Change {
        object: ObjectRef,
        changes: Vec<ChangeReport>,
    },
    Bulk(Vec<ObjectRef>),
    Event(ObjectRef),
}

impl EnvelopeTuple {
    /// The action tag.
    pub fn action(&self) -> EnvelopeAction {
        match self {
            Self::Add(_) => EnvelopeAction::Add,
            Self::Remove(_) => EnvelopeAction::Remove,
            Self::Change { .. } => EnvelopeAction::Change,
            Self::Bulk(_) => EnvelopeAction::Bulk,
            Self::Event(_) => EnvelopeAction::Event,
        }
    }

    /// True for bulk (pre-existing state) tuples.
    pub fn is_bulk(&self) -> bool {
        matches!(self, Self::Bulk(_))
    }

    /// The single object of a non-bulk tuple.
    pub fn object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Add(o) | Self::Remove(o) | Self::Event(o) => Some(o),
            Self::Change { object, .. } => Some(object),
            Self::Bulk(_) => None,
        }
    }

    /// All objects carried by this tuple.
    pub fn objects(&self) -> &[ObjectRef] {
        match self {
            Self::Add(o) | Self::Remove(o) | Self::Event(o) => std::slice::from_ref(o),
            Self::Change { object, .. } => std::slice::from_ref(object),
            Self::Bulk(objects) => objects,
        }
    }

    /// Change reports (empty for everything but `Change`).
    pub fn change_reports(&self) -> &[ChangeReport] {
        match self {
            Self::Change { changes, .. } => changes,
            _ => &[],
        }
    }

    /// Replay this tuple against one subscription.
    ///
    /// Returns true if the subscription's contents changed.
    pub fn apply_to<S>(&self, subscription: &mut S, visible: bool) -> bool
    where
        S: Subscription + ?Sized,
    {
        match self {
            Self::Add(o) => subscription.conditional_add(o, visible),
            Self::Remove(o) => subscription.conditional_remove(o, visible),
            Self::Change { object, changes } => {
                subscription.conditional_change(object, changes, visible)
            }
            Self::Bulk(objects) => {
                let mut changed = false;
                for o in objects {
                    changed |= subscription.conditional_add(o, visible);
                }
                changed
            }
            Self::Event(o) => subscription.conditional_event(o, visible),
        }
    }
}
