//! Blackboard objects: the unit of state carried by envelopes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Globally unique object identifier: the owning agent plus a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// Agent that minted the id.
    pub owner: String,
    /// Per-owner sequence number.
    pub sequence: u64,
}

impl ObjectId {
    /// Create an id from its parts.
    pub fn new(owner: impl Into<String>, sequence: u64) -> Self {
        Self {
            owner: owner.into(),
            sequence,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.sequence)
    }
}

/// Mints [`ObjectId`]s for one agent.
#[derive(Debug)]
pub struct ObjectIdGenerator {
    owner: String,
    next: AtomicU64,
}

impl ObjectIdGenerator {
    /// Start a generator at sequence 1.
    pub fn new(owner: impl Into<String>) -> Self {
        Self::starting_at(owner, 1)
    }

    /// Start a generator at an explicit sequence (after rehydration).
    pub fn starting_at(owner: impl Into<String>, next: u64) -> Self {
        Self {
            owner: owner.into(),
            next: AtomicU64::new(next),
        }
    }

    /// Mint the next id.
    pub fn next_id(&self) -> ObjectId {
        ObjectId::new(self.owner.clone(), self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Never mint `sequence` or anything below it.
    pub fn skip_past(&self, sequence: u64) {
        self.next.fetch_max(sequence + 1, Ordering::Relaxed);
    }
}

/// How a publish of this object is policed.
///
/// Resolved once per publish call by the subscriber, instead of probing the
/// object for capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PublishPolicy {
    /// No hooks; every publish goes through.
    #[default]
    Passive,
    /// The subscriber's [`PublishVeto`](crate::subscriber::PublishVeto)
    /// hooks for this object's kind may cancel the publish.
    Active,
    /// The first subscriber to publish the object claims it; other,
    /// non-privileged subscribers changing or removing it are reported.
    Claimable,
}

/// A single blackboard object.
///
/// Objects are immutable once shared: a change publishes a new version
/// carrying the same [`ObjectId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardObject {
    /// Identity of the object across versions.
    pub id: ObjectId,
    /// Domain type tag (e.g. "task", "allocation").
    pub kind: String,
    /// Domain payload.
    pub payload: Value,
    /// Publish policing.
    #[serde(default)]
    pub policy: PublishPolicy,
}

/// Shared handle to an object version.
pub type ObjectRef = Arc<BlackboardObject>;

impl BlackboardObject {
    /// Create a passive object.
    pub fn new(id: ObjectId, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
            policy: PublishPolicy::Passive,
        }
    }

    /// Set the publish policy (builder pattern).
    pub fn with_policy(mut self, policy: PublishPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Produce the next version of this object with a new payload.
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind.clone(),
            payload,
            policy: self.policy,
        }
    }

    /// Look up a top-level payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> ObjectRef {
        Arc::new(self)
    }
}
