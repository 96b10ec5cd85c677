//! Membership predicates.

use std::fmt;
use std::sync::Arc;

use crate::blackboard::BlackboardObject;

type MemberFn = dyn Fn(&BlackboardObject) -> bool + Send + Sync;

/// Decides which objects belong to a subscription.
///
/// A *static* predicate is assumed to depend only on properties that never
/// change over an object's life (typically its kind), so it is only
/// evaluated when an object is first offered. A *dynamic* predicate is
/// re-evaluated on every change, and objects move in and out of the
/// subscription accordingly.
#[derive(Clone)]
pub struct Predicate {
    test: Arc<MemberFn>,
    dynamic: bool,
}

impl Predicate {
    /// A static predicate.
    pub fn new(test: impl Fn(&BlackboardObject) -> bool + Send + Sync + 'static) -> Self {
        Self {
            test: Arc::new(test),
            dynamic: false,
        }
    }

    /// A dynamic predicate, re-evaluated on every change.
    pub fn dynamic(test: impl Fn(&BlackboardObject) -> bool + Send + Sync + 'static) -> Self {
        Self {
            test: Arc::new(test),
            dynamic: true,
        }
    }

    /// Matches everything.
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Matches objects of one kind.
    pub fn of_kind(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self::new(move |o| o.kind == kind)
    }

    /// Evaluate membership.
    pub fn is_member(&self, object: &BlackboardObject) -> bool {
        (self.test)(object)
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("dynamic", &self.dynamic)
            .finish_non_exhaustive()
    }
}
