//! Publish policing: veto hooks, claims and the outcome of a publish call.

use crate::blackboard::BlackboardObject;
use crate::envelope::ChangeReport;
use crate::errors::PublishError;

/// Veto hooks for [`PublishPolicy::Active`](crate::blackboard::PublishPolicy::Active)
/// objects, registered on a subscriber per object kind.
///
/// Returning `false` cancels the publish; nothing reaches the outbox.
pub trait PublishVeto: Send + Sync {
    fn adding(&self, _object: &BlackboardObject) -> bool {
        true
    }

    fn changing(&self, _object: &BlackboardObject, _changes: &[ChangeReport]) -> bool {
        true
    }

    fn removing(&self, _object: &BlackboardObject) -> bool {
        true
    }
}

/// Who published an object, kept by the distributor for diagnostics and
/// claims.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub subscriber: String,
    /// Rendered backtrace of the add.
    pub stack: String,
    /// The object is claimable and `subscriber` holds the claim.
    pub claimed: bool,
}

/// Result of a publish operation.
#[derive(Debug)]
pub enum PublishOutcome {
    /// Queued in the outbox.
    Published,
    /// Cancelled by a veto hook.
    Vetoed,
    /// Queued in the outbox, but the call broke a publish contract. The
    /// violation has already been logged.
    Reported(PublishError),
}

impl PublishOutcome {
    /// True unless the publish was vetoed.
    pub fn is_published(&self) -> bool {
        !matches!(self, Self::Vetoed)
    }

    pub fn violation(&self) -> Option<&PublishError> {
        match self {
            Self::Reported(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn from_violation(violation: Option<PublishError>) -> Self {
        match violation {
            Some(e) => {
                e.report();
                Self::Reported(e)
            }
            None => Self::Published,
        }
    }
}
