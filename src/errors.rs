//! Error types for the blackboard distribution core.
//!
//! Protocol desynchronisation is never surfaced here: the message manager
//! recovers from it locally and only logs. Everything else that a caller
//! can observe is one of the enums below.

use std::backtrace::Backtrace;
use std::fmt;

use thiserror::Error;

use crate::blackboard::ObjectId;

// ---------------------------------------------------------------------------
// Publish violations
// ---------------------------------------------------------------------------

/// Diagnostic record attached to every [`PublishError`].
///
/// Holds the stack of the offending call and, when known, the stack of
/// whoever last published the conflicting object.
#[derive(Debug, Clone)]
pub struct PublishViolation {
    /// The object the publish operation targeted.
    pub object: ObjectId,
    /// Name of the subscriber that issued the operation.
    pub subscriber: String,
    /// Rendered backtrace of the offending call.
    pub stack: String,
    /// Rendered backtrace of the previous publisher, if recorded.
    pub previous_stack: Option<String>,
}

impl PublishViolation {
    /// Capture a violation record at the current call site.
    pub fn capture(object: ObjectId, subscriber: impl Into<String>) -> Self {
        Self {
            object,
            subscriber: subscriber.into(),
            stack: Backtrace::capture().to_string(),
            previous_stack: None,
        }
    }

    /// Attach the stack of the previous publisher.
    pub fn with_previous_stack(mut self, stack: Option<String>) -> Self {
        self.previous_stack = stack;
        self
    }
}

impl fmt::Display for PublishViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (subscriber '{}')", self.object, self.subscriber)
    }
}

/// Publish-side contract violations.
///
/// These are reported, never fatal: the publish operation that raised one
/// still completes.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// The object is already on the blackboard (or already queued for add).
    #[error("object already published: {0}")]
    AlreadyPublished(PublishViolation),

    /// The object was never published, so it cannot be changed or removed.
    #[error("object not published: {0}")]
    NotPublished(PublishViolation),

    /// The operation was issued outside of any open transaction.
    #[error("publish outside of a transaction: {0}")]
    NoTransaction(PublishViolation),

    /// The transaction is open, but owned by another thread.
    #[error("publish from a thread that does not own the transaction: {0}")]
    WrongThread(PublishViolation),

    /// A claimable object is claimed by another subscriber.
    #[error("object claimed by '{claimant}': {violation}")]
    ClaimConflict {
        /// Current claimant of the object.
        claimant: String,
        /// Diagnostic record.
        violation: PublishViolation,
    },
}

impl PublishError {
    /// The diagnostic record carried by this error.
    pub fn violation(&self) -> &PublishViolation {
        match self {
            Self::AlreadyPublished(v)
            | Self::NotPublished(v)
            | Self::NoTransaction(v)
            | Self::WrongThread(v) => v,
            Self::ClaimConflict { violation, .. } => violation,
        }
    }

    /// Log this violation loudly. The stack goes to `debug`.
    pub fn report(&self) {
        log::warn!("Publish violation: {}", self);
        let violation = self.violation();
        log::debug!("Violation stack:\n{}", violation.stack);
        if let Some(previous) = &violation.previous_stack {
            log::debug!("Previous publisher stack:\n{}", previous);
        }
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Transaction-boundary errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The calling thread does not own the open transaction.
    #[error("transaction on '{subscriber}' is not owned by the calling thread")]
    NotOwner { subscriber: String },

    /// No transaction is open.
    #[error("no transaction open on '{subscriber}'")]
    NotOpen { subscriber: String },
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Errors surfaced by explicit checkpoint requests.
///
/// Background checkpoints never propagate these; they log and retry at the
/// next epoch.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// No persistence backend is configured.
    #[error("persistence is not enabled")]
    NotEnabled,

    /// The backend failed.
    #[error("persistence backend failed: {0}")]
    Backend(#[from] anyhow::Error),

    /// A checkpoint could not be encoded or decoded.
    #[error("checkpoint codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Errors returned by a [`MessageTransport`](crate::message::MessageTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// No route to the destination peer.
    #[error("no route to peer '{0}'")]
    NoRoute(String),

    /// The peer's receiving end is gone.
    #[error("peer '{0}' disconnected")]
    Disconnected(String),

    /// Encoding failure.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parse error.
    #[error("invalid configuration yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value parsed but is out of range.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

/// Errors building a [`Distributor`](crate::distributor::Distributor).
#[derive(Debug, Error)]
pub enum DistributorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Rehydration from the configured backend failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid() -> ObjectId {
        ObjectId::new("agent-a", 7)
    }

    #[test]
    fn test_violation_accessor_covers_all_variants() {
        let v = PublishViolation::capture(oid(), "sub");
        let errors = vec![
            PublishError::AlreadyPublished(v.clone()),
            PublishError::NotPublished(v.clone()),
            PublishError::NoTransaction(v.clone()),
            PublishError::WrongThread(v.clone()),
            PublishError::ClaimConflict {
                claimant: "other".into(),
                violation: v,
            },
        ];
        for e in errors {
            assert_eq!(e.violation().object, oid());
            assert_eq!(e.violation().subscriber, "sub");
        }
    }

    #[test]
    fn test_error_display() {
        let e = PublishError::AlreadyPublished(PublishViolation::capture(oid(), "planner"));
        assert_eq!(
            e.to_string(),
            "object already published: agent-a/7 (subscriber 'planner')"
        );

        let t = TransactionError::NotOwner {
            subscriber: "planner".into(),
        };
        assert!(t.to_string().contains("not owned"));
    }

    #[test]
    fn test_previous_stack_attached() {
        let v = PublishViolation::capture(oid(), "sub").with_previous_stack(Some("trace".into()));
        assert_eq!(v.previous_stack.as_deref(), Some("trace"));
    }
}
