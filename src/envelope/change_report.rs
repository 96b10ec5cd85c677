//! Change reports: optional detail attached to a `Change` tuple.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blackboard::ObjectId;

/// Describes what changed in a `Change` tuple.
///
/// Reports are advisory: subscriptions and logic providers may use them to
/// skip work, but a change with no reports means "anything may have changed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeReport {
    /// A named payload field changed.
    Field { name: String },
    /// A relationship to another object changed.
    Relationship { role: String, target: ObjectId },
    /// Domain-specific report.
    Custom { kind: String, detail: Value },
}

impl ChangeReport {
    /// Shorthand for a field report.
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field { name: name.into() }
    }

    /// True if this report names the given field.
    pub fn is_field(&self, name: &str) -> bool {
        matches!(self, Self::Field { name: n } if n == name)
    }
}
