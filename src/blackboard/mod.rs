//! Blackboard: the transactionally mutated object store of one agent.
//!
//! Objects are identified by [`ObjectId`] and carried between components as
//! shared [`ObjectRef`] handles. The [`Blackboard`] store itself is owned by
//! the [`Distributor`](crate::distributor::Distributor), which is the only
//! component allowed to apply envelopes to it.
//!
//! # Publish Policy
//!
//! Instead of marker capabilities on the object type, each object carries a
//! [`PublishPolicy`] that the publishing subscriber resolves once per call:
//! passive objects publish unconditionally, active objects consult veto
//! hooks, claimable objects are claimed by their first publisher.

pub mod object;
pub mod store;

pub use object::{BlackboardObject, ObjectId, ObjectIdGenerator, ObjectRef, PublishPolicy};
pub use store::Blackboard;
