//! # Agent Blackboard
//!
//! The transactional state-distribution core of a multi-agent runtime.
//!
//! Each agent owns a [`Blackboard`] of shared objects and a [`Distributor`]
//! that serialises every change to it. Components ([`Subscriber`]s) read the
//! blackboard through [`subscription`]s that are brought up to date when a
//! transaction opens, and publish adds, changes, removes and events that the
//! distributor applies when it closes. Logic providers react to those
//! changes and to [`Directive`]s from other agents; directives travel
//! through the [`MessageManager`], which sequences, acknowledges and
//! retransmits them across restarts. State is checkpointed through a
//! [`Persistence`] backend and rehydrated on start. Logic providers read
//! time from an [`ExecutionTimer`], a logical clock that can be advanced or
//! scaled without ever running backwards.

pub mod blackboard;
pub mod config;
pub mod distributor;
pub mod envelope;
pub mod errors;
pub mod logic;
pub mod message;
pub mod persistence;
pub mod subscriber;
pub mod subscription;
pub mod timer;

pub use blackboard::{Blackboard, BlackboardObject, ObjectId, ObjectRef, PublishPolicy};
pub use config::{DistributorConfig, MessagingConfig};
pub use distributor::{Distributor, DistributorBuilder};
pub use envelope::{ChangeReport, Envelope, EnvelopeAction, EnvelopeTuple};
pub use errors::{
    ConfigError, DistributorError, PersistenceError, PublishError, TransactionError, TransportError,
};
pub use logic::{
    EnvelopeLogicProvider, LogicContext, LogicProvider, MessageLogicProvider, RestartLogicProvider,
};
pub use message::{ChannelTransport, Directive, Message, MessageManager, MessageTransport, PeerId};
pub use persistence::{Checkpoint, MemoryPersistence, Persistence, SqlitePersistence};
pub use subscriber::{PublishOutcome, Subscriber, Transaction};
pub use subscription::{
    CollectionSubscription, IncrementalSubscription, Predicate, SortedSubscription, Subscription,
};
pub use timer::{ExecutionTimer, RealTimeTimer, TimeChange, TimeSource, TimerParameters};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
