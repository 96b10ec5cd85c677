//! Logic providers: business rules the distributor runs while it holds
//! the agent lock.
//!
//! Three shapes, registered into separate typed collections:
//!
//! - [`EnvelopeLogicProvider`]: once per tuple of every distributed
//!   envelope. `Bulk` tuples carry pre-existing state and are skipped unless
//!   the provider opts in with [`accepts_bulk`](EnvelopeLogicProvider::accepts_bulk).
//! - [`MessageLogicProvider`]: once per directive accepted from a peer.
//! - [`RestartLogicProvider`]: when a peer restarted or the connection to
//!   it was resynchronised (`Some(peer)`), and when this agent resumes from
//!   a checkpoint (`None`).
//!
//! Providers run single-threaded and publish through a [`LogicContext`];
//! whatever they publish is applied in the next distribution round. A
//! failing or panicking provider is logged and the remaining providers for
//! the same tuple still run.

pub mod context;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub use context::{DelayedAction, LogicContext};

use crate::envelope::EnvelopeTuple;
use crate::message::{Directive, PeerId};

// ---------------------------------------------------------------------------
// Provider traits
// ---------------------------------------------------------------------------

/// Reacts to blackboard deltas.
pub trait EnvelopeLogicProvider: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, tuple: &EnvelopeTuple, ctx: &mut LogicContext<'_>) -> anyhow::Result<()>;

    /// Whether `Bulk` tuples (initial fill, resynchronisation) are delivered.
    fn accepts_bulk(&self) -> bool {
        false
    }
}

/// Reacts to directives from other agents.
pub trait MessageLogicProvider: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, directive: &Directive, ctx: &mut LogicContext<'_>) -> anyhow::Result<()>;
}

/// Reacts to restarts.
pub trait RestartLogicProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `peer` is the agent that restarted, or `None` for this agent.
    fn restart(&self, peer: Option<&PeerId>, ctx: &mut LogicContext<'_>) -> anyhow::Result<()>;
}

/// A provider tagged with its shape.
#[derive(Clone)]
pub enum LogicProvider {
    Envelope(Arc<dyn EnvelopeLogicProvider>),
    Message(Arc<dyn MessageLogicProvider>),
    Restart(Arc<dyn RestartLogicProvider>),
}

impl LogicProvider {
    pub fn name(&self) -> &str {
        match self {
            Self::Envelope(p) => p.name(),
            Self::Message(p) => p.name(),
            Self::Restart(p) => p.name(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registered providers, in registration order per shape.
#[derive(Default, Clone)]
pub struct LogicProviders {
    envelope: Vec<Arc<dyn EnvelopeLogicProvider>>,
    message: Vec<Arc<dyn MessageLogicProvider>>,
    restart: Vec<Arc<dyn RestartLogicProvider>>,
}

impl LogicProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: LogicProvider) {
        log::debug!("LogicProviders: registering '{}'", provider.name());
        match provider {
            LogicProvider::Envelope(p) => self.envelope.push(p),
            LogicProvider::Message(p) => self.message.push(p),
            LogicProvider::Restart(p) => self.restart.push(p),
        }
    }

    pub fn len(&self) -> usize {
        self.envelope.len() + self.message.len() + self.restart.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_envelope_providers(&self) -> bool {
        !self.envelope.is_empty()
    }

    /// Run every envelope provider on one tuple.
    pub(crate) fn dispatch_tuple(&self, tuple: &EnvelopeTuple, ctx: &mut LogicContext<'_>) {
        for provider in &self.envelope {
            if tuple.is_bulk() && !provider.accepts_bulk() {
                continue;
            }
            guarded(provider.name(), || provider.execute(tuple, ctx));
        }
    }

    /// Run every message provider on one directive.
    pub(crate) fn dispatch_directive(&self, directive: &Directive, ctx: &mut LogicContext<'_>) {
        for provider in &self.message {
            guarded(provider.name(), || provider.execute(directive, ctx));
        }
    }

    /// Run every restart provider.
    pub(crate) fn dispatch_restart(&self, peer: Option<&PeerId>, ctx: &mut LogicContext<'_>) {
        for provider in &self.restart {
            guarded(provider.name(), || provider.restart(peer, ctx));
        }
    }
}

/// Run one provider invocation, logging errors and panics.
pub(crate) fn guarded(name: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Logic provider '{}' failed: {:#}", name, e),
        Err(panic) => log::error!("Logic provider '{}' panicked: {:?}", name, panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::{Blackboard, BlackboardObject, ObjectId, ObjectIdGenerator};
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        bulk: bool,
        seen: Mutex<Vec<String>>,
    }

    impl EnvelopeLogicProvider for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(&self, tuple: &EnvelopeTuple, _ctx: &mut LogicContext<'_>) -> anyhow::Result<()> {
            self.seen.lock().push(format!("{:?}", tuple.action()));
            Ok(())
        }

        fn accepts_bulk(&self) -> bool {
            self.bulk
        }
    }

    struct Exploder;

    impl EnvelopeLogicProvider for Exploder {
        fn name(&self) -> &str {
            "exploder"
        }

        fn execute(&self, _tuple: &EnvelopeTuple, _ctx: &mut LogicContext<'_>) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    struct Failing;

    impl MessageLogicProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn execute(&self, _d: &Directive, _ctx: &mut LogicContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("rejected")
        }
    }

    fn recorder(name: &'static str, bulk: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            bulk,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_bulk_skipped_unless_accepted() {
        let plain = recorder("plain", false);
        let filler = recorder("filler", true);
        let mut providers = LogicProviders::new();
        providers.register(LogicProvider::Envelope(plain.clone()));
        providers.register(LogicProvider::Envelope(filler.clone()));

        let agent = PeerId::new("a");
        let store = Blackboard::new();
        let ids = ObjectIdGenerator::new("a");
        let mut ctx = LogicContext::new(&agent, &store, &ids, 0);
        let obj = BlackboardObject::new(ObjectId::new("a", 1), "task", serde_json::Value::Null).into_ref();

        providers.dispatch_tuple(&EnvelopeTuple::Bulk(vec![obj.clone()]), &mut ctx);
        providers.dispatch_tuple(&EnvelopeTuple::Add(obj), &mut ctx);

        assert_eq!(*plain.seen.lock(), vec!["Add"]);
        assert_eq!(*filler.seen.lock(), vec!["Bulk", "Add"]);
    }

    #[test]
    fn test_panic_does_not_stop_later_providers() {
        let after = recorder("after", false);
        let mut providers = LogicProviders::new();
        providers.register(LogicProvider::Envelope(Arc::new(Exploder)));
        providers.register(LogicProvider::Envelope(after.clone()));
        providers.register(LogicProvider::Message(Arc::new(Failing)));
        assert_eq!(providers.len(), 3);

        let agent = PeerId::new("a");
        let store = Blackboard::new();
        let ids = ObjectIdGenerator::new("a");
        let mut ctx = LogicContext::new(&agent, &store, &ids, 0);
        let obj = BlackboardObject::new(ObjectId::new("a", 1), "task", serde_json::Value::Null).into_ref();

        providers.dispatch_tuple(&EnvelopeTuple::Event(obj), &mut ctx);
        providers.dispatch_directive(&Directive::new("b", "a", "x", serde_json::Value::Null), &mut ctx);
        assert_eq!(*after.seen.lock(), vec!["Event"]);
    }
}
