//! Distributor: the single synchronisation point of one agent.
//!
//! Every mutation of the [`Blackboard`] goes through the distributor's state
//! lock: transaction outboxes, directives received from peers, restart
//! handling and checkpoints never interleave. Logic providers run under the
//! same lock and may therefore assume they are alone.
//!
//! # Distribution
//!
//! [`distribute`](Distributor::distribute) applies an envelope to the store,
//! files it in every other subscriber's inbox and runs the envelope
//! providers over its tuples. Whatever the providers publish becomes the
//! next envelope, and so on until nothing is left, including the delayed
//! actions providers queued along the way. Directives produced during the
//! loop are sequenced by the [`MessageManager`] and put on the wire after
//! the lock is released.
//!
//! # Checkpoints
//!
//! A [`CheckpointPolicy`] says when the current epoch is due. A due
//! checkpoint sets `persist_pending`, which holds back new transactions
//! (but never aborts open ones); the last transaction to close runs it.
//! Acknowledgements for received directives, and directives this agent
//! sequences, are released only after the checkpoint that covers them is
//! stored.
//!
//! # Lock order
//!
//! subscriber state → distributor state → (admission gate | inbox |
//! message manager | provider registry). The gate is never held while
//! taking the distributor state.

mod admission;
pub mod checkpoint_policy;

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};

use admission::Admission;
pub use checkpoint_policy::{CheckpointPolicy, EpochClock};

use crate::blackboard::{Blackboard, ObjectId, ObjectIdGenerator, ObjectRef};
use crate::config::DistributorConfig;
use crate::envelope::{Envelope, EnvelopeTuple};
use crate::errors::{DistributorError, PersistenceError};
use crate::logic::context::{DelayedQueue, LogicOutput};
use crate::logic::{guarded, LogicContext, LogicProvider, LogicProviders};
use crate::message::{Directive, Message, MessageManager, MessageTransport, PeerId, ReceiveStatus};
use crate::persistence::{Checkpoint, Persistence, SubscriberCheckpoint};
use crate::subscriber::{Inbox, PublishRecord, SubscriberId};
use crate::subscription::{Predicate, Subscription};
use crate::timer::{ExecutionTimer, RealTimeTimer, SystemTimeSource, TimeSource};

type Pending = VecDeque<(Arc<Envelope>, Option<SubscriberId>)>;

// ---------------------------------------------------------------------------
// State under the distributor lock
// ---------------------------------------------------------------------------

struct Registration {
    id: SubscriberId,
    name: String,
    inbox: Weak<Inbox>,
}

/// What the store knows about an object, for publish checks.
#[derive(Debug, Clone)]
pub(crate) struct Publication {
    pub published: bool,
    pub record: Option<PublishRecord>,
}

struct DistributorState {
    store: Blackboard,
    subscribers: Vec<Registration>,
    /// Pending envelopes of rehydrated subscribers that have not
    /// registered again yet.
    rehydrated: HashMap<String, Vec<Envelope>>,
    publishers: HashMap<ObjectId, PublishRecord>,
    epoch: EpochClock,
    epoch_number: u64,
    epoch_envelopes: Vec<Envelope>,
    /// Wire messages waiting for [`Distributor::take_outgoing`] when no
    /// transport is configured.
    outgoing: Vec<Message>,
}

impl DistributorState {
    fn apply(&mut self, envelope: &Envelope) {
        self.store.apply(envelope);
        for tuple in envelope.tuples() {
            if let EnvelopeTuple::Remove(object) = tuple {
                self.publishers.remove(&object.id);
            }
        }
        if envelope.is_visible() {
            self.epoch_envelopes.push(envelope.clone());
            self.epoch.dirty = true;
        }
    }

    fn broadcast(&mut self, envelope: &Arc<Envelope>, origin: Option<SubscriberId>) {
        self.subscribers.retain(|r| r.inbox.strong_count() > 0);
        for registration in &self.subscribers {
            if Some(registration.id) == origin {
                continue;
            }
            if let Some(inbox) = registration.inbox.upgrade() {
                inbox.push(Arc::clone(envelope));
            }
        }
    }

    fn subscriber_checkpoints(&self) -> Vec<SubscriberCheckpoint> {
        let mut out: Vec<SubscriberCheckpoint> = self
            .subscribers
            .iter()
            .filter_map(|r| {
                let inbox = r.inbox.upgrade()?;
                Some(SubscriberCheckpoint {
                    name: r.name.clone(),
                    pending: inbox.undelivered(),
                })
            })
            .collect();
        out.extend(self.rehydrated.iter().map(|(name, pending)| SubscriberCheckpoint {
            name: name.clone(),
            pending: pending.clone(),
        }));
        out
    }
}

/// Clears the checkpoint flags however the checkpoint ends.
struct CheckpointGuard<'a>(&'a Distributor);

impl Drop for CheckpointGuard<'_> {
    fn drop(&mut self) {
        let mut gate = self.0.gate.lock();
        gate.checkpointing = false;
        gate.persist_pending = false;
        self.0.gate_changed.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`Distributor`], rehydrating it when a persistence backend is
/// configured.
pub struct DistributorBuilder {
    agent: PeerId,
    config: DistributorConfig,
    time_source: Arc<dyn TimeSource>,
    persistence: Option<Arc<dyn Persistence>>,
    transport: Option<Arc<dyn MessageTransport>>,
    providers: LogicProviders,
    start_timers: bool,
}

impl DistributorBuilder {
    fn new(agent: PeerId) -> Self {
        Self {
            agent,
            config: DistributorConfig::default(),
            time_source: Arc::new(SystemTimeSource),
            persistence: None,
            transport: None,
            providers: LogicProviders::new(),
            start_timers: false,
        }
    }

    pub fn config(mut self, config: DistributorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Enable checkpointing. Without a backend the agent runs unpersisted
    /// and acknowledges directives as soon as they are processed.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Put outgoing messages on `transport` and run the message manager's
    /// maintenance threads. Without one, collect them with
    /// [`Distributor::take_outgoing`].
    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn logic_provider(mut self, provider: LogicProvider) -> Self {
        self.providers.register(provider);
        self
    }

    /// Start the checkpoint and execution timer threads on build.
    pub fn start_timers(mut self, start: bool) -> Self {
        self.start_timers = start;
        self
    }

    pub fn build(self) -> Result<Arc<Distributor>, DistributorError> {
        self.config.validate()?;
        let now = self.time_source.now_millis();
        let message_manager = Arc::new(
            MessageManager::new(
                self.agent.clone(),
                self.config.messaging.clone(),
                Arc::clone(&self.time_source),
            )
            .holding_sends(self.persistence.is_some()),
        );
        let distributor = Arc::new(Distributor {
            policy: CheckpointPolicy::from_config(&self.config),
            ids: ObjectIdGenerator::new(self.agent.as_str()),
            execution_timer: ExecutionTimer::execution(
                format!("{}-execution", self.agent),
                Arc::clone(&self.time_source),
                self.config.timer_parameter_capacity,
            ),
            checkpoint_timer: RealTimeTimer::real_time(
                format!("{}-checkpoint", self.agent),
                Arc::clone(&self.time_source),
            ),
            agent: self.agent,
            config: self.config,
            time_source: self.time_source,
            persistence: self.persistence,
            transport: self.transport,
            message_manager,
            providers: RwLock::new(self.providers),
            state: Mutex::new(DistributorState {
                store: Blackboard::new(),
                subscribers: Vec::new(),
                rehydrated: HashMap::new(),
                publishers: HashMap::new(),
                epoch: EpochClock::new(now),
                epoch_number: 0,
                epoch_envelopes: Vec::new(),
                outgoing: Vec::new(),
            }),
            gate: Mutex::new(Admission::default()),
            gate_changed: Condvar::new(),
            next_subscriber: AtomicU64::new(1),
        });

        distributor.rehydrate()?;
        if let Some(transport) = &distributor.transport {
            distributor
                .message_manager
                .start_workers(Arc::clone(transport));
        }
        if self.start_timers {
            distributor.start_timers();
        }
        Ok(distributor)
    }
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

/// Per-agent distributor. Shared as `Arc<Distributor>` by its subscribers.
pub struct Distributor {
    agent: PeerId,
    config: DistributorConfig,
    policy: CheckpointPolicy,
    time_source: Arc<dyn TimeSource>,
    persistence: Option<Arc<dyn Persistence>>,
    transport: Option<Arc<dyn MessageTransport>>,
    message_manager: Arc<MessageManager>,
    execution_timer: ExecutionTimer,
    checkpoint_timer: RealTimeTimer,
    providers: RwLock<LogicProviders>,
    ids: ObjectIdGenerator,
    state: Mutex<DistributorState>,
    gate: Mutex<Admission>,
    gate_changed: Condvar,
    next_subscriber: AtomicU64,
}

impl Distributor {
    pub fn builder(agent: impl Into<PeerId>) -> DistributorBuilder {
        DistributorBuilder::new(agent.into())
    }

    pub fn agent(&self) -> &PeerId {
        &self.agent
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    pub fn message_manager(&self) -> &Arc<MessageManager> {
        &self.message_manager
    }

    pub fn execution_timer(&self) -> &ExecutionTimer {
        &self.execution_timer
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn register_logic_provider(&self, provider: LogicProvider) {
        self.providers.write().register(provider);
    }

    /// Start the background checkpoint check and the execution timer.
    pub fn start_timers(self: &Arc<Self>) {
        if self.persistence.is_some() && !self.checkpoint_timer.is_running() {
            let weak = Arc::downgrade(self);
            self.checkpoint_timer
                .schedule_periodic(self.policy.tick_interval(), move || {
                    if let Some(distributor) = weak.upgrade() {
                        distributor.checkpoint_if_due();
                    }
                });
            self.checkpoint_timer.start();
        }
        self.execution_timer.start();
    }

    /// Stop timers and messaging threads.
    pub fn shutdown(&self) {
        self.checkpoint_timer.stop();
        self.execution_timer.stop();
        self.message_manager.stop_workers();
        log::info!("Distributor[{}]: shut down", self.agent);
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn object_count(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn get(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.state.lock().store.get(id).cloned()
    }

    pub fn query(&self, predicate: &Predicate) -> Vec<ObjectRef> {
        self.state.lock().store.query(predicate)
    }

    /// Number of the last stored checkpoint.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch_number
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|r| r.inbox.strong_count() > 0);
        state.subscribers.len()
    }

    pub fn open_transactions(&self) -> usize {
        self.gate.lock().open()
    }

    pub fn is_persist_pending(&self) -> bool {
        self.gate.lock().persist_pending
    }

    pub fn next_object_id(&self) -> ObjectId {
        self.ids.next_id()
    }

    /// Wire messages due now when running without a transport: sequenced
    /// directives, acknowledgements, retransmissions and keep-alives.
    pub fn take_outgoing(&self) -> Vec<Message> {
        let mut out = std::mem::take(&mut self.state.lock().outgoing);
        out.extend(self.message_manager.due_retransmissions());
        out.extend(self.message_manager.due_keep_alives());
        out.extend(self.message_manager.take_due_acks());
        out
    }

    // -----------------------------------------------------------------------
    // Subscriber registry
    // -----------------------------------------------------------------------

    pub(crate) fn register_subscriber(&self, name: &str) -> (SubscriberId, Arc<Inbox>) {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        if state
            .subscribers
            .iter()
            .any(|r| r.name == name && r.inbox.strong_count() > 0)
        {
            log::warn!(
                "Distributor[{}]: two live subscribers named '{}'; checkpoints cannot tell them apart",
                self.agent,
                name
            );
        }
        let pending: Vec<Arc<Envelope>> = state
            .rehydrated
            .remove(name)
            .unwrap_or_default()
            .into_iter()
            .map(Arc::new)
            .collect();
        if !pending.is_empty() {
            log::info!(
                "Distributor[{}]: subscriber '{}' resumes with {} pending envelopes",
                self.agent,
                name,
                pending.len()
            );
        }
        let inbox = Arc::new(Inbox::new(name, pending));
        state.subscribers.push(Registration {
            id,
            name: name.to_string(),
            inbox: Arc::downgrade(&inbox),
        });
        (id, inbox)
    }

    pub(crate) fn deregister_subscriber(&self, id: SubscriberId) {
        self.state.lock().subscribers.retain(|r| r.id != id);
    }

    /// Fill a new subscription with the store as it was before the
    /// envelopes still waiting in `inbox`.
    pub(crate) fn fill_subscription<S: Subscription + ?Sized>(&self, inbox: &Inbox, subscription: &mut S) {
        let snapshot = {
            let state = self.state.lock();
            let mut snapshot = state.store.snapshot();
            inbox.with_pending(|pending| {
                for envelope in pending.iter().rev() {
                    envelope.unapply_from(&mut snapshot);
                }
            });
            snapshot
        };
        let mut fill = Envelope::persistence();
        if !snapshot.is_empty() {
            fill.bulk_add(snapshot.into_values().collect());
        }
        fill.apply_to_subscription(subscription);
    }

    pub(crate) fn publication(&self, id: &ObjectId) -> Publication {
        let state = self.state.lock();
        Publication {
            published: state.store.contains(id),
            record: state.publishers.get(id).cloned(),
        }
    }

    pub(crate) fn record_publisher(&self, id: ObjectId, record: PublishRecord) {
        self.state.lock().publishers.entry(id).or_insert(record);
    }

    // -----------------------------------------------------------------------
    // Transaction admission
    // -----------------------------------------------------------------------

    /// Admit a transaction on the calling thread, waiting while a
    /// checkpoint is pending.
    pub fn start_transaction(&self) {
        let me = thread::current().id();
        let mut gate = self.gate.lock();
        while gate.persist_pending && !gate.holds(me) {
            self.gate_changed.wait(&mut gate);
        }
        gate.admit(me);
    }

    /// Distribute a closed transaction's outbox and release its admission.
    ///
    /// A panic during distribution is logged; the transaction is released
    /// regardless.
    pub fn finish_transaction(&self, client: SubscriberId, outbox: Arc<Envelope>) {
        if !outbox.is_empty() {
            let result = catch_unwind(AssertUnwindSafe(|| self.distribute(outbox, Some(client))));
            if let Err(panic) = result {
                log::error!("Distributor[{}]: distribution panicked: {:?}", self.agent, panic);
            }
        }
        self.release(thread::current().id());
    }

    /// Release a transaction whose subscriber went away while it was open.
    pub(crate) fn abandon_transaction(&self, owner: ThreadId) {
        self.release(owner);
    }

    fn release(&self, thread: ThreadId) {
        let quiescent = {
            let mut gate = self.gate.lock();
            if !gate.release(thread) {
                log::warn!(
                    "Distributor[{}]: transaction finished by a thread that never started one",
                    self.agent
                );
            }
            self.gate_changed.notify_all();
            gate.open() == 0
        };
        if quiescent {
            self.checkpoint_if_due();
        }
    }

    // -----------------------------------------------------------------------
    // Distribution
    // -----------------------------------------------------------------------

    /// Apply `outbox` and everything it cascades into. `client` (the
    /// producer) does not get `outbox` in its inbox; cascades go to all.
    pub fn distribute(&self, outbox: Arc<Envelope>, client: Option<SubscriberId>) {
        let wire = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            self.flag_if_due(state);
            let providers = self.providers.read();
            let directives = self.run_to_fixed_point(
                state,
                &providers,
                VecDeque::from([(outbox, client)]),
                DelayedQueue::default(),
                Vec::new(),
            );
            self.sequence(state, directives)
        };
        self.transmit(wire);
    }

    fn run_to_fixed_point(
        &self,
        state: &mut DistributorState,
        providers: &LogicProviders,
        mut queue: Pending,
        mut delayed: DelayedQueue,
        mut directives: Vec<Directive>,
    ) -> Vec<Directive> {
        let now = self.execution_timer.current_time_millis();
        let limit = self.config.max_distribution_rounds;
        let mut rounds = 0u32;
        while !queue.is_empty() || !delayed.is_empty() {
            rounds += 1;
            if rounds > limit {
                log::error!(
                    "Distributor[{}]: no fixed point after {} rounds; dropping {} envelopes and {} delayed actions",
                    self.agent,
                    limit,
                    queue.len(),
                    delayed.drain().len()
                );
                break;
            }

            let output = match queue.pop_front() {
                Some((envelope, origin)) => {
                    if envelope.is_empty() {
                        continue;
                    }
                    state.apply(&envelope);
                    state.broadcast(&envelope, origin);
                    if !envelope.is_visible() || !providers.has_envelope_providers() {
                        continue;
                    }
                    let mut ctx = LogicContext::new(&self.agent, &state.store, &self.ids, now);
                    for tuple in envelope.tuples() {
                        providers.dispatch_tuple(tuple, &mut ctx);
                    }
                    ctx.into_output()
                }
                None => {
                    let mut ctx = LogicContext::new(&self.agent, &state.store, &self.ids, now);
                    for (key, action) in delayed.drain() {
                        guarded(&key, || action(&mut ctx));
                    }
                    ctx.into_output()
                }
            };
            absorb(output, &mut queue, &mut delayed, &mut directives);
        }
        directives
    }

    /// Hand directives to the message manager. Returns what to transmit
    /// once the lock is released.
    fn sequence(&self, state: &mut DistributorState, directives: Vec<Directive>) -> Vec<Message> {
        let (to_self, directives): (Vec<Directive>, Vec<Directive>) = directives
            .into_iter()
            .partition(|d| d.destination == self.agent);
        for directive in to_self {
            log::warn!(
                "Distributor[{}]: dropping directive '{}' addressed to itself",
                self.agent,
                directive.kind
            );
        }
        if directives.is_empty() {
            return Vec::new();
        }
        let messages = self.message_manager.send_directives(directives);
        if self.transport.is_some() {
            messages
        } else {
            state.outgoing.extend(messages);
            Vec::new()
        }
    }

    /// Put released messages on the wire when a transport is configured;
    /// otherwise they wait for [`take_outgoing`](Self::take_outgoing).
    fn flush_outgoing(&self) {
        if self.transport.is_none() {
            return;
        }
        let wire = std::mem::take(&mut self.state.lock().outgoing);
        self.transmit(wire);
    }

    fn transmit(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        if let Some(transport) = &self.transport {
            self.message_manager.transmit(transport.as_ref(), messages);
        }
    }

    // -----------------------------------------------------------------------
    // Messages from peers
    // -----------------------------------------------------------------------

    /// Process directive and ack messages from peers.
    ///
    /// Directives pass the message manager's sequence checks before message
    /// providers see them; restarts and resynchronisations run the restart
    /// providers. The resulting deltas are distributed like an outbox.
    pub fn receive_messages(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let wire = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let providers = self.providers.read();
            let now = self.execution_timer.current_time_millis();
            let mut ctx = LogicContext::new(&self.agent, &state.store, &self.ids, now);
            let mut delivered = false;
            for message in messages {
                match message {
                    Message::Ack(ack) => {
                        self.message_manager.receive_ack(&ack);
                    }
                    Message::Directive(message) => {
                        let status = self.message_manager.receive_directive_message(&message);
                        if matches!(status, ReceiveStatus::Restart { .. } | ReceiveStatus::Desync) {
                            providers.dispatch_restart(Some(&message.source), &mut ctx);
                        }
                        if status.deliverable() {
                            delivered = true;
                            for directive in &message.directives {
                                providers.dispatch_directive(directive, &mut ctx);
                            }
                        }
                    }
                }
            }
            let output = ctx.into_output();
            if delivered {
                state.epoch.dirty = true;
            }

            let mut queue = Pending::new();
            let mut delayed = DelayedQueue::default();
            let mut directives = Vec::new();
            absorb(output, &mut queue, &mut delayed, &mut directives);
            let directives = self.run_to_fixed_point(state, &providers, queue, delayed, directives);
            if self.persistence.is_none() {
                self.message_manager.commit_acks();
            }
            self.sequence(state, directives)
        };
        self.transmit(wire);
        self.checkpoint_if_due();
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn flag_if_due(&self, state: &DistributorState) {
        if self.persistence.is_none() {
            return;
        }
        let now = self.time_source.now_millis();
        let waiting = self.message_manager.has_uncommitted_acks() || self.message_manager.has_held_sends();
        if self.policy.is_due(&state.epoch, now, waiting) {
            let mut gate = self.gate.lock();
            if !gate.persist_pending {
                log::debug!("Distributor[{}]: checkpoint due, holding new transactions", self.agent);
            }
            gate.persist_pending = true;
        }
    }

    /// Checkpoint now if the policy says so and no transaction is open.
    /// If transactions are open, the last one to close runs it.
    ///
    /// Failures are logged and retried one interval later.
    pub fn checkpoint_if_due(&self) -> bool {
        if self.persistence.is_none() {
            return false;
        }
        {
            let state = self.state.lock();
            self.flag_if_due(&state);
        }
        if !self.gate.lock().claim_pending_checkpoint() {
            return false;
        }

        let stored = {
            let _guard = CheckpointGuard(self);
            let mut state = self.state.lock();
            match self.checkpoint_locked(&mut state, None, true) {
                Ok(_) => true,
                Err(e) => {
                    log::warn!(
                        "Distributor[{}]: background checkpoint failed, retrying next epoch: {}",
                        self.agent,
                        e
                    );
                    state.epoch.started_at = self.time_source.now_millis();
                    false
                }
            }
        };
        self.flush_outgoing();
        stored
    }

    /// Checkpoint now, after every transaction not owned by the calling
    /// thread has closed.
    pub fn persist_now(&self) -> Result<Checkpoint, PersistenceError> {
        if self.persistence.is_none() {
            return Err(PersistenceError::NotEnabled);
        }
        let result = self.exclusive(|state| self.checkpoint_locked(state, None, true));
        self.flush_outgoing();
        result
    }

    /// Full snapshot of the agent, taken like [`persist_now`](Self::persist_now).
    /// Stored as well when a backend is configured.
    pub fn get_state(&self) -> Result<Checkpoint, PersistenceError> {
        let persist = self.persistence.is_some();
        let result = self.exclusive(|state| self.checkpoint_locked(state, Some(true), persist));
        self.flush_outgoing();
        result
    }

    fn exclusive<R>(&self, f: impl FnOnce(&mut DistributorState) -> R) -> R {
        let me = thread::current().id();
        {
            let mut gate = self.gate.lock();
            while gate.checkpointing {
                self.gate_changed.wait(&mut gate);
            }
            gate.checkpointing = true;
            gate.persist_pending = true;
            while gate.open_by_others(me) > 0 {
                self.gate_changed.wait(&mut gate);
            }
        }
        let _guard = CheckpointGuard(self);
        let mut state = self.state.lock();
        f(&mut state)
    }

    fn checkpoint_locked(
        &self,
        state: &mut DistributorState,
        full: Option<bool>,
        persist: bool,
    ) -> Result<Checkpoint, PersistenceError> {
        let full = full.unwrap_or_else(|| self.policy.next_is_full(&state.epoch));
        let message_state = self.message_manager.snapshot();
        let checkpoint = Checkpoint {
            agent: self.agent.to_string(),
            epoch: state.epoch_number + 1,
            full,
            baseline: full.then(|| state.store.to_persistence_envelope()),
            envelopes: if full {
                Vec::new()
            } else {
                state.epoch_envelopes.clone()
            },
            subscribers: state.subscriber_checkpoints(),
            message_state: Some(message_state.clone()),
            open_transactions: self.gate.lock().open(),
            created_at: Utc::now(),
        };
        if !persist {
            return Ok(checkpoint);
        }

        let backend = self.persistence.as_ref().ok_or(PersistenceError::NotEnabled)?;
        backend.persist(&checkpoint)?;
        state.epoch_number = checkpoint.epoch;
        state.epoch.completed(self.time_source.now_millis());
        state.epoch_envelopes.clear();
        self.message_manager.commit_acks();
        let released = self.message_manager.commit_sends(&message_state);
        state.outgoing.extend(released);
        log::info!(
            "Distributor[{}]: {} checkpoint {} stored ({} objects, {} subscribers)",
            self.agent,
            if full { "full" } else { "delta" },
            checkpoint.epoch,
            state.store.len(),
            checkpoint.subscribers.len()
        );
        Ok(checkpoint)
    }

    /// Resume from the backend's latest checkpoint. Returns false on a cold
    /// start. Called by the builder before any subscriber exists.
    fn rehydrate(&self) -> Result<bool, PersistenceError> {
        let Some(backend) = &self.persistence else {
            return Ok(false);
        };
        let Some(result) = backend.rehydrate(self.agent.as_str())? else {
            log::info!("Distributor[{}]: no checkpoint, cold start", self.agent);
            return Ok(false);
        };

        let wire = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.store.clear();
            state.store.apply(&result.baseline);
            self.ids
                .skip_past(state.store.max_sequence_for(self.agent.as_str()));
            state.epoch_number = result.epoch;
            state.epoch = EpochClock::new(self.time_source.now_millis());
            state.epoch_envelopes.clear();
            state.rehydrated = result
                .subscribers
                .into_iter()
                .map(|s| (s.name, s.pending))
                .collect();
            if let Some(message_state) = result.message_state {
                self.message_manager.restore(message_state);
            }
            log::info!(
                "Distributor[{}]: rehydrated epoch {} ({} objects, {} subscribers pending)",
                self.agent,
                state.epoch_number,
                state.store.len(),
                state.rehydrated.len()
            );

            let providers = self.providers.read();
            let now = self.execution_timer.current_time_millis();
            let mut ctx = LogicContext::new(&self.agent, &state.store, &self.ids, now);
            providers.dispatch_restart(None, &mut ctx);
            let output = ctx.into_output();

            let mut queue = Pending::new();
            let mut delayed = DelayedQueue::default();
            let mut directives = Vec::new();
            absorb(output, &mut queue, &mut delayed, &mut directives);
            let directives = self.run_to_fixed_point(state, &providers, queue, delayed, directives);
            self.sequence(state, directives)
        };
        self.transmit(wire);
        Ok(true)
    }
}

fn absorb(
    output: LogicOutput,
    queue: &mut Pending,
    delayed: &mut DelayedQueue,
    directives: &mut Vec<Directive>,
) {
    if !output.cascade.is_empty() {
        queue.push_back((Arc::new(output.cascade), None));
    }
    directives.extend(output.directives);
    delayed.extend(output.delayed);
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.message_manager.stop_workers();
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("agent", &self.agent)
            .field("persistence", &self.persistence.is_some())
            .field("transport", &self.transport.is_some())
            .finish()
    }
}
