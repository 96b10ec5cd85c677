//! Two-agent demo node.
//!
//! Runs a `customer` and a `supplier` agent in one process, connected by a
//! lossy in-memory transport. The customer places an order every tick; a
//! logic provider turns each order into a directive for the supplier, whose
//! message provider books a shipment. Both agents checkpoint to SQLite, so
//! stopping and restarting the node resumes where it left off.
//!
//! # Environment Variables
//!
//! - `NODE_CONFIG`: YAML distributor config file (default: built-in defaults)
//! - `NODE_DB`: SQLite checkpoint file (default: `./data/node.db`)
//! - `NODE_TICK_MS`: Order interval in milliseconds (default: 1000)
//! - `NODE_LOSS_EVERY`: Drop every Nth directive message (default: 5, 0 = none)
//! - `RUST_LOG`: Tracing filter (default: "info,agent_blackboard=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin node
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use agent_blackboard::message::PeerReceiver;
use agent_blackboard::{
    BlackboardObject, ChannelTransport, Directive, Distributor, DistributorConfig,
    EnvelopeLogicProvider, EnvelopeTuple, IncrementalSubscription, LogicContext, LogicProvider,
    Message, MessageLogicProvider, MessageTransport, PeerId, Predicate, SqlitePersistence,
    Subscriber,
};

/// Forwards every new order to the supplier.
struct OrderDesk;

impl EnvelopeLogicProvider for OrderDesk {
    fn name(&self) -> &str {
        "order-desk"
    }

    fn execute(&self, tuple: &EnvelopeTuple, ctx: &mut LogicContext<'_>) -> anyhow::Result<()> {
        let EnvelopeTuple::Add(order) = tuple else {
            return Ok(());
        };
        if order.kind != "order" {
            return Ok(());
        }
        let directive = Directive::new(
            ctx.agent().clone(),
            "supplier",
            "order",
            serde_json::json!({ "order": order.id.to_string(), "item": order.field("item") }),
        );
        ctx.send_directive(directive);
        Ok(())
    }
}

/// Books a shipment for every order directive.
struct Warehouse;

impl MessageLogicProvider for Warehouse {
    fn name(&self) -> &str {
        "warehouse"
    }

    fn execute(&self, directive: &Directive, ctx: &mut LogicContext<'_>) -> anyhow::Result<()> {
        if directive.kind != "order" {
            anyhow::bail!("unexpected directive '{}'", directive.kind);
        }
        let shipment = BlackboardObject::new(
            ctx.next_object_id(),
            "shipment",
            serde_json::json!({
                "for": directive.source.as_str(),
                "order": directive.payload["order"],
                "booked_at": ctx.now(),
            }),
        );
        ctx.publish_add(shipment.into_ref());
        Ok(())
    }
}

fn load_config() -> anyhow::Result<DistributorConfig> {
    match std::env::var("NODE_CONFIG") {
        Ok(path) => {
            let yaml = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path))?;
            Ok(DistributorConfig::from_yaml_str(&yaml)?.with_env_overrides())
        }
        Err(_) => Ok(DistributorConfig::from_env()),
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Feed one agent's channel into its distributor until `running` clears.
fn spawn_pump(
    distributor: Arc<Distributor>,
    receiver: PeerReceiver,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("pump-{}", distributor.agent()))
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                let messages = receiver.recv_timeout(Duration::from_millis(200));
                distributor.receive_messages(messages);
            }
        })
        .expect("Failed to spawn pump thread")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_blackboard=debug".into()),
        )
        .init();

    let config = load_config()?;
    let db_path = std::env::var("NODE_DB").unwrap_or_else(|_| "./data/node.db".to_string());
    let tick = Duration::from_millis(env_u64("NODE_TICK_MS", 1_000));
    let loss_every = env_u64("NODE_LOSS_EVERY", 5);

    let persistence = Arc::new(SqlitePersistence::open(&db_path)?);
    let sent = AtomicU64::new(0);
    let transport = Arc::new(ChannelTransport::new().with_loss(move |message| {
        let Message::Directive(m) = message else {
            return false;
        };
        loss_every > 0
            && !m.is_keep_alive()
            && (sent.fetch_add(1, Ordering::Relaxed) + 1) % loss_every == 0
    }));
    let customer_rx = transport.register("customer");
    let supplier_rx = transport.register("supplier");
    let wire: Arc<dyn MessageTransport> = transport.clone();

    let customer = Distributor::builder("customer")
        .config(config.clone())
        .persistence(persistence.clone())
        .transport(wire.clone())
        .logic_provider(LogicProvider::Envelope(Arc::new(OrderDesk)))
        .start_timers(true)
        .build()?;
    let supplier = Distributor::builder("supplier")
        .config(config)
        .persistence(persistence)
        .transport(wire)
        .logic_provider(LogicProvider::Message(Arc::new(Warehouse)))
        .start_timers(true)
        .build()?;

    tracing::info!(
        "Node started: checkpoints in {}, customer resumes at epoch {}, supplier at epoch {}",
        db_path,
        customer.epoch(),
        supplier.epoch()
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            tracing::info!("Shutting down...");
            running.store(false, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let pumps = vec![
        spawn_pump(Arc::clone(&customer), customer_rx, Arc::clone(&running)),
        spawn_pump(Arc::clone(&supplier), supplier_rx, Arc::clone(&running)),
    ];

    let buyer = Subscriber::new(&customer, "buyer");
    let dispatcher = Subscriber::new(&supplier, "dispatcher");
    let shipments = dispatcher.subscribe(IncrementalSubscription::new(Predicate::of_kind("shipment")));
    let supplier_peer = PeerId::from("supplier");

    let mut placed = 0u64;
    while running.load(Ordering::SeqCst) {
        {
            let txn = buyer.transaction();
            placed += 1;
            let order = BlackboardObject::new(
                txn.next_object_id(),
                "order",
                serde_json::json!({ "item": format!("widget-{}", placed) }),
            );
            txn.publish_add(order.into_ref());
        }

        if dispatcher.wait_for_envelopes(tick) {
            let txn = dispatcher.transaction();
            for shipment in shipments.lock().added_list() {
                tracing::info!("Shipment {} booked: {}", shipment.id, shipment.payload);
            }
            drop(txn);
        }

        let outstanding = customer
            .message_manager()
            .connection(&supplier_peer)
            .map_or(0, |c| c.outstanding.len());
        tracing::debug!(
            "customer: {} objects, {} directives unacknowledged; supplier: {} objects",
            customer.object_count(),
            outstanding,
            supplier.object_count()
        );
    }

    for pump in pumps {
        if pump.join().is_err() {
            tracing::error!("Pump thread panicked");
        }
    }
    drop(buyer);
    drop(dispatcher);
    for distributor in [&customer, &supplier] {
        match distributor.persist_now() {
            Ok(checkpoint) => tracing::info!(
                "{}: final checkpoint {} stored",
                distributor.agent(),
                checkpoint.epoch
            ),
            Err(e) => tracing::warn!("{}: final checkpoint failed: {}", distributor.agent(), e),
        }
        distributor.shutdown();
    }
    Ok(())
}
