//! Drives concurrent order traffic against an in-memory engine and reports
//! whether the audit trail still reconciles with the stock counters.
//!
//! Knobs (environment): `STOCKFLOW_SIM_PRODUCTS`, `STOCKFLOW_SIM_WORKERS`,
//! `STOCKFLOW_SIM_ORDERS` (per worker), plus every `EngineConfig` variable.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, bail};
use tracing::{info, warn};

use stockflow_core::{AggregateId, CustomerId};
use stockflow_events::InMemoryEventBus;
use stockflow_infra::{
    EngineConfig, EngineError, EngineEvent, EventWorker, InMemoryEngineStore, InventoryEngine,
};
use stockflow_inventory::ProductId;
use stockflow_sales::{LineItem, OrderId};

type Engine = InventoryEngine<Arc<InMemoryEngineStore>, Arc<InMemoryEventBus<EngineEvent>>>;

#[derive(Debug, Default)]
struct Tally {
    placed: AtomicUsize,
    rejected: AtomicUsize,
    dispatched: AtomicUsize,
    cancelled: AtomicUsize,
    returned: AtomicUsize,
    fulfilled: AtomicUsize,
}

fn env_usize(key: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer, got {v:?}")),
        Err(_) => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    stockflow_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let products = env_usize("STOCKFLOW_SIM_PRODUCTS", 5)?.max(1);
    let workers = env_usize("STOCKFLOW_SIM_WORKERS", 8)?.max(1);
    let orders = env_usize("STOCKFLOW_SIM_ORDERS", 200)?;

    let engine: Arc<Engine> = Arc::new(InventoryEngine::new(
        Arc::new(InMemoryEngineStore::new()),
        Arc::new(InMemoryEventBus::new()),
        config.clone(),
    ));
    let tally = Arc::new(Tally::default());

    let catalog: Vec<ProductId> = (0..products)
        .map(|_| ProductId::new(AggregateId::new()))
        .collect();
    for (i, product_id) in catalog.iter().enumerate() {
        engine
            .register_product(*product_id, 50 + 10 * i as i64, 15)
            .with_context(|| format!("failed to register product {product_id}"))?;
    }

    let restock_worker = (!config.inline_restock).then(|| engine.spawn_restock_worker());
    let supplier = spawn_supplier(&engine, &tally);

    info!(products, workers, orders, "simulation started");
    let started = Instant::now();

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let engine = engine.clone();
            let tally = tally.clone();
            let catalog = catalog.clone();
            thread::Builder::new()
                .name(format!("sim-worker-{worker}"))
                .spawn(move || run_worker(worker, &engine, &catalog, orders, &tally))
                .context("failed to spawn simulation worker")
        })
        .collect::<anyhow::Result<_>>()?;
    for handle in handles {
        if handle.join().is_err() {
            bail!("simulation worker panicked");
        }
    }
    let elapsed = started.elapsed();

    supplier.shutdown();
    if let Some(worker) = restock_worker {
        worker.shutdown();
    }

    let reconciliations = engine.reconcile_all().context("reconciliation failed")?;
    let drifted = reconciliations.iter().filter(|r| !r.is_consistent()).count();

    let stock: Vec<_> = catalog
        .iter()
        .map(|p| {
            engine.stock(*p).map(|record| {
                serde_json::json!({
                    "product_id": p.to_string(),
                    "total": record.level().total,
                    "reserved": record.level().reserved,
                    "available": record.available(),
                })
            })
        })
        .collect::<Result<_, EngineError>>()?;

    let summary = serde_json::json!({
        "elapsed_ms": elapsed.as_millis() as u64,
        "placed": tally.placed.load(Ordering::Relaxed),
        "rejected": tally.rejected.load(Ordering::Relaxed),
        "dispatched": tally.dispatched.load(Ordering::Relaxed),
        "cancelled": tally.cancelled.load(Ordering::Relaxed),
        "returned": tally.returned.load(Ordering::Relaxed),
        "restocks_fulfilled": tally.fulfilled.load(Ordering::Relaxed),
        "products_reconciled": reconciliations.len(),
        "products_drifted": drifted,
        "stock": stock,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if drifted > 0 {
        bail!("{drifted} product(s) do not reconcile with their audit trail");
    }
    Ok(())
}

/// Acts as the supplier: every restock request is acknowledged and then
/// delivered in full.
fn spawn_supplier(engine: &Arc<Engine>, tally: &Arc<Tally>) -> stockflow_infra::WorkerHandle {
    let engine_for_worker = engine.clone();
    let tally = tally.clone();
    EventWorker::spawn("sim-supplier", engine.bus(), move |event: EngineEvent| {
        let EngineEvent::RestockRequested {
            request_id,
            requested_quantity,
            ..
        } = event
        else {
            return Ok::<(), EngineError>(());
        };
        engine_for_worker.mark_restock_sent(request_id)?;
        let fulfillment = engine_for_worker.fulfill_restock(request_id, requested_quantity)?;
        if fulfillment.event.is_some() {
            tally.fulfilled.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    })
}

fn run_worker(worker: usize, engine: &Engine, catalog: &[ProductId], orders: usize, tally: &Tally) {
    for i in 0..orders {
        let first = catalog[(worker + i) % catalog.len()];
        let mut lines = vec![LineItem::new(first, 1 + (i % 3) as i64, 499)];
        if catalog.len() > 1 && i % 2 == 0 {
            let second = catalog[(worker + i + 1) % catalog.len()];
            lines.push(LineItem::new(second, 1, 1299));
        }

        let order_id = match engine.place_order(CustomerId::new(), lines) {
            Ok(order) => {
                tally.placed.fetch_add(1, Ordering::Relaxed);
                order.id_typed()
            }
            Err(EngineError::InsufficientStock { .. }) => {
                tally.rejected.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(err) => {
                warn!(worker, error = %err, "order failed");
                continue;
            }
        };

        if let Err(err) = settle(engine, order_id, i, tally) {
            warn!(worker, order_id = %order_id, error = %err, "order lifecycle failed");
        }
    }
}

/// Walk an order through one of the lifecycle paths.
fn settle(engine: &Engine, order_id: OrderId, i: usize, tally: &Tally) -> Result<(), EngineError> {
    match i % 5 {
        0 => {
            engine.cancel_order(order_id)?;
            tally.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        1 => {
            engine.dispatch_order(order_id)?;
            engine.deliver_order(order_id)?;
            engine.return_order(order_id)?;
            tally.dispatched.fetch_add(1, Ordering::Relaxed);
            tally.returned.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            engine.dispatch_order(order_id)?;
            engine.deliver_order(order_id)?;
            tally.dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}
